//! Canonical model metadata and the introspector that produces it.

mod introspect;
mod types;

pub use introspect::Introspector;
pub use types::{FieldMetadata, ModelMetadata, RelationMetadata};
