//! Schema compilation: plain-data type descriptors, the builder that derives
//! them from model metadata, and the fingerprint-keyed registry.

mod registry;
mod type_builder;
mod types;

pub use registry::SchemaRegistry;
pub use type_builder::TypeBuilder;
pub use types::{
    Fingerprint, FilterField, FilterOp, GeneratedType, GenerationOptions, RootBinding, RootKind,
    Schema, TypeBody, TypeField, TypeKind, TypeRef,
};
