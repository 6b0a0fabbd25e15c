//! # modelql-datasource
//!
//! Data-source abstraction layer for the modelql engine.
//!
//! This crate defines the traits and types the engine uses to talk to the
//! outside world. It contains no query logic of its own - the engine plans
//! and batches, the data source merely describes and fetches.
//!
//! ## Overview
//!
//! Two traits form the boundary:
//!
//! - [`MetadataProvider`] - describes the data model (entities, fields,
//!   relations) without any assumption about the underlying storage.
//! - [`Datasource`] - executes coarse-grained fetches and writes. The engine
//!   never issues storage-specific queries itself.
//!
//! ## Example
//!
//! ```ignore
//! use modelql_datasource::{Datasource, FetchRequest, KeySet};
//!
//! async fn load_posts(
//!     ds: &dyn Datasource,
//!     author_ids: Vec<serde_json::Value>,
//! ) -> Result<Vec<modelql_datasource::Record>, modelql_datasource::DatasourceError> {
//!     let request = FetchRequest::new("Post")
//!         .with_keys(KeySet::new("author_id", author_ids));
//!     ds.fetch(&request).await
//! }
//! ```
//!
//! ## Backends
//!
//! [`MemoryDatasource`] is a complete in-memory implementation of both traits
//! used by tests and demos. Production backends implement the same traits in
//! their own crates.

mod error;
mod memory;
mod traits;
mod types;

pub use error::DatasourceError;
pub use memory::MemoryDatasource;
pub use traits::{Datasource, DynDatasource, DynMetadataProvider, MetadataProvider};
pub use types::{
    Condition, EntityDescriptor, FieldCondition, FieldDescriptor, FetchRequest, Filter, KeySet,
    Record, RelationDescriptor, RelationKind, ScalarType, WriteOp,
};

/// Type alias for a data-source result.
pub type DatasourceResult<T> = Result<T, DatasourceError>;
