//! Schema-compilation and query-execution engine over declarative data
//! models.
//!
//! Entity descriptors from a [`MetadataProvider`](modelql_datasource::MetadataProvider)
//! are compiled into a queryable schema: object, input, filter and connection
//! types plus root fields per entity. Requests are parsed, gated on
//! complexity and depth, resolved breadth-first with batched relation loads,
//! checked against a pluggable permission chain and served through
//! tag-invalidated cache tiers.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use modelql_datasource::{EntityDescriptor, FieldDescriptor, MemoryDatasource, ScalarType};
//! use modelql_engine::{Engine, EngineConfig, EngineRequest, PolicyChain};
//!
//! # async fn run() -> Result<(), modelql_engine::EngineError> {
//! let datasource = Arc::new(MemoryDatasource::new(vec![
//!     EntityDescriptor::new("User")
//!         .with_field(FieldDescriptor::new("username", ScalarType::String).required()),
//! ]));
//!
//! let engine = Engine::new(
//!     EngineConfig::default(),
//!     datasource.clone(),
//!     datasource,
//!     PolicyChain::allow_all(),
//! )?;
//!
//! let response = engine
//!     .execute(EngineRequest::new("{ users { totalCount } }"))
//!     .await;
//! assert!(response.is_ok());
//! # Ok(())
//! # }
//! ```

pub mod analyze;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod metadata;
mod mutation;
pub mod permissions;
pub mod schema;

pub use analyze::{Limits, QueryBudget, analyze};
pub use cache::{CacheManager, CacheTier};
pub use config::{EngineConfig, FieldVisibility};
pub use context::{CancelFlag, Identity, RequestContext};
pub use error::{EngineError, ErrorKind, FieldError, PathSegment, SchemaError};
pub use executor::{Engine, EngineRequest, Response};
pub use permissions::{AccessDecision, AllowAll, PermissionPolicy, PolicyChain};
pub use schema::{Fingerprint, GenerationOptions, Schema, SchemaRegistry};
