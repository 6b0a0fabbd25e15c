//! The two traits every backend implements.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DatasourceError;
use crate::types::{EntityDescriptor, FetchRequest, Record, WriteOp};

/// Source of entity/field/relation descriptions.
///
/// The engine introspects the provider once per schema build. Providers make
/// no assumption about the underlying storage technology; a provider backed
/// by static configuration is as valid as one reflecting over a database.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Lists every entity in the data model.
    async fn list_entities(&self) -> Result<Vec<EntityDescriptor>, DatasourceError>;
}

/// Executes fetches and writes on behalf of the engine.
///
/// The engine owns planning and batching; implementations only need to honor
/// the filter and key-set semantics of [`FetchRequest`].
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Fetches records matching the request.
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Record>, DatasourceError>;

    /// Applies a durable write and returns the affected record.
    ///
    /// For deletes the returned record is the state prior to deletion.
    async fn apply(&self, entity: &str, op: WriteOp) -> Result<Record, DatasourceError>;
}

/// Type alias for a shared metadata provider.
pub type DynMetadataProvider = Arc<dyn MetadataProvider>;

/// Type alias for a shared data source.
pub type DynDatasource = Arc<dyn Datasource>;
