//! In-memory data source used by tests and demos.
//!
//! `MemoryDatasource` implements both [`MetadataProvider`] and [`Datasource`]
//! over concurrent hash maps. It also counts `fetch` invocations, which lets
//! tests assert on batching behavior without instrumenting the engine.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::DatasourceError;
use crate::traits::{Datasource, MetadataProvider};
use crate::types::{EntityDescriptor, FetchRequest, Record, WriteOp};

/// In-memory implementation of the data-source boundary.
pub struct MemoryDatasource {
    /// Entity descriptors served by the provider side.
    entities: Vec<EntityDescriptor>,
    /// Records per entity, keyed by primary-key string.
    tables: DashMap<String, DashMap<String, Record>>,
    /// Number of `fetch` calls issued since construction or the last reset.
    fetch_calls: AtomicUsize,
}

impl MemoryDatasource {
    /// Creates a data source serving the given model.
    #[must_use]
    pub fn new(entities: Vec<EntityDescriptor>) -> Self {
        let tables = DashMap::new();
        for entity in &entities {
            tables.insert(entity.name.clone(), DashMap::new());
        }
        Self {
            entities,
            tables,
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Inserts records directly, bypassing validation. Test fixture helper.
    ///
    /// # Panics
    ///
    /// Panics if the entity is unknown or a record lacks its primary key.
    pub fn seed(&self, entity: &str, records: impl IntoIterator<Item = Record>) {
        let pk = self
            .primary_key(entity)
            .unwrap_or_else(|| panic!("unknown entity {entity}"))
            .to_string();
        let table = self.tables.get(entity).expect("table exists for entity");
        for record in records {
            let id = record
                .get(&pk)
                .and_then(Value::as_str)
                .unwrap_or_else(|| panic!("seed record for {entity} missing {pk}"))
                .to_string();
            table.insert(id, record);
        }
    }

    /// Returns the number of `fetch` calls issued so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Resets the `fetch` call counter.
    pub fn reset_fetch_count(&self) {
        self.fetch_calls.store(0, Ordering::SeqCst);
    }

    fn primary_key(&self, entity: &str) -> Option<&str> {
        self.entities
            .iter()
            .find(|e| e.name == entity)
            .map(|e| e.primary_key.as_str())
    }

    fn table(
        &self,
        entity: &str,
    ) -> Result<dashmap::mapref::one::Ref<'_, String, DashMap<String, Record>>, DatasourceError>
    {
        self.tables
            .get(entity)
            .ok_or_else(|| DatasourceError::unknown_entity(entity))
    }
}

#[async_trait]
impl MetadataProvider for MemoryDatasource {
    async fn list_entities(&self) -> Result<Vec<EntityDescriptor>, DatasourceError> {
        Ok(self.entities.clone())
    }
}

#[async_trait]
impl Datasource for MemoryDatasource {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Record>, DatasourceError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let pk = self
            .primary_key(&request.entity)
            .ok_or_else(|| DatasourceError::unknown_entity(&request.entity))?
            .to_string();
        let table = self.table(&request.entity)?;

        let mut results = Vec::new();
        for item in table.iter() {
            let record = item.value();
            if let Some(keys) = &request.keys
                && !keys.matches(record)
            {
                continue;
            }
            if let Some(filter) = &request.filter
                && !filter.matches(record)
            {
                continue;
            }
            results.push(record.clone());
        }

        // Map iteration order is arbitrary; order by primary key so
        // pagination over repeated fetches is stable.
        results.sort_by(|a, b| {
            let ka = a.get(&pk).map(Value::to_string).unwrap_or_default();
            let kb = b.get(&pk).map(Value::to_string).unwrap_or_default();
            ka.cmp(&kb)
        });

        trace!(
            entity = %request.entity,
            keyed = request.keys.is_some(),
            matched = results.len(),
            "Memory fetch"
        );
        Ok(results)
    }

    async fn apply(&self, entity: &str, op: WriteOp) -> Result<Record, DatasourceError> {
        let pk = self
            .primary_key(entity)
            .ok_or_else(|| DatasourceError::unknown_entity(entity))?
            .to_string();
        let table = self.table(entity)?;

        match op {
            WriteOp::Create(mut record) => {
                let id = match record.get(&pk).and_then(Value::as_str) {
                    Some(id) => id.to_string(),
                    None => {
                        let id = Uuid::new_v4().to_string();
                        record.insert(pk.clone(), Value::String(id.clone()));
                        id
                    }
                };
                if table.contains_key(&id) {
                    return Err(DatasourceError::invalid_payload(format!(
                        "duplicate primary key {entity}/{id}"
                    )));
                }
                debug!(entity = %entity, id = %id, "Memory create");
                table.insert(id, record.clone());
                Ok(record)
            }
            WriteOp::Update(id, changes) => {
                let mut entry = table
                    .get_mut(&id)
                    .ok_or_else(|| DatasourceError::not_found(entity, &id))?;
                for (key, value) in changes {
                    if key == pk {
                        continue;
                    }
                    entry.insert(key, value);
                }
                debug!(entity = %entity, id = %id, "Memory update");
                Ok(entry.clone())
            }
            WriteOp::Delete(id) => {
                let (_, record) = table
                    .remove(&id)
                    .ok_or_else(|| DatasourceError::not_found(entity, &id))?;
                debug!(entity = %entity, id = %id, "Memory delete");
                Ok(record)
            }
        }
    }
}
