//! Per-level relation batching.
//!
//! During breadth-first resolution every relation field at the current level
//! contributes its parent key to a batch. Each batch flushes with exactly one
//! datasource fetch per level, then results are redistributed to parents by
//! key, so sibling fan-out never multiplies backend round trips.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use modelql_datasource::{
    DynDatasource, FetchRequest, Filter, KeySet, Record, RelationKind,
};

/// Identity of one batch. Distinct arguments mean distinct batches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    /// Entity being loaded.
    pub target: String,
    /// Entity the relation is declared on.
    pub source: String,
    /// Relation name.
    pub relation: String,
    /// Canonical rendering of the relation's arguments.
    pub args: String,
}

struct Batch {
    key_field: String,
    filter: Option<Filter>,
    keys: Vec<Value>,
    seen: HashSet<String>,
}

/// One flushed batch: records indexed by the redistribution key.
pub struct LoadedBatch {
    result: Result<IndexedRecords, String>,
}

struct IndexedRecords {
    records: Vec<Record>,
    by_key: HashMap<String, Vec<usize>>,
}

impl LoadedBatch {
    /// Returns the records belonging to one parent key, in fetch order.
    ///
    /// # Errors
    ///
    /// Returns the fetch failure message when the batch's load failed; the
    /// caller attaches it to every affected parent.
    pub fn records_for(&self, parent_key: &Value) -> Result<Vec<&Record>, &str> {
        let indexed = self.result.as_ref().map_err(String::as_str)?;
        Ok(indexed
            .by_key
            .get(&render_key(parent_key))
            .map(|indices| indices.iter().map(|&i| &indexed.records[i]).collect())
            .unwrap_or_default())
    }
}

/// Accumulates the relation loads of one resolution level.
#[derive(Default)]
pub struct BatchSet {
    batches: IndexMap<BatchKey, Batch>,
}

impl BatchSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether no loads were registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Registers one parent's interest in a relation.
    ///
    /// `key_field` is the field the fetch keys on: the target's primary key
    /// for to-one relations, the inverse field otherwise. Parent keys are
    /// deduplicated within a batch.
    pub fn add(
        &mut self,
        key: BatchKey,
        key_field: &str,
        filter: Option<Filter>,
        parent_key: Value,
    ) {
        let batch = self.batches.entry(key).or_insert_with(|| Batch {
            key_field: key_field.to_string(),
            filter,
            keys: Vec::new(),
            seen: HashSet::new(),
        });
        if batch.seen.insert(render_key(&parent_key)) {
            batch.keys.push(parent_key);
        }
    }

    /// Flushes every batch with one fetch each and indexes the results.
    pub async fn flush(self, datasource: &DynDatasource) -> IndexMap<BatchKey, LoadedBatch> {
        let total = self.batches.len();
        let mut loaded = IndexMap::with_capacity(total);
        for (key, batch) in self.batches {
            let mut request = FetchRequest::new(key.target.clone())
                .with_keys(KeySet::new(batch.key_field.clone(), batch.keys));
            if let Some(filter) = batch.filter {
                request = request.with_filter(filter);
            }
            let result = match datasource.fetch(&request).await {
                Ok(records) => Ok(index_records(records, &batch.key_field)),
                Err(e) => Err(e.to_string()),
            };
            loaded.insert(key, LoadedBatch { result });
        }
        debug!(batches = total, "Flushed relation level");
        loaded
    }
}

/// Builds the redistribution key for a relation field.
///
/// To-one relations key on the reference stored on the parent; to-many and
/// many-to-many key on the parent's own primary key, matched against the
/// child's inverse field.
#[must_use]
pub fn parent_key(kind: RelationKind, record: &Record, relation: &str, primary_key: &str) -> Option<Value> {
    let value = match kind {
        RelationKind::ToOne => record.get(relation),
        RelationKind::ToMany | RelationKind::ManyToMany => record.get(primary_key),
    };
    match value {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.clone()),
    }
}

fn index_records(records: Vec<Record>, key_field: &str) -> IndexedRecords {
    let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        match record.get(key_field) {
            // Many-to-many inverses store an array of keys.
            Some(Value::Array(items)) => {
                for item in items {
                    by_key.entry(render_key(item)).or_default().push(i);
                }
            }
            Some(Value::Null) | None => {}
            Some(value) => by_key.entry(render_key(value)).or_default().push(i),
        }
    }
    IndexedRecords { records, by_key }
}

fn render_key(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use modelql_datasource::{
        DynDatasource, EntityDescriptor, FieldDescriptor, MemoryDatasource, RelationDescriptor,
        ScalarType,
    };

    fn record(value: serde_json::Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    fn seeded() -> Arc<MemoryDatasource> {
        let ds = MemoryDatasource::new(vec![
            EntityDescriptor::new("User")
                .with_field(FieldDescriptor::new("username", ScalarType::String))
                .with_relation(RelationDescriptor::to_many("posts", "Post", "author")),
            EntityDescriptor::new("Post")
                .with_field(FieldDescriptor::new("title", ScalarType::String))
                .with_field(FieldDescriptor::new("author", ScalarType::Id)),
        ]);
        ds.seed(
            "User",
            [
                record(json!({ "id": "u1", "username": "ada" })),
                record(json!({ "id": "u2", "username": "bob" })),
            ],
        );
        ds.seed(
            "Post",
            [
                record(json!({ "id": "p1", "title": "first", "author": "u1" })),
                record(json!({ "id": "p2", "title": "second", "author": "u1" })),
                record(json!({ "id": "p3", "title": "third", "author": "u2" })),
            ],
        );
        Arc::new(ds)
    }

    fn key() -> BatchKey {
        BatchKey {
            target: "Post".into(),
            source: "User".into(),
            relation: "posts".into(),
            args: "{}".into(),
        }
    }

    #[tokio::test]
    async fn test_one_fetch_per_batch() {
        let ds = seeded();
        let dyn_ds: DynDatasource = ds.clone();

        let mut set = BatchSet::new();
        set.add(key(), "author", None, json!("u1"));
        set.add(key(), "author", None, json!("u2"));
        set.add(key(), "author", None, json!("u1"));

        ds.reset_fetch_count();
        let loaded = set.flush(&dyn_ds).await;
        assert_eq!(ds.fetch_count(), 1);

        let batch = &loaded[&key()];
        let u1: Vec<&str> = batch
            .records_for(&json!("u1"))
            .unwrap()
            .iter()
            .map(|r| r["title"].as_str().unwrap())
            .collect();
        assert_eq!(u1, vec!["first", "second"]);
        assert_eq!(batch.records_for(&json!("u2")).unwrap().len(), 1);
        assert!(batch.records_for(&json!("u9")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_distinct_args_are_distinct_batches() {
        let ds = seeded();
        let dyn_ds: DynDatasource = ds.clone();

        let mut set = BatchSet::new();
        let mut filtered = key();
        filtered.args = "{\"filter\":{\"title\":{\"eq\":\"first\"}}}".into();
        set.add(key(), "author", None, json!("u1"));
        set.add(
            filtered.clone(),
            "author",
            Some(Filter::new().with("title", modelql_datasource::Condition::Eq(json!("first")))),
            json!("u1"),
        );

        ds.reset_fetch_count();
        let loaded = set.flush(&dyn_ds).await;
        assert_eq!(ds.fetch_count(), 2);
        assert_eq!(loaded[&key()].records_for(&json!("u1")).unwrap().len(), 2);
        assert_eq!(loaded[&filtered].records_for(&json!("u1")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_array_inverse_redistribution() {
        let ds = MemoryDatasource::new(vec![
            EntityDescriptor::new("Tag").with_field(FieldDescriptor::new("label", ScalarType::String)),
        ]);
        ds.seed(
            "Tag",
            [
                record(json!({ "id": "t1", "label": "a", "posts": ["p1", "p2"] })),
                record(json!({ "id": "t2", "label": "b", "posts": ["p2"] })),
            ],
        );
        let dyn_ds: DynDatasource = Arc::new(ds);

        let batch_key = BatchKey {
            target: "Tag".into(),
            source: "Post".into(),
            relation: "tags".into(),
            args: "{}".into(),
        };
        let mut set = BatchSet::new();
        set.add(batch_key.clone(), "posts", None, json!("p2"));
        let loaded = set.flush(&dyn_ds).await;

        let labels: Vec<&str> = loaded[&batch_key]
            .records_for(&json!("p2"))
            .unwrap()
            .iter()
            .map(|r| r["label"].as_str().unwrap())
            .collect();
        assert_eq!(labels, vec!["a", "b"]);
    }

    #[test]
    fn test_parent_key_selection() {
        let record: Record = serde_json::from_value(
            json!({ "id": "p1", "author": "u1", "draft": null }),
        )
        .unwrap();
        assert_eq!(
            parent_key(RelationKind::ToOne, &record, "author", "id"),
            Some(json!("u1"))
        );
        assert_eq!(
            parent_key(RelationKind::ToMany, &record, "comments", "id"),
            Some(json!("p1"))
        );
        assert_eq!(parent_key(RelationKind::ToOne, &record, "draft", "id"), None);
    }
}
