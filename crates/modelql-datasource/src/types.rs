//! Core types shared between the engine and data-source backends.
//!
//! Descriptors (`EntityDescriptor` and friends) are what a
//! [`MetadataProvider`](crate::MetadataProvider) returns; `FetchRequest`,
//! `Filter` and `WriteOp` are what the engine hands a
//! [`Datasource`](crate::Datasource).

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored record, keyed by field name.
pub type Record = serde_json::Map<String, Value>;

/// Scalar types understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScalarType {
    /// Opaque identifier, serialized as a string.
    Id,
    /// UTF-8 text.
    String,
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Float,
    /// Boolean.
    Boolean,
    /// RFC 3339 timestamp, serialized as a string.
    DateTime,
}

impl ScalarType {
    /// Returns whether values of this scalar have a total order usable for
    /// range filtering.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::Int | Self::Float | Self::DateTime)
    }
}

/// Relationship cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    /// Parent holds a single target key.
    ToOne,
    /// Targets hold the parent key in their inverse field.
    ToMany,
    /// Targets hold one or more parent keys in their inverse field.
    ManyToMany,
}

/// Description of a single scalar field on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field name, unique within the entity.
    pub name: String,
    /// Scalar type of the field.
    pub scalar: ScalarType,
    /// Whether the field may be null.
    pub nullable: bool,
    /// Whether values must be unique across the entity.
    pub unique: bool,
    /// Maximum string length, if constrained.
    pub max_length: Option<usize>,
    /// Minimum numeric value, if constrained.
    pub min: Option<f64>,
    /// Maximum numeric value, if constrained.
    pub max: Option<f64>,
    /// Default value applied when the field is absent on create.
    pub default: Option<Value>,
}

impl FieldDescriptor {
    /// Creates a descriptor with no constraints.
    #[must_use]
    pub fn new(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self {
            name: name.into(),
            scalar,
            nullable: true,
            unique: false,
            max_length: None,
            min: None,
            max: None,
            default: None,
        }
    }

    /// Marks the field as non-nullable.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Marks the field as unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Constrains the maximum string length.
    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Constrains the numeric range.
    #[must_use]
    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Description of a relationship between two entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDescriptor {
    /// Relation name, unique within the entity and disjoint from field names.
    pub name: String,
    /// Cardinality of the relation.
    pub kind: RelationKind,
    /// Target entity name.
    pub target: String,
    /// Field on the target that refers back to the parent. Required for
    /// to-many and many-to-many relations; for to-one relations the parent
    /// record stores the target key under the relation name instead.
    pub inverse: Option<String>,
    /// Whether the relation may be empty/null.
    pub nullable: bool,
}

impl RelationDescriptor {
    /// Creates a to-one relation.
    #[must_use]
    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::ToOne,
            target: target.into(),
            inverse: None,
            nullable: true,
        }
    }

    /// Creates a to-many relation resolved through `inverse` on the target.
    #[must_use]
    pub fn to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::ToMany,
            target: target.into(),
            inverse: Some(inverse.into()),
            nullable: true,
        }
    }

    /// Creates a many-to-many relation resolved through `inverse` on the target.
    #[must_use]
    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::ManyToMany,
            target: target.into(),
            inverse: Some(inverse.into()),
            nullable: true,
        }
    }
}

/// Raw description of an entity as reported by a metadata provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Entity name.
    pub name: String,
    /// Scalar fields in declaration order.
    pub fields: Vec<FieldDescriptor>,
    /// Relations to other entities.
    pub relations: Vec<RelationDescriptor>,
    /// Name of the primary-key field.
    pub primary_key: String,
}

impl EntityDescriptor {
    /// Creates a descriptor with an `id` primary key and no fields.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: vec![FieldDescriptor::new("id", ScalarType::Id).required().unique()],
            relations: Vec::new(),
            primary_key: "id".to_string(),
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds a relation.
    #[must_use]
    pub fn with_relation(mut self, relation: RelationDescriptor) -> Self {
        self.relations.push(relation);
        self
    }
}

/// A single filter condition applied to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Condition {
    /// Exact equality.
    Eq(Value),
    /// Substring match (strings only).
    Contains(String),
    /// Prefix match (strings only).
    StartsWith(String),
    /// Greater-than-or-equal (ordered scalars).
    Gte(Value),
    /// Less-than-or-equal (ordered scalars).
    Lte(Value),
    /// Inclusive range (ordered scalars).
    Between(Value, Value),
    /// Membership in a value set.
    In(Vec<Value>),
}

/// A condition bound to a field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    /// The field the condition applies to.
    pub field: String,
    /// The condition itself.
    pub condition: Condition,
}

/// Conjunction of field conditions. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// All conditions must hold.
    pub conditions: Vec<FieldCondition>,
}

impl Filter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a condition.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, condition: Condition) -> Self {
        self.conditions.push(FieldCondition {
            field: field.into(),
            condition,
        });
        self
    }

    /// Returns whether the filter has no conditions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluates the filter against a record.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|fc| {
            let value = record.get(&fc.field).unwrap_or(&Value::Null);
            condition_matches(&fc.condition, value)
        })
    }
}

fn condition_matches(condition: &Condition, value: &Value) -> bool {
    match condition {
        Condition::Eq(expected) => value == expected,
        Condition::Contains(needle) => value.as_str().is_some_and(|s| s.contains(needle.as_str())),
        Condition::StartsWith(prefix) => {
            value.as_str().is_some_and(|s| s.starts_with(prefix.as_str()))
        }
        Condition::Gte(bound) => {
            compare_values(value, bound).is_some_and(|ord| ord != Ordering::Less)
        }
        Condition::Lte(bound) => {
            compare_values(value, bound).is_some_and(|ord| ord != Ordering::Greater)
        }
        Condition::Between(low, high) => {
            compare_values(value, low).is_some_and(|ord| ord != Ordering::Less)
                && compare_values(value, high).is_some_and(|ord| ord != Ordering::Greater)
        }
        Condition::In(set) => set.iter().any(|v| v == value),
    }
}

/// Compares two JSON values. Numbers compare numerically, strings
/// lexicographically (which matches chronological order for RFC 3339
/// timestamps). Mixed or unordered types yield `None`.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Key set restricting a fetch to records whose `field` value is in `values`.
///
/// For array-valued fields (many-to-many inverses) a record matches when any
/// element of the array is in `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySet {
    /// Field to match against.
    pub field: String,
    /// Accepted values.
    pub values: Vec<Value>,
}

impl KeySet {
    /// Creates a key set.
    #[must_use]
    pub fn new(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            values,
        }
    }

    /// Returns whether a record matches this key set.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match record.get(&self.field) {
            Some(Value::Array(items)) => items.iter().any(|v| self.values.contains(v)),
            Some(value) => self.values.contains(value),
            None => false,
        }
    }
}

/// A coarse-grained fetch issued by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Entity to fetch from.
    pub entity: String,
    /// Optional filter narrowing the result.
    pub filter: Option<Filter>,
    /// Optional key set (batched relation loads).
    pub keys: Option<KeySet>,
}

impl FetchRequest {
    /// Creates an unfiltered fetch for an entity.
    #[must_use]
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filter: None,
            keys: None,
        }
    }

    /// Attaches a filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Attaches a key set.
    #[must_use]
    pub fn with_keys(mut self, keys: KeySet) -> Self {
        self.keys = Some(keys);
        self
    }
}

/// A durable write delegated to the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Insert a new record. The backend assigns the primary key when absent.
    Create(Record),
    /// Replace fields of the record with the given primary key.
    Update(String, Record),
    /// Delete the record with the given primary key.
    Delete(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_filter_eq_and_contains() {
        let filter = Filter::new()
            .with("name", Condition::Eq(json!("Ada")))
            .with("bio", Condition::Contains("math".into()));

        assert!(filter.matches(&record(json!({"name": "Ada", "bio": "loves math"}))));
        assert!(!filter.matches(&record(json!({"name": "Ada", "bio": "loves art"}))));
        assert!(!filter.matches(&record(json!({"name": "Grace", "bio": "loves math"}))));
    }

    #[test]
    fn test_filter_range() {
        let filter = Filter::new().with("age", Condition::Between(json!(18), json!(65)));

        assert!(filter.matches(&record(json!({"age": 18}))));
        assert!(filter.matches(&record(json!({"age": 40}))));
        assert!(!filter.matches(&record(json!({"age": 17}))));
        assert!(!filter.matches(&record(json!({"age": 66}))));
    }

    #[test]
    fn test_filter_gte_on_strings() {
        // RFC 3339 timestamps order lexicographically.
        let filter = Filter::new().with("created_at", Condition::Gte(json!("2024-01-01T00:00:00Z")));

        assert!(filter.matches(&record(json!({"created_at": "2024-06-01T00:00:00Z"}))));
        assert!(!filter.matches(&record(json!({"created_at": "2023-12-31T23:59:59Z"}))));
    }

    #[test]
    fn test_filter_in() {
        let filter = Filter::new().with("id", Condition::In(vec![json!("1"), json!("2")]));

        assert!(filter.matches(&record(json!({"id": "1"}))));
        assert!(!filter.matches(&record(json!({"id": "3"}))));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::new().matches(&record(json!({"anything": 1}))));
    }

    #[test]
    fn test_key_set_scalar_and_array() {
        let keys = KeySet::new("author_id", vec![json!("a1"), json!("a2")]);

        assert!(keys.matches(&record(json!({"author_id": "a1"}))));
        assert!(!keys.matches(&record(json!({"author_id": "a3"}))));
        // Array-valued inverse field (many-to-many).
        assert!(keys.matches(&record(json!({"author_id": ["a3", "a2"]}))));
        assert!(!keys.matches(&record(json!({"other": "a1"}))));
    }

    #[test]
    fn test_scalar_ordering() {
        assert!(ScalarType::Int.is_ordered());
        assert!(ScalarType::DateTime.is_ordered());
        assert!(!ScalarType::Boolean.is_ordered());
        assert!(!ScalarType::Id.is_ordered());
    }

    #[test]
    fn test_entity_descriptor_builder() {
        let entity = EntityDescriptor::new("User")
            .with_field(FieldDescriptor::new("username", ScalarType::String).required())
            .with_relation(RelationDescriptor::to_many("posts", "Post", "author_id"));

        assert_eq!(entity.primary_key, "id");
        assert_eq!(entity.fields.len(), 2);
        assert_eq!(entity.relations[0].kind, RelationKind::ToMany);
        assert_eq!(entity.relations[0].inverse.as_deref(), Some("author_id"));
    }
}
