//! Canonical, immutable model metadata.
//!
//! These are the normalized forms produced by the
//! [`Introspector`](super::Introspector) from raw provider descriptors.
//! They are serializable so the schema fingerprint can be computed from a
//! canonical rendering.

use serde::Serialize;
use serde_json::Value;

use modelql_datasource::{FieldDescriptor, RelationDescriptor, RelationKind, ScalarType};

/// Normalized description of one scalar field. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldMetadata {
    /// Field name.
    pub name: String,
    /// Scalar type.
    pub scalar: ScalarType,
    /// Whether the field may be null.
    pub nullable: bool,
    /// Whether values must be unique.
    pub unique: bool,
    /// Maximum string length, if constrained.
    pub max_length: Option<usize>,
    /// Minimum numeric value, if constrained.
    pub min: Option<f64>,
    /// Maximum numeric value, if constrained.
    pub max: Option<f64>,
    /// Default value applied on create when the field is absent.
    pub default: Option<Value>,
}

impl From<&FieldDescriptor> for FieldMetadata {
    fn from(fd: &FieldDescriptor) -> Self {
        Self {
            name: fd.name.clone(),
            scalar: fd.scalar,
            nullable: fd.nullable,
            unique: fd.unique,
            max_length: fd.max_length,
            min: fd.min,
            max: fd.max,
            default: fd.default.clone(),
        }
    }
}

/// Normalized description of one relation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationMetadata {
    /// Relation name.
    pub name: String,
    /// Cardinality.
    pub kind: RelationKind,
    /// Target entity.
    pub target: String,
    /// Inverse field on the target, for to-many and many-to-many relations.
    pub inverse: Option<String>,
    /// Whether the relation may be empty/null.
    pub nullable: bool,
}

impl RelationMetadata {
    /// Returns whether this relation resolves to a list.
    #[must_use]
    pub fn is_list(&self) -> bool {
        matches!(self.kind, RelationKind::ToMany | RelationKind::ManyToMany)
    }
}

impl From<&RelationDescriptor> for RelationMetadata {
    fn from(rd: &RelationDescriptor) -> Self {
        Self {
            name: rd.name.clone(),
            kind: rd.kind,
            target: rd.target.clone(),
            inverse: rd.inverse.clone(),
            nullable: rd.nullable,
        }
    }
}

/// Normalized description of one entity.
///
/// One instance exists per entity; the set is rebuilt whenever the metadata
/// provider signals a definition change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMetadata {
    /// Entity name.
    pub entity: String,
    /// Generated type name (entity name unless overridden).
    pub type_name: String,
    /// Fields in declaration order, names unique.
    pub fields: Vec<FieldMetadata>,
    /// Relations to other entities.
    pub relations: Vec<RelationMetadata>,
    /// Primary-key field name.
    pub primary_key: String,
}

impl ModelMetadata {
    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldMetadata> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Looks up a relation by name.
    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&RelationMetadata> {
        self.relations.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelMetadata {
        ModelMetadata {
            entity: "User".into(),
            type_name: "User".into(),
            fields: vec![
                FieldMetadata {
                    name: "id".into(),
                    scalar: ScalarType::Id,
                    nullable: false,
                    unique: true,
                    max_length: None,
                    min: None,
                    max: None,
                    default: None,
                },
                FieldMetadata {
                    name: "username".into(),
                    scalar: ScalarType::String,
                    nullable: false,
                    unique: true,
                    max_length: Some(64),
                    min: None,
                    max: None,
                    default: None,
                },
            ],
            relations: vec![RelationMetadata {
                name: "posts".into(),
                kind: RelationKind::ToMany,
                target: "Post".into(),
                inverse: Some("author_id".into()),
                nullable: true,
            }],
            primary_key: "id".into(),
        }
    }

    #[test]
    fn test_lookups() {
        let model = sample();
        assert!(model.field("username").is_some());
        assert!(model.field("posts").is_none());
        assert!(model.relation("posts").is_some());
        assert_eq!(model.primary_key, "id");
    }

    #[test]
    fn test_relation_is_list() {
        let model = sample();
        assert!(model.relation("posts").unwrap().is_list());
    }
}
