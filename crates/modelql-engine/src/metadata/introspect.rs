//! Normalization of raw provider descriptors into canonical metadata.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use modelql_datasource::{EntityDescriptor, RelationKind};

use crate::error::SchemaError;
use crate::schema::GenerationOptions;

use super::types::{FieldMetadata, ModelMetadata, RelationMetadata};

/// Pure transform from provider descriptors to [`ModelMetadata`].
///
/// All structural validation of the data model happens here, so the type
/// builder can assume well-formed input. Mutually referencing entities are
/// legal; generation terminates because every type is built exactly once.
pub struct Introspector;

impl Introspector {
    /// Normalizes raw entity descriptors.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] when two entities map to the same generated
    /// type name, a relation references an unknown target, a field and a
    /// relation share a name on one entity, a field is declared twice, a
    /// name is not a valid type/field name, the primary key does not name a
    /// field, or a to-many relation lacks an inverse.
    pub fn normalize(
        raw: &[EntityDescriptor],
        options: &GenerationOptions,
    ) -> Result<Vec<ModelMetadata>, SchemaError> {
        let entity_names: HashSet<&str> = raw.iter().map(|e| e.name.as_str()).collect();

        let mut type_names: HashMap<String, String> = HashMap::new();
        let mut models = Vec::with_capacity(raw.len());

        for entity in raw {
            let type_name = options.type_name(&entity.name).to_string();
            if !is_valid_name(&entity.name) || !is_valid_name(&type_name) {
                return Err(SchemaError::InvalidName {
                    name: type_name.clone(),
                });
            }
            if let Some(first) = type_names.insert(type_name.clone(), entity.name.clone()) {
                return Err(SchemaError::TypeNameCollision {
                    name: type_name,
                    first,
                    second: entity.name.clone(),
                });
            }

            let mut seen_fields: HashSet<&str> = HashSet::new();
            for field in &entity.fields {
                if !is_valid_name(&field.name) {
                    return Err(SchemaError::InvalidName {
                        name: field.name.clone(),
                    });
                }
                if !seen_fields.insert(field.name.as_str()) {
                    return Err(SchemaError::DuplicateField {
                        entity: entity.name.clone(),
                        name: field.name.clone(),
                    });
                }
            }

            for relation in &entity.relations {
                if !is_valid_name(&relation.name) {
                    return Err(SchemaError::InvalidName {
                        name: relation.name.clone(),
                    });
                }
                if seen_fields.contains(relation.name.as_str()) {
                    return Err(SchemaError::FieldRelationCollision {
                        entity: entity.name.clone(),
                        name: relation.name.clone(),
                    });
                }
                if !entity_names.contains(relation.target.as_str()) {
                    return Err(SchemaError::UnknownRelationTarget {
                        entity: entity.name.clone(),
                        relation: relation.name.clone(),
                        target: relation.target.clone(),
                    });
                }
                if matches!(relation.kind, RelationKind::ToMany | RelationKind::ManyToMany)
                    && relation.inverse.is_none()
                {
                    return Err(SchemaError::MissingInverse {
                        entity: entity.name.clone(),
                        relation: relation.name.clone(),
                    });
                }
            }

            if !seen_fields.contains(entity.primary_key.as_str()) {
                return Err(SchemaError::UnknownPrimaryKey {
                    entity: entity.name.clone(),
                    key: entity.primary_key.clone(),
                });
            }

            models.push(ModelMetadata {
                entity: entity.name.clone(),
                type_name,
                fields: entity.fields.iter().map(FieldMetadata::from).collect(),
                relations: entity.relations.iter().map(RelationMetadata::from).collect(),
                primary_key: entity.primary_key.clone(),
            });
        }

        debug!(count = models.len(), "Normalized entity metadata");
        Ok(models)
    }
}

/// Checks that a name matches `[_A-Za-z][_A-Za-z0-9]*`.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelql_datasource::{FieldDescriptor, RelationDescriptor, ScalarType};

    fn user_post() -> Vec<EntityDescriptor> {
        vec![
            EntityDescriptor::new("User")
                .with_field(FieldDescriptor::new("username", ScalarType::String).required())
                .with_relation(RelationDescriptor::to_many("posts", "Post", "author_id")),
            EntityDescriptor::new("Post")
                .with_field(FieldDescriptor::new("title", ScalarType::String))
                .with_field(FieldDescriptor::new("author_id", ScalarType::Id))
                .with_relation(RelationDescriptor::to_one("author", "User")),
        ]
    }

    #[test]
    fn test_normalize_valid_model() {
        let models = Introspector::normalize(&user_post(), &GenerationOptions::default()).unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].type_name, "User");
        assert_eq!(models[0].relations[0].target, "Post");
    }

    #[test]
    fn test_mutually_referencing_entities_allowed() {
        // User -> posts -> Post -> author -> User is a cycle and must pass.
        assert!(Introspector::normalize(&user_post(), &GenerationOptions::default()).is_ok());
    }

    #[test]
    fn test_unknown_relation_target() {
        let raw = vec![
            EntityDescriptor::new("User")
                .with_relation(RelationDescriptor::to_many("posts", "Post", "author_id")),
        ];
        let err = Introspector::normalize(&raw, &GenerationOptions::default()).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownRelationTarget { .. }));
    }

    #[test]
    fn test_field_relation_collision() {
        let raw = vec![
            EntityDescriptor::new("User")
                .with_field(FieldDescriptor::new("posts", ScalarType::String))
                .with_relation(RelationDescriptor::to_many("posts", "User", "id")),
        ];
        let err = Introspector::normalize(&raw, &GenerationOptions::default()).unwrap_err();
        assert!(matches!(err, SchemaError::FieldRelationCollision { .. }));
    }

    #[test]
    fn test_duplicate_field() {
        let raw = vec![
            EntityDescriptor::new("User")
                .with_field(FieldDescriptor::new("username", ScalarType::String))
                .with_field(FieldDescriptor::new("username", ScalarType::String)),
        ];
        let err = Introspector::normalize(&raw, &GenerationOptions::default()).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateField { .. }));
    }

    #[test]
    fn test_type_name_collision_via_override() {
        let mut options = GenerationOptions::default();
        options
            .type_name_overrides
            .insert("Account".into(), "User".into());
        let raw = vec![
            EntityDescriptor::new("User"),
            EntityDescriptor::new("Account"),
        ];
        let err = Introspector::normalize(&raw, &options).unwrap_err();
        assert!(matches!(err, SchemaError::TypeNameCollision { .. }));
    }

    #[test]
    fn test_override_resolves_collision() {
        let mut options = GenerationOptions::default();
        options
            .type_name_overrides
            .insert("user".into(), "LegacyUser".into());
        let raw = vec![EntityDescriptor::new("User"), EntityDescriptor::new("user")];
        let models = Introspector::normalize(&raw, &options).unwrap();
        assert_eq!(models[1].type_name, "LegacyUser");
    }

    #[test]
    fn test_missing_inverse() {
        let mut relation = RelationDescriptor::to_many("posts", "Post", "author_id");
        relation.inverse = None;
        let raw = vec![
            EntityDescriptor::new("User").with_relation(relation),
            EntityDescriptor::new("Post"),
        ];
        let err = Introspector::normalize(&raw, &GenerationOptions::default()).unwrap_err();
        assert!(matches!(err, SchemaError::MissingInverse { .. }));
    }

    #[test]
    fn test_unknown_primary_key() {
        let mut entity = EntityDescriptor::new("User");
        entity.primary_key = "uuid".into();
        let err =
            Introspector::normalize(&[entity], &GenerationOptions::default()).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownPrimaryKey { .. }));
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(is_valid_name("User"));
        assert!(is_valid_name("_internal"));
        assert!(is_valid_name("Type123"));
        assert!(!is_valid_name("us-core"));
        assert!(!is_valid_name("123Type"));
        assert!(!is_valid_name(""));

        let raw = vec![EntityDescriptor::new("bad-name")];
        let err = Introspector::normalize(&raw, &GenerationOptions::default()).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidName { .. }));
    }
}
