//! Derives the generated type set and root bindings from model metadata.

use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::debug;

use modelql_datasource::{RelationKind, ScalarType};

use crate::error::SchemaError;
use crate::metadata::ModelMetadata;

use super::types::{
    Fingerprint, FilterField, FilterOp, GeneratedType, GenerationOptions, RootBinding, RootKind,
    Schema, TypeBody, TypeField, TypeKind, TypeRef,
};

/// Builds a [`Schema`] from normalized metadata.
///
/// Per entity, six plain-data types are generated: object, create input,
/// update input, filter input, connection and edge. Every generated name must
/// be unique across the schema, including root field names.
pub struct TypeBuilder;

impl TypeBuilder {
    /// Builds the schema.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidVisibility`] when a visibility override
    /// names an unknown entity or field or hides a primary key, and
    /// [`SchemaError::TypeNameCollision`] when two entities generate the same
    /// type or root name.
    pub fn build(
        fingerprint: Fingerprint,
        models: Vec<ModelMetadata>,
        options: &GenerationOptions,
    ) -> Result<Schema, SchemaError> {
        validate_visibility(&models, options)?;

        let mut types: IndexMap<String, GeneratedType> = IndexMap::new();
        let mut by_entity_kind: HashMap<(String, TypeKind), String> = HashMap::new();
        let mut query_roots: IndexMap<String, RootBinding> = IndexMap::new();
        let mut mutation_roots: IndexMap<String, RootBinding> = IndexMap::new();

        let type_names: HashMap<&str, &str> = models
            .iter()
            .map(|m| (m.entity.as_str(), m.type_name.as_str()))
            .collect();

        for model in &models {
            for generated in generate_entity_types(model, options, &type_names) {
                by_entity_kind.insert(
                    (model.entity.clone(), generated.kind),
                    generated.name.clone(),
                );
                register_type(&mut types, generated, &model.entity)?;
            }

            for (name, kind) in root_names(&model.type_name) {
                let roots = match kind {
                    RootKind::Read | RootKind::List => &mut query_roots,
                    _ => &mut mutation_roots,
                };
                let binding = RootBinding {
                    entity: model.entity.clone(),
                    kind,
                };
                if let Some(previous) = roots.insert(name.clone(), binding) {
                    return Err(SchemaError::TypeNameCollision {
                        name,
                        first: previous.entity,
                        second: model.entity.clone(),
                    });
                }
            }
        }

        debug!(
            fingerprint = %fingerprint,
            types = types.len(),
            query_roots = query_roots.len(),
            mutation_roots = mutation_roots.len(),
            "Built schema"
        );

        let models = models
            .into_iter()
            .map(|m| (m.entity.clone(), m))
            .collect();

        Ok(Schema {
            fingerprint,
            models,
            types,
            by_entity_kind,
            query_roots,
            mutation_roots,
        })
    }
}

fn register_type(
    types: &mut IndexMap<String, GeneratedType>,
    generated: GeneratedType,
    entity: &str,
) -> Result<(), SchemaError> {
    let name = generated.name.clone();
    if let Some(previous) = types.insert(name.clone(), generated) {
        return Err(SchemaError::TypeNameCollision {
            name,
            first: previous.entity,
            second: entity.to_string(),
        });
    }
    Ok(())
}

fn validate_visibility(
    models: &[ModelMetadata],
    options: &GenerationOptions,
) -> Result<(), SchemaError> {
    for (entity, visibility) in &options.field_visibility {
        let Some(model) = models.iter().find(|m| &m.entity == entity) else {
            return Err(SchemaError::InvalidVisibility {
                entity: entity.clone(),
                message: "unknown entity".into(),
            });
        };
        let named = visibility
            .include
            .iter()
            .chain(visibility.exclude.iter())
            .flatten();
        for field in named {
            if model.field(field).is_none() && model.relation(field).is_none() {
                return Err(SchemaError::InvalidVisibility {
                    entity: entity.clone(),
                    message: format!("unknown field {field}"),
                });
            }
        }
        if !visibility.is_visible(&model.primary_key) {
            return Err(SchemaError::InvalidVisibility {
                entity: entity.clone(),
                message: format!("primary key {} may not be hidden", model.primary_key),
            });
        }
    }
    Ok(())
}

fn generate_entity_types(
    model: &ModelMetadata,
    options: &GenerationOptions,
    type_names: &HashMap<&str, &str>,
) -> Vec<GeneratedType> {
    let type_name = &model.type_name;
    let entity = &model.entity;

    let mut object_fields = Vec::new();
    let mut create_fields = Vec::new();
    let mut update_fields = Vec::new();
    let mut filter_fields = Vec::new();

    for field in &model.fields {
        if !options.is_visible(entity, &field.name) {
            continue;
        }
        object_fields.push(TypeField {
            name: field.name.clone(),
            type_ref: TypeRef::Scalar(field.scalar),
            nullable: field.nullable,
            relation: None,
        });
        if field.name != model.primary_key {
            create_fields.push(TypeField {
                name: field.name.clone(),
                type_ref: TypeRef::Scalar(field.scalar),
                nullable: field.nullable || field.default.is_some(),
                relation: None,
            });
            update_fields.push(TypeField {
                name: field.name.clone(),
                type_ref: TypeRef::Scalar(field.scalar),
                nullable: true,
                relation: None,
            });
        }
        filter_fields.push(FilterField {
            field: field.name.clone(),
            scalar: field.scalar,
            relation: false,
            ops: scalar_ops(field.scalar),
        });
    }

    for relation in &model.relations {
        if !options.is_visible(entity, &relation.name) {
            continue;
        }
        // The introspector already verified the target exists.
        let target_type = type_names
            .get(relation.target.as_str())
            .copied()
            .unwrap_or(relation.target.as_str());
        let inner = TypeRef::Named(target_type.to_string());
        let type_ref = if relation.is_list() {
            TypeRef::List(Box::new(inner))
        } else {
            inner
        };
        object_fields.push(TypeField {
            name: relation.name.clone(),
            type_ref,
            nullable: relation.nullable || relation.is_list(),
            relation: Some(relation.name.clone()),
        });

        // To-one relations are writable and filterable by target key.
        if matches!(relation.kind, RelationKind::ToOne) {
            create_fields.push(TypeField {
                name: relation.name.clone(),
                type_ref: TypeRef::Scalar(ScalarType::Id),
                nullable: relation.nullable,
                relation: Some(relation.name.clone()),
            });
            update_fields.push(TypeField {
                name: relation.name.clone(),
                type_ref: TypeRef::Scalar(ScalarType::Id),
                nullable: true,
                relation: Some(relation.name.clone()),
            });
            filter_fields.push(FilterField {
                field: relation.name.clone(),
                scalar: ScalarType::Id,
                relation: true,
                ops: vec![FilterOp::Eq, FilterOp::In],
            });
        }
    }

    let edge_name = format!("{type_name}Edge");
    let edge_fields = vec![
        TypeField {
            name: "node".into(),
            type_ref: TypeRef::Named(type_name.clone()),
            nullable: false,
            relation: None,
        },
        TypeField {
            name: "cursor".into(),
            type_ref: TypeRef::Scalar(ScalarType::String),
            nullable: false,
            relation: None,
        },
    ];
    let connection_fields = vec![
        TypeField {
            name: "nodes".into(),
            type_ref: TypeRef::List(Box::new(TypeRef::Named(type_name.clone()))),
            nullable: false,
            relation: None,
        },
        TypeField {
            name: "edges".into(),
            type_ref: TypeRef::List(Box::new(TypeRef::Named(edge_name.clone()))),
            nullable: false,
            relation: None,
        },
        TypeField {
            name: "totalCount".into(),
            type_ref: TypeRef::Scalar(ScalarType::Int),
            nullable: false,
            relation: None,
        },
        TypeField {
            name: "hasNextPage".into(),
            type_ref: TypeRef::Scalar(ScalarType::Boolean),
            nullable: false,
            relation: None,
        },
        TypeField {
            name: "endCursor".into(),
            type_ref: TypeRef::Scalar(ScalarType::String),
            nullable: true,
            relation: None,
        },
    ];

    vec![
        GeneratedType {
            name: type_name.clone(),
            entity: entity.clone(),
            kind: TypeKind::Object,
            body: TypeBody::Fields(object_fields),
        },
        GeneratedType {
            name: format!("{type_name}CreateInput"),
            entity: entity.clone(),
            kind: TypeKind::CreateInput,
            body: TypeBody::Fields(create_fields),
        },
        GeneratedType {
            name: format!("{type_name}UpdateInput"),
            entity: entity.clone(),
            kind: TypeKind::UpdateInput,
            body: TypeBody::Fields(update_fields),
        },
        GeneratedType {
            name: format!("{type_name}Filter"),
            entity: entity.clone(),
            kind: TypeKind::Filter,
            body: TypeBody::Filter(filter_fields),
        },
        GeneratedType {
            name: edge_name,
            entity: entity.clone(),
            kind: TypeKind::Edge,
            body: TypeBody::Fields(edge_fields),
        },
        GeneratedType {
            name: format!("{type_name}Connection"),
            entity: entity.clone(),
            kind: TypeKind::Connection,
            body: TypeBody::Fields(connection_fields),
        },
    ]
}

fn scalar_ops(scalar: ScalarType) -> Vec<FilterOp> {
    match scalar {
        ScalarType::Id => vec![FilterOp::Eq, FilterOp::In],
        ScalarType::String => vec![
            FilterOp::Eq,
            FilterOp::Contains,
            FilterOp::StartsWith,
            FilterOp::In,
        ],
        ScalarType::Int | ScalarType::Float | ScalarType::DateTime => vec![
            FilterOp::Eq,
            FilterOp::Gte,
            FilterOp::Lte,
            FilterOp::Between,
            FilterOp::In,
        ],
        ScalarType::Boolean => vec![FilterOp::Eq],
    }
}

/// Root field names generated for one type name.
fn root_names(type_name: &str) -> Vec<(String, RootKind)> {
    let singular = lower_first(type_name);
    vec![
        (singular.clone(), RootKind::Read),
        (format!("{singular}s"), RootKind::List),
        (format!("create{type_name}"), RootKind::Create),
        (format!("createMany{type_name}s"), RootKind::CreateMany),
        (format!("update{type_name}"), RootKind::Update),
        (format!("delete{type_name}"), RootKind::Delete),
    ]
}

fn lower_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldVisibility;
    use crate::metadata::Introspector;
    use modelql_datasource::{
        EntityDescriptor, FieldDescriptor, RelationDescriptor, ScalarType,
    };

    fn descriptors() -> Vec<EntityDescriptor> {
        vec![
            EntityDescriptor::new("User")
                .with_field(FieldDescriptor::new("username", ScalarType::String).required())
                .with_field(FieldDescriptor::new("email", ScalarType::String))
                .with_field(FieldDescriptor::new("password", ScalarType::String))
                .with_relation(RelationDescriptor::to_many("posts", "Post", "author")),
            EntityDescriptor::new("Post")
                .with_field(FieldDescriptor::new("title", ScalarType::String).required())
                .with_field(FieldDescriptor::new("views", ScalarType::Int))
                .with_relation(RelationDescriptor::to_one("author", "User")),
        ]
    }

    fn build(options: GenerationOptions) -> Result<Schema, SchemaError> {
        let models = Introspector::normalize(&descriptors(), &options)?;
        let fingerprint = Fingerprint::compute(&models, &options);
        TypeBuilder::build(fingerprint, models, &options)
    }

    #[test]
    fn test_six_types_per_entity() {
        let schema = build(GenerationOptions::default()).unwrap();
        assert_eq!(schema.type_count(), 12);
        for kind in [
            TypeKind::Object,
            TypeKind::CreateInput,
            TypeKind::UpdateInput,
            TypeKind::Filter,
            TypeKind::Connection,
            TypeKind::Edge,
        ] {
            assert!(schema.type_for("User", kind).is_some(), "{kind:?}");
        }
    }

    #[test]
    fn test_object_fields_and_relations() {
        let schema = build(GenerationOptions::default()).unwrap();
        let user = schema.type_for("User", TypeKind::Object).unwrap();
        let posts = user.field("posts").unwrap();
        assert!(posts.type_ref.is_list());
        assert_eq!(posts.relation.as_deref(), Some("posts"));

        let post = schema.type_for("Post", TypeKind::Object).unwrap();
        let author = post.field("author").unwrap();
        assert_eq!(author.type_ref, TypeRef::Named("User".into()));
    }

    #[test]
    fn test_create_input_omits_primary_key() {
        let schema = build(GenerationOptions::default()).unwrap();
        let input = schema.type_for("User", TypeKind::CreateInput).unwrap();
        assert!(input.field("id").is_none());
        assert!(!input.field("username").unwrap().nullable);
        assert!(input.field("email").unwrap().nullable);
    }

    #[test]
    fn test_update_input_all_optional() {
        let schema = build(GenerationOptions::default()).unwrap();
        let input = schema.type_for("User", TypeKind::UpdateInput).unwrap();
        assert!(input.fields().iter().all(|f| f.nullable));
    }

    #[test]
    fn test_filter_operators_per_scalar() {
        let schema = build(GenerationOptions::default()).unwrap();
        let filter = schema.type_for("Post", TypeKind::Filter).unwrap();

        let title = filter.filter_field("title").unwrap();
        assert!(title.allows(FilterOp::Contains));
        assert!(title.allows(FilterOp::StartsWith));
        assert!(!title.allows(FilterOp::Between));

        let views = filter.filter_field("views").unwrap();
        assert!(views.allows(FilterOp::Between));
        assert!(views.allows(FilterOp::Gte));
        assert!(!views.allows(FilterOp::Contains));

        let author = filter.filter_field("author").unwrap();
        assert!(author.relation);
        assert_eq!(author.ops, vec![FilterOp::Eq, FilterOp::In]);
    }

    #[test]
    fn test_excluded_field_absent_everywhere() {
        let mut options = GenerationOptions::default();
        options
            .field_visibility
            .insert("User".into(), FieldVisibility::exclude(["password"]));
        let schema = build(options).unwrap();

        let object = schema.type_for("User", TypeKind::Object).unwrap();
        assert!(object.field("password").is_none());
        assert_eq!(
            object.fields().iter().filter(|f| f.relation.is_none()).count(),
            3
        );
        for kind in [TypeKind::CreateInput, TypeKind::UpdateInput] {
            assert!(schema.type_for("User", kind).unwrap().field("password").is_none());
        }
        assert!(
            schema
                .type_for("User", TypeKind::Filter)
                .unwrap()
                .filter_field("password")
                .is_none()
        );
    }

    #[test]
    fn test_hiding_primary_key_rejected() {
        let mut options = GenerationOptions::default();
        options
            .field_visibility
            .insert("User".into(), FieldVisibility::exclude(["id"]));
        let err = build(options).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidVisibility { .. }));
    }

    #[test]
    fn test_visibility_unknown_field_rejected() {
        let mut options = GenerationOptions::default();
        options
            .field_visibility
            .insert("User".into(), FieldVisibility::exclude(["no_such_field"]));
        let err = build(options).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidVisibility { .. }));
    }

    #[test]
    fn test_root_bindings() {
        let schema = build(GenerationOptions::default()).unwrap();
        assert_eq!(schema.query_root("user").unwrap().kind, RootKind::Read);
        assert_eq!(schema.query_root("users").unwrap().kind, RootKind::List);
        assert_eq!(
            schema.mutation_root("createUser").unwrap().kind,
            RootKind::Create
        );
        assert_eq!(
            schema.mutation_root("createManyUsers").unwrap().kind,
            RootKind::CreateMany
        );
        assert_eq!(
            schema.mutation_root("updatePost").unwrap().kind,
            RootKind::Update
        );
        assert_eq!(
            schema.mutation_root("deletePost").unwrap().kind,
            RootKind::Delete
        );
        assert!(schema.query_root("unknown").is_none());
    }

    #[test]
    fn test_root_name_collision() {
        let options = GenerationOptions::default();
        let raw = vec![EntityDescriptor::new("User"), EntityDescriptor::new("Users")];
        let models = Introspector::normalize(&raw, &options).unwrap();
        let fingerprint = Fingerprint::compute(&models, &options);
        // The list root of User and the read root of Users are both "users".
        let err = TypeBuilder::build(fingerprint, models, &options).unwrap_err();
        assert!(matches!(err, SchemaError::TypeNameCollision { .. }));
    }

    #[test]
    fn test_type_name_override_applies() {
        let mut options = GenerationOptions::default();
        options
            .type_name_overrides
            .insert("User".into(), "Person".into());
        let schema = build(options).unwrap();
        assert!(schema.get_type("Person").is_some());
        assert!(schema.get_type("PersonConnection").is_some());
        assert!(schema.query_root("person").is_some());

        // Relation fields point at the overridden name.
        let post = schema.type_for("Post", TypeKind::Object).unwrap();
        assert_eq!(
            post.field("author").unwrap().type_ref,
            TypeRef::Named("Person".into())
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = build(GenerationOptions::default()).unwrap();
        let b = build(GenerationOptions::default()).unwrap();
        assert_eq!(a.describe(), b.describe());
        assert_eq!(a.fingerprint, b.fingerprint);
    }
}
