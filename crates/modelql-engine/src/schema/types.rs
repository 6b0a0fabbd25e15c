//! Plain-data type descriptors and the assembled schema.
//!
//! Generated types are explicit data structures registered in the schema,
//! not runtime-synthesized objects. Everything here is serializable so the
//! schema fingerprint and structural comparisons work off a canonical
//! rendering.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use serde::Serialize;

use modelql_datasource::ScalarType;

use crate::config::{EngineConfig, FieldVisibility};
use crate::metadata::ModelMetadata;

/// Options that shape type generation, part of the schema fingerprint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationOptions {
    /// Per-entity field visibility, resolved at generation time.
    pub field_visibility: BTreeMap<String, FieldVisibility>,
    /// Per-entity type name overrides.
    pub type_name_overrides: BTreeMap<String, String>,
}

impl GenerationOptions {
    /// Extracts generation options from the engine configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            field_visibility: config.field_visibility_overrides.clone(),
            type_name_overrides: config.type_name_overrides.clone(),
        }
    }

    /// Returns the generated type name for an entity.
    #[must_use]
    pub fn type_name<'a>(&'a self, entity: &'a str) -> &'a str {
        self.type_name_overrides
            .get(entity)
            .map_or(entity, String::as_str)
    }

    /// Returns whether a field on an entity is visible.
    #[must_use]
    pub fn is_visible(&self, entity: &str, field: &str) -> bool {
        self.field_visibility
            .get(entity)
            .is_none_or(|v| v.is_visible(field))
    }
}

/// Fingerprint of a model-metadata set plus generation options.
///
/// Identical inputs always produce identical fingerprints; the registry
/// caches one schema per fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Computes the fingerprint for a metadata set and options.
    #[must_use]
    pub fn compute(models: &[ModelMetadata], options: &GenerationOptions) -> Self {
        let canonical = serde_json::json!({
            "models": models,
            "options": options,
        });
        let rendered = canonical.to_string();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        rendered.hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Returns the invalidation tag for this fingerprint.
    #[must_use]
    pub fn tag(&self) -> String {
        format!("schema:{self}")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The kind of a generated type. At most one type exists per (entity, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TypeKind {
    /// Readable object type.
    Object,
    /// Input type for creates.
    CreateInput,
    /// Input type for updates (all fields optional).
    UpdateInput,
    /// Filter input type.
    Filter,
    /// Paginated connection wrapper.
    Connection,
    /// Connection edge.
    Edge,
}

/// Reference to a scalar or another generated type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TypeRef {
    /// A scalar.
    Scalar(ScalarType),
    /// Another generated type, by name.
    Named(String),
    /// A list of the inner type.
    List(Box<TypeRef>),
}

impl TypeRef {
    /// Returns whether this reference is a list.
    #[must_use]
    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    fn render(&self) -> String {
        match self {
            Self::Scalar(scalar) => scalar_name(*scalar).to_string(),
            Self::Named(name) => name.clone(),
            Self::List(inner) => format!("[{}]", inner.render()),
        }
    }
}

fn scalar_name(scalar: ScalarType) -> &'static str {
    match scalar {
        ScalarType::Id => "ID",
        ScalarType::String => "String",
        ScalarType::Int => "Int",
        ScalarType::Float => "Float",
        ScalarType::Boolean => "Boolean",
        ScalarType::DateTime => "DateTime",
    }
}

/// A field of a generated object or input type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeField {
    /// Field name.
    pub name: String,
    /// Field type.
    pub type_ref: TypeRef,
    /// Whether the field may be null/omitted.
    pub nullable: bool,
    /// Set when this field resolves a relation of the owning entity.
    pub relation: Option<String>,
}

/// A filter operator exposed on a filter-input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilterOp {
    /// Exact equality.
    Eq,
    /// Substring match.
    Contains,
    /// Prefix match.
    StartsWith,
    /// Greater-than-or-equal.
    Gte,
    /// Less-than-or-equal.
    Lte,
    /// Inclusive range.
    Between,
    /// Membership.
    In,
}

impl FilterOp {
    /// Wire name of the operator.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Contains => "contains",
            Self::StartsWith => "startsWith",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::Between => "between",
            Self::In => "in",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "eq" => Some(Self::Eq),
            "contains" => Some(Self::Contains),
            "startsWith" => Some(Self::StartsWith),
            "gte" => Some(Self::Gte),
            "lte" => Some(Self::Lte),
            "between" => Some(Self::Between),
            "in" => Some(Self::In),
            _ => None,
        }
    }
}

/// One field of a filter-input type and its allowed operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterField {
    /// Field (or to-one relation) name being filtered.
    pub field: String,
    /// Underlying scalar (`Id` for relation filters).
    pub scalar: ScalarType,
    /// Whether this filters a relation key rather than a scalar field.
    pub relation: bool,
    /// Operators allowed for this field.
    pub ops: Vec<FilterOp>,
}

impl FilterField {
    /// Returns whether the operator is allowed here.
    #[must_use]
    pub fn allows(&self, op: FilterOp) -> bool {
        self.ops.contains(&op)
    }
}

/// Body of a generated type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TypeBody {
    /// Object/input/connection/edge fields.
    Fields(Vec<TypeField>),
    /// Filter-input fields.
    Filter(Vec<FilterField>),
}

/// A derived type, keyed by (entity, kind) and registered under a unique name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedType {
    /// Unique type name.
    pub name: String,
    /// Entity this type was derived from.
    pub entity: String,
    /// Kind of the type.
    pub kind: TypeKind,
    /// The fields.
    pub body: TypeBody,
}

impl GeneratedType {
    /// Returns the object/input fields, empty for filter types.
    #[must_use]
    pub fn fields(&self) -> &[TypeField] {
        match &self.body {
            TypeBody::Fields(fields) => fields,
            TypeBody::Filter(_) => &[],
        }
    }

    /// Returns the filter fields, empty for non-filter types.
    #[must_use]
    pub fn filter_fields(&self) -> &[FilterField] {
        match &self.body {
            TypeBody::Filter(fields) => fields,
            TypeBody::Fields(_) => &[],
        }
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&TypeField> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// Looks up a filter field by name.
    #[must_use]
    pub fn filter_field(&self, name: &str) -> Option<&FilterField> {
        self.filter_fields().iter().find(|f| f.field == name)
    }
}

/// What a root field does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RootKind {
    /// Single read by primary key.
    Read,
    /// Filtered, paginated list returning a connection.
    List,
    /// Create one.
    Create,
    /// Create many.
    CreateMany,
    /// Update one by primary key.
    Update,
    /// Delete one by primary key.
    Delete,
}

/// Binding of a root field name to an entity and operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RootBinding {
    /// Entity the root operates on.
    pub entity: String,
    /// What the root does.
    pub kind: RootKind,
}

/// A compiled, queryable schema.
///
/// Built exactly once per fingerprint by the
/// [`SchemaRegistry`](super::SchemaRegistry); immutable afterwards.
#[derive(Debug, Serialize)]
pub struct Schema {
    /// Fingerprint of the metadata + options this schema was built from.
    pub fingerprint: Fingerprint,
    pub(crate) models: IndexMap<String, ModelMetadata>,
    pub(crate) types: IndexMap<String, GeneratedType>,
    #[serde(skip)]
    pub(crate) by_entity_kind: HashMap<(String, TypeKind), String>,
    pub(crate) query_roots: IndexMap<String, RootBinding>,
    pub(crate) mutation_roots: IndexMap<String, RootBinding>,
}

impl Schema {
    /// Looks up model metadata by entity name.
    #[must_use]
    pub fn model(&self, entity: &str) -> Option<&ModelMetadata> {
        self.models.get(entity)
    }

    /// Looks up a generated type by name.
    #[must_use]
    pub fn get_type(&self, name: &str) -> Option<&GeneratedType> {
        self.types.get(name)
    }

    /// Looks up the generated type for an entity and kind.
    #[must_use]
    pub fn type_for(&self, entity: &str, kind: TypeKind) -> Option<&GeneratedType> {
        let name = self.by_entity_kind.get(&(entity.to_string(), kind))?;
        self.types.get(name)
    }

    /// Looks up a query root binding.
    #[must_use]
    pub fn query_root(&self, name: &str) -> Option<&RootBinding> {
        self.query_roots.get(name)
    }

    /// Looks up a mutation root binding.
    #[must_use]
    pub fn mutation_root(&self, name: &str) -> Option<&RootBinding> {
        self.mutation_roots.get(name)
    }

    /// Number of generated types.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// Renders a deterministic, SDL-like description of the schema.
    ///
    /// Used by tests to compare schemas structurally.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for generated in self.types.values() {
            match &generated.body {
                TypeBody::Fields(fields) => {
                    let keyword = match generated.kind {
                        TypeKind::CreateInput | TypeKind::UpdateInput => "input",
                        _ => "type",
                    };
                    out.push_str(&format!("{keyword} {} {{\n", generated.name));
                    for field in fields {
                        let bang = if field.nullable { "" } else { "!" };
                        out.push_str(&format!(
                            "  {}: {}{}\n",
                            field.name,
                            field.type_ref.render(),
                            bang
                        ));
                    }
                    out.push_str("}\n");
                }
                TypeBody::Filter(fields) => {
                    out.push_str(&format!("input {} {{\n", generated.name));
                    for field in fields {
                        let ops: Vec<&str> = field.ops.iter().map(FilterOp::name).collect();
                        out.push_str(&format!(
                            "  {}: {{{}}}\n",
                            field.field,
                            ops.join(", ")
                        ));
                    }
                    out.push_str("}\n");
                }
            }
        }
        out.push_str("type Query {\n");
        for (name, binding) in &self.query_roots {
            out.push_str(&format!("  {name}: {:?} {}\n", binding.kind, binding.entity));
        }
        out.push_str("}\ntype Mutation {\n");
        for (name, binding) in &self.mutation_roots {
            out.push_str(&format!("  {name}: {:?} {}\n", binding.kind, binding.entity));
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let options = GenerationOptions::default();
        let a = Fingerprint::compute(&[], &options);
        let b = Fingerprint::compute(&[], &options);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_changes_with_options() {
        let plain = GenerationOptions::default();
        let mut overridden = GenerationOptions::default();
        overridden
            .type_name_overrides
            .insert("User".into(), "Person".into());

        assert_ne!(
            Fingerprint::compute(&[], &plain),
            Fingerprint::compute(&[], &overridden)
        );
    }

    #[test]
    fn test_filter_op_round_trip() {
        for op in [
            FilterOp::Eq,
            FilterOp::Contains,
            FilterOp::StartsWith,
            FilterOp::Gte,
            FilterOp::Lte,
            FilterOp::Between,
            FilterOp::In,
        ] {
            assert_eq!(FilterOp::parse(op.name()), Some(op));
        }
        assert_eq!(FilterOp::parse("like"), None);
    }

    #[test]
    fn test_type_ref_render() {
        let list = TypeRef::List(Box::new(TypeRef::Named("Post".into())));
        assert_eq!(list.render(), "[Post]");
        assert!(list.is_list());
        assert_eq!(TypeRef::Scalar(ScalarType::Id).render(), "ID");
    }

    #[test]
    fn test_generation_options_visibility() {
        let mut options = GenerationOptions::default();
        options.field_visibility.insert(
            "User".into(),
            crate::config::FieldVisibility::exclude(["password"]),
        );

        assert!(options.is_visible("User", "username"));
        assert!(!options.is_visible("User", "password"));
        assert!(options.is_visible("Post", "anything"));
    }
}
