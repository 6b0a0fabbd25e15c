//! Static complexity and depth analysis, gated before any resolution.

use std::collections::HashSet;

use async_graphql_parser::types::{
    DocumentOperations, ExecutableDocument, Field, OperationDefinition, Selection, SelectionSet,
};
use async_graphql_value::{ConstValue, Value, Variables};
use tracing::debug;

use crate::error::EngineError;
use crate::schema::{GeneratedType, RootKind, Schema, TypeKind, TypeRef};

/// Limits applied to every request.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum allowed complexity score.
    pub max_complexity: usize,
    /// Maximum allowed selection depth.
    pub max_depth: usize,
    /// Page size assumed for list fields without a `first` argument.
    pub default_page_size: usize,
}

/// The computed cost of a query that passed the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryBudget {
    /// Complexity score: leaves cost 1, list fields multiply child cost by
    /// the effective page size.
    pub complexity: usize,
    /// Deepest selection nesting.
    pub depth: usize,
}

/// Scores a parsed document against the limits.
///
/// The walk is a single linear pass over the selection tree; fragment spreads
/// are followed with a cycle guard. Unknown fields score as leaves so the
/// gate never masks the per-field errors the executor attaches later.
///
/// # Errors
///
/// Returns [`EngineError::ComplexityExceeded`] or
/// [`EngineError::DepthExceeded`] when a limit is breached, and
/// [`EngineError::InvalidQuery`] for structural problems such as fragment
/// cycles or multiple operations.
pub fn analyze(
    document: &ExecutableDocument,
    variables: &Variables,
    schema: &Schema,
    limits: &Limits,
) -> Result<QueryBudget, EngineError> {
    let operation = single_operation(document)?;

    let mut active_fragments = HashSet::new();
    let (complexity, depth) = score_root_set(
        &operation.selection_set.node,
        operation,
        schema,
        variables,
        limits,
        document,
        &mut active_fragments,
    )?;

    if depth > limits.max_depth {
        return Err(EngineError::DepthExceeded {
            actual: depth,
            max: limits.max_depth,
        });
    }
    if complexity > limits.max_complexity {
        return Err(EngineError::ComplexityExceeded {
            actual: complexity,
            max: limits.max_complexity,
        });
    }

    debug!(complexity, depth, "Query passed analysis gate");
    Ok(QueryBudget { complexity, depth })
}

/// Returns the single operation of the document.
pub(crate) fn single_operation(
    document: &ExecutableDocument,
) -> Result<&OperationDefinition, EngineError> {
    match &document.operations {
        DocumentOperations::Single(op) => Ok(&op.node),
        DocumentOperations::Multiple(ops) => {
            if ops.len() == 1 {
                ops.values()
                    .next()
                    .map(|op| &op.node)
                    .ok_or_else(|| EngineError::InvalidQuery("no operation in document".into()))
            } else {
                Err(EngineError::InvalidQuery(
                    "exactly one operation per request is supported".into(),
                ))
            }
        }
    }
}

/// Scores the operation's root selection set. Root fields resolve their
/// return type through the root bindings; fragments at the root are flattened
/// back into root-level selections, mirroring the planner.
fn score_root_set(
    set: &SelectionSet,
    operation: &OperationDefinition,
    schema: &Schema,
    variables: &Variables,
    limits: &Limits,
    document: &ExecutableDocument,
    active_fragments: &mut HashSet<String>,
) -> Result<(usize, usize), EngineError> {
    let mut cost = 0;
    let mut max_depth = 0;

    for selection in &set.items {
        match &selection.node {
            Selection::Field(field) => {
                let field = &field.node;
                let return_type = root_return_type(schema, operation, field.name.node.as_str());
                let (field_cost, field_depth) = score_field(
                    field,
                    return_type.as_ref(),
                    schema,
                    variables,
                    limits,
                    1,
                    document,
                    active_fragments,
                )?;
                cost += field_cost;
                max_depth = max_depth.max(field_depth);
            }
            Selection::FragmentSpread(spread) => {
                let name = spread.node.fragment_name.node.to_string();
                if !active_fragments.insert(name.clone()) {
                    return Err(EngineError::InvalidQuery(format!(
                        "fragment cycle through {name}"
                    )));
                }
                let fragment = document.fragments.get(&spread.node.fragment_name.node).ok_or_else(
                    || EngineError::InvalidQuery(format!("unknown fragment {name}")),
                )?;
                let (frag_cost, frag_depth) = score_root_set(
                    &fragment.node.selection_set.node,
                    operation,
                    schema,
                    variables,
                    limits,
                    document,
                    active_fragments,
                )?;
                active_fragments.remove(&name);
                cost += frag_cost;
                max_depth = max_depth.max(frag_depth);
            }
            Selection::InlineFragment(inline) => {
                let (frag_cost, frag_depth) = score_root_set(
                    &inline.node.selection_set.node,
                    operation,
                    schema,
                    variables,
                    limits,
                    document,
                    active_fragments,
                )?;
                cost += frag_cost;
                max_depth = max_depth.max(frag_depth);
            }
        }
    }
    Ok((cost, max_depth))
}

/// Resolves the return type of a root field, `None` when unbound.
fn root_return_type(
    schema: &Schema,
    operation: &OperationDefinition,
    name: &str,
) -> Option<TypeRef> {
    use async_graphql_parser::types::OperationType;
    let binding = match operation.ty {
        OperationType::Query => schema.query_root(name)?,
        OperationType::Mutation => schema.mutation_root(name)?,
        OperationType::Subscription => return None,
    };
    let kind = match binding.kind {
        RootKind::List => TypeKind::Connection,
        _ => TypeKind::Object,
    };
    let type_name = schema.type_for(&binding.entity, kind)?.name.clone();
    let named = TypeRef::Named(type_name);
    match binding.kind {
        RootKind::CreateMany => Some(TypeRef::List(Box::new(named))),
        _ => Some(named),
    }
}

#[allow(clippy::too_many_arguments)]
fn score_field(
    field: &Field,
    return_type: Option<&TypeRef>,
    schema: &Schema,
    variables: &Variables,
    limits: &Limits,
    depth: usize,
    document: &ExecutableDocument,
    active_fragments: &mut HashSet<String>,
) -> Result<(usize, usize), EngineError> {
    let object = return_type.and_then(|t| named_object(t, schema));
    if field.selection_set.node.items.is_empty() {
        return Ok((1, depth));
    }

    let (child_cost, child_depth) = score_set(
        &field.selection_set.node,
        object,
        schema,
        variables,
        limits,
        depth + 1,
        document,
        active_fragments,
    )?;

    let multiplier = if return_type.is_some_and(TypeRef::is_list) {
        page_size(field, variables, limits)?
    } else {
        1
    };
    Ok((1 + multiplier * child_cost, child_depth))
}

#[allow(clippy::too_many_arguments)]
fn score_set(
    set: &SelectionSet,
    parent: Option<&GeneratedType>,
    schema: &Schema,
    variables: &Variables,
    limits: &Limits,
    depth: usize,
    document: &ExecutableDocument,
    active_fragments: &mut HashSet<String>,
) -> Result<(usize, usize), EngineError> {
    let mut cost = 0;
    let mut max_depth = depth;

    for selection in &set.items {
        match &selection.node {
            Selection::Field(field) => {
                let field = &field.node;
                let child_type = parent
                    .and_then(|p| p.field(field.name.node.as_str()))
                    .map(|f| f.type_ref.clone());
                let (field_cost, field_depth) = score_field(
                    field,
                    child_type.as_ref(),
                    schema,
                    variables,
                    limits,
                    depth,
                    document,
                    active_fragments,
                )?;
                cost += field_cost;
                max_depth = max_depth.max(field_depth);
            }
            Selection::FragmentSpread(spread) => {
                let name = spread.node.fragment_name.node.to_string();
                if !active_fragments.insert(name.clone()) {
                    return Err(EngineError::InvalidQuery(format!(
                        "fragment cycle through {name}"
                    )));
                }
                let fragment = document.fragments.get(&spread.node.fragment_name.node).ok_or_else(
                    || EngineError::InvalidQuery(format!("unknown fragment {name}")),
                )?;
                let condition = fragment.node.type_condition.node.on.node.as_str();
                let (frag_cost, frag_depth) = score_set(
                    &fragment.node.selection_set.node,
                    schema.get_type(condition),
                    schema,
                    variables,
                    limits,
                    depth,
                    document,
                    active_fragments,
                )?;
                active_fragments.remove(&name);
                cost += frag_cost;
                max_depth = max_depth.max(frag_depth);
            }
            Selection::InlineFragment(inline) => {
                let condition = inline
                    .node
                    .type_condition
                    .as_ref()
                    .map(|c| c.node.on.node.as_str());
                let target = condition.and_then(|c| schema.get_type(c)).or(parent);
                let (frag_cost, frag_depth) = score_set(
                    &inline.node.selection_set.node,
                    target,
                    schema,
                    variables,
                    limits,
                    depth,
                    document,
                    active_fragments,
                )?;
                cost += frag_cost;
                max_depth = max_depth.max(frag_depth);
            }
        }
    }
    Ok((cost, max_depth))
}

fn named_object<'a>(type_ref: &TypeRef, schema: &'a Schema) -> Option<&'a GeneratedType> {
    match type_ref {
        TypeRef::Scalar(_) => None,
        TypeRef::Named(name) => schema.get_type(name),
        TypeRef::List(inner) => named_object(inner, schema),
    }
}

/// Effective page size for a list field: its `first` argument, else default.
fn page_size(field: &Field, variables: &Variables, limits: &Limits) -> Result<usize, EngineError> {
    for (name, value) in &field.arguments {
        if name.node.as_str() != "first" {
            continue;
        }
        let resolved = match &value.node {
            Value::Variable(var) => variables.get(var).cloned(),
            other => other.clone().into_const(),
        };
        let Some(ConstValue::Number(n)) = resolved else {
            return Err(EngineError::InvalidQuery(
                "first must be a non-negative integer".into(),
            ));
        };
        return n
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| EngineError::InvalidQuery("first must be a non-negative integer".into()));
    }
    Ok(limits.default_page_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Fingerprint, GenerationOptions, TypeBuilder};
    use crate::metadata::Introspector;
    use async_graphql_parser::parse_query;
    use modelql_datasource::{EntityDescriptor, FieldDescriptor, RelationDescriptor, ScalarType};

    fn schema() -> Schema {
        let raw = vec![
            EntityDescriptor::new("User")
                .with_field(FieldDescriptor::new("username", ScalarType::String))
                .with_relation(RelationDescriptor::to_many("posts", "Post", "author")),
            EntityDescriptor::new("Post")
                .with_field(FieldDescriptor::new("title", ScalarType::String))
                .with_relation(RelationDescriptor::to_one("author", "User")),
        ];
        let options = GenerationOptions::default();
        let models = Introspector::normalize(&raw, &options).unwrap();
        let fingerprint = Fingerprint::compute(&models, &options);
        TypeBuilder::build(fingerprint, models, &options).unwrap()
    }

    fn limits() -> Limits {
        Limits {
            max_complexity: 1000,
            max_depth: 10,
            default_page_size: 20,
        }
    }

    fn run(query: &str) -> Result<QueryBudget, EngineError> {
        run_with(query, Variables::default(), limits())
    }

    fn run_with(
        query: &str,
        variables: Variables,
        limits: Limits,
    ) -> Result<QueryBudget, EngineError> {
        let document = parse_query(query).unwrap();
        analyze(&document, &variables, &schema(), &limits)
    }

    #[test]
    fn test_leaf_costs_one() {
        let budget = run("{ user(id: \"1\") { id username } }").unwrap();
        assert_eq!(budget.complexity, 3);
        assert_eq!(budget.depth, 2);
    }

    #[test]
    fn test_list_multiplies_by_first() {
        // posts(first: 5) { title } = 1 + 5 * 1; plus the user wrapper.
        let budget = run("{ user(id: \"1\") { posts(first: 5) { title } } }").unwrap();
        assert_eq!(budget.complexity, 1 + (1 + 5));
        assert_eq!(budget.depth, 3);
    }

    #[test]
    fn test_list_without_first_uses_default_page_size() {
        let budget = run("{ user(id: \"1\") { posts { title } } }").unwrap();
        assert_eq!(budget.complexity, 1 + (1 + 20));
    }

    #[test]
    fn test_first_from_variable() {
        let variables = Variables::from_json(serde_json::json!({ "n": 3 }));
        let budget = run_with(
            "query Q($n: Int) { user(id: \"1\") { posts(first: $n) { title } } }",
            variables,
            limits(),
        )
        .unwrap();
        assert_eq!(budget.complexity, 1 + (1 + 3));
    }

    #[test]
    fn test_complexity_gate() {
        let mut limits = limits();
        limits.max_complexity = 5;
        let err = run_with(
            "{ users { nodes { posts { title } } } }",
            Variables::default(),
            limits,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ComplexityExceeded { .. }));
    }

    #[test]
    fn test_depth_gate_boundary() {
        let mut limits = limits();
        limits.max_depth = 4;
        // Exactly at the limit passes.
        assert!(run_with(
            "{ user(id: \"1\") { posts { author { username } } } }",
            Variables::default(),
            limits,
        )
        .is_ok());
        // One level deeper fails.
        let err = run_with(
            "{ user(id: \"1\") { posts { author { posts { title } } } } }",
            Variables::default(),
            limits,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::DepthExceeded { actual: 5, max: 4 }
        ));
    }

    #[test]
    fn test_fragments_followed() {
        let budget = run(
            "{ user(id: \"1\") { ...UserBits } } fragment UserBits on User { id username }",
        )
        .unwrap();
        assert_eq!(budget.complexity, 3);
    }

    #[test]
    fn test_root_fragment_spread_scored_like_fields() {
        let budget = run(
            "{ ...Roots } fragment Roots on Query { user(id: \"1\") { id username } }",
        )
        .unwrap();
        assert_eq!(budget.complexity, 3);
        assert_eq!(budget.depth, 2);
    }

    #[test]
    fn test_root_fragment_respects_gate() {
        let mut limits = limits();
        limits.max_complexity = 5;
        let err = run_with(
            "{ ...Roots } fragment Roots on Query { users { nodes { posts { title } } } }",
            Variables::default(),
            limits,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ComplexityExceeded { .. }));
    }

    #[test]
    fn test_fragment_cycle_rejected() {
        let err = run(
            "{ user(id: \"1\") { ...A } } \
             fragment A on User { ...B } \
             fragment B on User { ...A }",
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidQuery(_)));
    }

    #[test]
    fn test_unknown_field_scores_as_leaf() {
        let budget = run("{ user(id: \"1\") { nonexistent } }").unwrap();
        assert_eq!(budget.complexity, 2);
    }
}
