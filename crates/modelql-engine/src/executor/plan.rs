//! Conversion of a parsed document into the request-scoped query plan.
//!
//! The plan is a plain tree: fragments are inlined, variables substituted,
//! arguments turned into JSON. It exists for one request and is dropped with
//! the [`RequestContext`](crate::context::RequestContext).

use std::collections::HashSet;

use async_graphql_parser::types::{ExecutableDocument, OperationType, Selection, SelectionSet};
use async_graphql_value::{ConstValue, Variables};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map as JsonMap, Value};

use modelql_datasource::{Condition, Filter};

use crate::analyze::single_operation;
use crate::error::EngineError;
use crate::schema::{FilterOp, GeneratedType};

/// Which kind of operation the request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Read-only.
    Query,
    /// State-changing.
    Mutation,
}

/// One field of the plan tree.
#[derive(Debug, Clone)]
pub struct PlanField {
    /// Key under which the value appears in the response (alias or name).
    pub response_key: String,
    /// Schema field name.
    pub name: String,
    /// Const-resolved arguments.
    pub arguments: JsonMap<String, Value>,
    /// Sub-selection, empty for leaves.
    pub children: Vec<PlanField>,
}

impl PlanField {
    /// Returns an argument by name.
    #[must_use]
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    /// Returns the `first` argument as a count, if present.
    pub fn first(&self) -> Result<Option<usize>, String> {
        match self.argument("first") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| "first must be a non-negative integer".into()),
            Some(_) => Err("first must be a non-negative integer".into()),
        }
    }

    /// Returns the first child with the given schema field name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&PlanField> {
        self.children.iter().find(|c| c.name == name)
    }
}

/// The plan for one request.
#[derive(Debug)]
pub struct QueryPlan {
    /// Query or mutation.
    pub operation: OperationKind,
    /// Root fields in document order.
    pub roots: Vec<PlanField>,
}

/// Builds the plan from a parsed document and resolved variables.
///
/// # Errors
///
/// Returns [`EngineError::InvalidQuery`] for undefined variables, unknown or
/// cyclic fragments, or subscription operations.
pub fn build_plan(
    document: &ExecutableDocument,
    variables: &Variables,
) -> Result<QueryPlan, EngineError> {
    let operation = single_operation(document)?;
    let kind = match operation.ty {
        OperationType::Query => OperationKind::Query,
        OperationType::Mutation => OperationKind::Mutation,
        OperationType::Subscription => {
            return Err(EngineError::InvalidQuery(
                "subscriptions are not supported".into(),
            ));
        }
    };

    let mut active = HashSet::new();
    let roots = convert_set(&operation.selection_set.node, document, variables, &mut active)?;
    Ok(QueryPlan {
        operation: kind,
        roots,
    })
}

fn convert_set(
    set: &SelectionSet,
    document: &ExecutableDocument,
    variables: &Variables,
    active: &mut HashSet<String>,
) -> Result<Vec<PlanField>, EngineError> {
    let mut fields = Vec::new();
    for selection in &set.items {
        match &selection.node {
            Selection::Field(field) => {
                let field = &field.node;
                let name = field.name.node.to_string();
                let response_key = field
                    .alias
                    .as_ref()
                    .map_or_else(|| name.clone(), |a| a.node.to_string());

                let mut arguments = JsonMap::new();
                for (arg_name, arg_value) in &field.arguments {
                    let resolved = arg_value
                        .node
                        .clone()
                        .into_const_with(|var| {
                            variables.get(&var).cloned().ok_or_else(|| {
                                EngineError::InvalidQuery(format!("undefined variable ${var}"))
                            })
                        })?;
                    arguments.insert(arg_name.node.to_string(), const_to_json(resolved)?);
                }

                fields.push(PlanField {
                    response_key,
                    name,
                    arguments,
                    children: convert_set(&field.selection_set.node, document, variables, active)?,
                });
            }
            Selection::FragmentSpread(spread) => {
                let name = spread.node.fragment_name.node.to_string();
                if !active.insert(name.clone()) {
                    return Err(EngineError::InvalidQuery(format!(
                        "fragment cycle through {name}"
                    )));
                }
                let fragment = document
                    .fragments
                    .get(&spread.node.fragment_name.node)
                    .ok_or_else(|| EngineError::InvalidQuery(format!("unknown fragment {name}")))?;
                fields.extend(convert_set(
                    &fragment.node.selection_set.node,
                    document,
                    variables,
                    active,
                )?);
                active.remove(&name);
            }
            Selection::InlineFragment(inline) => {
                fields.extend(convert_set(
                    &inline.node.selection_set.node,
                    document,
                    variables,
                    active,
                )?);
            }
        }
    }
    Ok(fields)
}

fn const_to_json(value: ConstValue) -> Result<Value, EngineError> {
    value
        .into_json()
        .map_err(|e| EngineError::InvalidQuery(format!("unrepresentable argument: {e}")))
}

/// Converts a filter argument into the datasource filter form, validating
/// each field and operator against the generated filter type.
///
/// # Errors
///
/// Returns a message suitable for a `ValidationError` on the list field.
pub fn filter_from_argument(filter_type: &GeneratedType, value: &Value) -> Result<Filter, String> {
    let Value::Object(entries) = value else {
        return Err("filter must be an object".into());
    };
    let mut filter = Filter::new();
    for (field_name, ops) in entries {
        let Some(field) = filter_type.filter_field(field_name) else {
            return Err(format!("unknown filter field {field_name}"));
        };
        let Value::Object(ops) = ops else {
            return Err(format!("filter for {field_name} must be an object of operators"));
        };
        for (op_name, operand) in ops {
            let Some(op) = FilterOp::parse(op_name) else {
                return Err(format!("unknown filter operator {op_name}"));
            };
            if !field.allows(op) {
                return Err(format!("operator {op_name} is not allowed on {field_name}"));
            }
            filter = filter.with(field_name.clone(), condition_for(op, operand)?);
        }
    }
    Ok(filter)
}

fn condition_for(op: FilterOp, operand: &Value) -> Result<Condition, String> {
    let as_string = |v: &Value| {
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| format!("{} expects a string operand", op.name()))
    };
    Ok(match op {
        FilterOp::Eq => Condition::Eq(operand.clone()),
        FilterOp::Contains => Condition::Contains(as_string(operand)?),
        FilterOp::StartsWith => Condition::StartsWith(as_string(operand)?),
        FilterOp::Gte => Condition::Gte(operand.clone()),
        FilterOp::Lte => Condition::Lte(operand.clone()),
        FilterOp::Between => {
            let Value::Array(bounds) = operand else {
                return Err("between expects a two-element array".into());
            };
            let [low, high] = bounds.as_slice() else {
                return Err("between expects a two-element array".into());
            };
            Condition::Between(low.clone(), high.clone())
        }
        FilterOp::In => {
            let Value::Array(items) = operand else {
                return Err("in expects an array".into());
            };
            Condition::In(items.clone())
        }
    })
}

/// Encodes an offset cursor.
#[must_use]
pub fn encode_cursor(offset: usize) -> String {
    BASE64.encode(format!("offset:{offset}"))
}

/// Decodes an offset cursor. The returned offset points at the item the
/// cursor was issued for; the next page starts one past it.
pub fn decode_cursor(cursor: &str) -> Result<usize, String> {
    let bytes = BASE64
        .decode(cursor)
        .map_err(|_| "malformed cursor".to_string())?;
    let text = String::from_utf8(bytes).map_err(|_| "malformed cursor".to_string())?;
    text.strip_prefix("offset:")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| "malformed cursor".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_graphql_parser::parse_query;
    use serde_json::json;

    fn plan(query: &str, variables: Value) -> Result<QueryPlan, EngineError> {
        let document = parse_query(query).unwrap();
        build_plan(&document, &Variables::from_json(variables))
    }

    #[test]
    fn test_plan_shape() {
        let plan = plan(
            "{ user(id: \"1\") { username posts(first: 2) { title } } }",
            json!({}),
        )
        .unwrap();
        assert_eq!(plan.operation, OperationKind::Query);
        assert_eq!(plan.roots.len(), 1);

        let user = &plan.roots[0];
        assert_eq!(user.name, "user");
        assert_eq!(user.argument("id"), Some(&json!("1")));
        let posts = user.child("posts").unwrap();
        assert_eq!(posts.first().unwrap(), Some(2));
    }

    #[test]
    fn test_alias_becomes_response_key() {
        let plan = plan("{ me: user(id: \"1\") { id } }", json!({})).unwrap();
        assert_eq!(plan.roots[0].response_key, "me");
        assert_eq!(plan.roots[0].name, "user");
    }

    #[test]
    fn test_variables_substituted() {
        let plan = plan(
            "query Q($id: ID!) { user(id: $id) { id } }",
            json!({ "id": "42" }),
        )
        .unwrap();
        assert_eq!(plan.roots[0].argument("id"), Some(&json!("42")));
    }

    #[test]
    fn test_undefined_variable_rejected() {
        let err = plan("{ user(id: $missing) { id } }", json!({})).unwrap_err();
        assert!(matches!(err, EngineError::InvalidQuery(_)));
    }

    #[test]
    fn test_fragments_inlined() {
        let plan = plan(
            "{ user(id: \"1\") { ...Bits } } fragment Bits on User { id username }",
            json!({}),
        )
        .unwrap();
        let names: Vec<&str> = plan.roots[0].children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "username"]);
    }

    #[test]
    fn test_mutation_operation_kind() {
        let plan = plan(
            "mutation { createUser(input: { username: \"a\" }) { id } }",
            json!({}),
        )
        .unwrap();
        assert_eq!(plan.operation, OperationKind::Mutation);
        assert_eq!(
            plan.roots[0].argument("input"),
            Some(&json!({ "username": "a" }))
        );
    }

    #[test]
    fn test_cursor_round_trip() {
        let cursor = encode_cursor(19);
        assert_eq!(decode_cursor(&cursor).unwrap(), 19);
        assert!(decode_cursor("not-base64!").is_err());
        assert!(decode_cursor(&BASE64.encode("offset:abc")).is_err());
    }
}
