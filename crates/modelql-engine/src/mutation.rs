//! The mutation state machine.
//!
//! Every mutation runs `Validating -> Authorizing -> Applying ->
//! Invalidating -> Completed`, falling to `Failed` from any state. Nothing
//! is rolled back here: once `Applying` has started, cancellation lets the
//! write complete and only suppresses the response value.

use serde_json::{Map as JsonMap, Value};
use tracing::{debug, trace, warn};

use modelql_datasource::{
    DatasourceError, FetchRequest, KeySet, Record, ScalarType, WriteOp,
};

use crate::context::RequestContext;
use crate::error::{EngineError, FieldError, PathSegment};
use crate::executor::{Engine, PlanField, QueryPlan, Resolver, Response};
use crate::metadata::ModelMetadata;
use crate::schema::{GeneratedType, RootKind, Schema, TypeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationState {
    Validating,
    Authorizing,
    Applying,
    Invalidating,
    Completed,
    Failed,
}

struct Machine {
    state: MutationState,
}

impl Machine {
    fn start() -> Self {
        trace!(state = ?MutationState::Validating, "Mutation started");
        Self {
            state: MutationState::Validating,
        }
    }

    fn advance(&mut self, next: MutationState) {
        trace!(from = ?self.state, to = ?next, "Mutation state transition");
        self.state = next;
    }

    fn fail(&mut self) {
        self.advance(MutationState::Failed);
    }
}

/// How one mutation root resolved.
enum Outcome {
    /// Failed or suppressed: the response value is null.
    Null,
    /// One created/updated/deleted record, as an arena node.
    Node(usize),
    /// Bulk results in item order, `None` for failed or skipped items.
    Many(Vec<Option<usize>>),
}

/// Executes the mutation roots of a plan, in document order.
pub(crate) async fn execute(
    engine: &Engine,
    schema: &Schema,
    plan: &QueryPlan,
    ctx: &RequestContext,
) -> Result<Response, EngineError> {
    let mut resolver = Resolver::new(schema, &engine.datasource, &engine.policies, ctx, &engine.config);
    let mut errors = Vec::new();
    let mut outcomes = Vec::new();
    let mut first_level = Vec::new();

    for root in &plan.roots {
        let path = vec![PathSegment::from(root.response_key.clone())];

        let Some(binding) = schema.mutation_root(&root.name) else {
            errors.push(FieldError::validation(
                path,
                format!("unknown mutation field {}", root.name),
            ));
            outcomes.push((root, Outcome::Null));
            continue;
        };
        let entity = binding.entity.clone();
        debug!(entity = %entity, kind = ?binding.kind, "Executing mutation");

        let outcome = match binding.kind {
            RootKind::CreateMany => {
                run_bulk_create(
                    engine, schema, ctx, &entity, root, &mut resolver, &mut errors, &mut first_level,
                )
                .await
            }
            kind => {
                match run_single(engine, schema, ctx, &entity, kind, root, path).await {
                    Ok(Some(record)) => {
                        let idx = resolver.add_node(&entity, record, root.children.clone());
                        first_level.push(idx);
                        Outcome::Node(idx)
                    }
                    Ok(None) => Outcome::Null,
                    Err(mut item_errors) => {
                        errors.append(&mut item_errors);
                        Outcome::Null
                    }
                }
            }
        };
        outcomes.push((root, outcome));
    }

    resolver.load_relations(first_level).await?;

    let mut data = JsonMap::new();
    for (root, outcome) in outcomes {
        let mut path = vec![PathSegment::from(root.response_key.clone())];
        let value = match outcome {
            Outcome::Null => Value::Null,
            Outcome::Node(idx) => resolver.shape(idx, &mut path, &mut errors),
            Outcome::Many(items) => {
                let mut shaped = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    match item {
                        None => shaped.push(Value::Null),
                        Some(idx) => {
                            path.push(PathSegment::from(i));
                            shaped.push(resolver.shape(idx, &mut path, &mut errors));
                            path.pop();
                        }
                    }
                }
                Value::Array(shaped)
            }
        };
        data.insert(root.response_key.clone(), value);
    }

    Ok(Response {
        data: Value::Object(data),
        errors,
    })
}

/// Runs one non-bulk mutation. `Ok(None)` means the write committed but the
/// response is suppressed because the request was cancelled mid-flight.
async fn run_single(
    engine: &Engine,
    schema: &Schema,
    ctx: &RequestContext,
    entity: &str,
    kind: RootKind,
    root: &PlanField,
    path: Vec<PathSegment>,
) -> Result<Option<Record>, Vec<FieldError>> {
    let mut machine = Machine::start();
    let dev = engine.config.development_mode;
    let fail_with = |machine: &mut Machine, errors: Vec<FieldError>| {
        machine.fail();
        errors
    };

    if ctx.is_cancelled() {
        return Err(fail_with(
            &mut machine,
            vec![FieldError::internal(path, "request cancelled", dev)],
        ));
    }

    let Some(model) = schema.model(entity) else {
        return Err(fail_with(
            &mut machine,
            vec![FieldError::internal(path, format!("no model for {entity}"), dev)],
        ));
    };

    // Validating.
    let op = match kind {
        RootKind::Create => {
            let input = match required_input(root, &path) {
                Ok(input) => input,
                Err(errors) => return Err(fail_with(&mut machine, errors)),
            };
            let input_type = input_type(schema, entity, TypeKind::CreateInput, &path, dev)
                .map_err(|e| fail_with(&mut machine, e))?;
            let record = validate_input(input_type, model, input, true, &path)
                .map_err(|e| fail_with(&mut machine, e))?;
            WriteOp::Create(record)
        }
        RootKind::Update => {
            let id = match required_id(root, &path) {
                Ok(id) => id,
                Err(errors) => return Err(fail_with(&mut machine, errors)),
            };
            let input = match required_input(root, &path) {
                Ok(input) => input,
                Err(errors) => return Err(fail_with(&mut machine, errors)),
            };
            let input_type = input_type(schema, entity, TypeKind::UpdateInput, &path, dev)
                .map_err(|e| fail_with(&mut machine, e))?;
            let patch = validate_input(input_type, model, input, false, &path)
                .map_err(|e| fail_with(&mut machine, e))?;
            WriteOp::Update(id, patch)
        }
        RootKind::Delete => {
            let id = match required_id(root, &path) {
                Ok(id) => id,
                Err(errors) => return Err(fail_with(&mut machine, errors)),
            };
            WriteOp::Delete(id)
        }
        _ => {
            return Err(fail_with(
                &mut machine,
                vec![FieldError::internal(path, "unsupported mutation kind", dev)],
            ));
        }
    };

    // Authorizing: operation level always, object level for targeted writes.
    machine.advance(MutationState::Authorizing);
    let decision = engine.policies.check_operation(ctx, entity, kind);
    if !decision.is_allowed() {
        return Err(fail_with(
            &mut machine,
            vec![FieldError::permission(
                path,
                decision
                    .denial_reason()
                    .unwrap_or("operation not permitted")
                    .to_string(),
            )],
        ));
    }
    if let WriteOp::Update(id, _) | WriteOp::Delete(id) = &op {
        let request = FetchRequest::new(entity)
            .with_keys(KeySet::new(model.primary_key.clone(), vec![Value::String(id.clone())]));
        let target = match engine.datasource.fetch(&request).await {
            Ok(records) => records.into_iter().next(),
            Err(e) => {
                return Err(fail_with(
                    &mut machine,
                    vec![FieldError::internal(path, e.to_string(), dev)],
                ));
            }
        };
        let Some(target) = target else {
            return Err(fail_with(
                &mut machine,
                vec![FieldError::not_found(
                    path,
                    format!("{entity} with id {id} not found"),
                )],
            ));
        };
        let decision = engine.policies.check_object(ctx, entity, &target);
        if !decision.is_allowed() {
            return Err(fail_with(
                &mut machine,
                vec![FieldError::permission(
                    path,
                    decision
                        .denial_reason()
                        .unwrap_or("object access denied")
                        .to_string(),
                )],
            ));
        }
    }

    if ctx.is_cancelled() {
        return Err(fail_with(
            &mut machine,
            vec![FieldError::internal(path, "request cancelled", dev)],
        ));
    }

    // Applying: from here the write runs to completion.
    machine.advance(MutationState::Applying);
    let applied = match engine.datasource.apply(entity, op).await {
        Ok(record) => record,
        Err(e) => {
            let error = match &e {
                DatasourceError::NotFound { .. } => FieldError::not_found(path, e.to_string()),
                _ => FieldError::internal(path, e.to_string(), dev),
            };
            return Err(fail_with(&mut machine, vec![error]));
        }
    };

    // Invalidating: always follows a committed apply.
    machine.advance(MutationState::Invalidating);
    let id = applied
        .get(&model.primary_key)
        .and_then(Value::as_str)
        .map(str::to_string);
    match &id {
        Some(id) => {
            engine.cache.invalidate_entity(entity, Some(id));
        }
        None => {
            warn!(entity, "Applied record has no primary key; invalidating entity-wide");
            engine.cache.invalidate_entity(entity, None);
        }
    }

    machine.advance(MutationState::Completed);
    if ctx.is_cancelled() {
        // The write committed; only the response is suppressed.
        return Ok(None);
    }
    Ok(Some(applied))
}

#[allow(clippy::too_many_arguments)]
async fn run_bulk_create(
    engine: &Engine,
    schema: &Schema,
    ctx: &RequestContext,
    entity: &str,
    root: &PlanField,
    resolver: &mut Resolver<'_>,
    errors: &mut Vec<FieldError>,
    first_level: &mut Vec<usize>,
) -> Outcome {
    let base_path = vec![PathSegment::from(root.response_key.clone())];
    let Some(Value::Array(items)) = root.argument("input") else {
        errors.push(FieldError::validation(base_path, "input must be an array"));
        return Outcome::Null;
    };
    let items = items.clone();
    let total = items.len();

    let mut results = Vec::with_capacity(total);
    for (index, item) in items.into_iter().enumerate() {
        let item_path = vec![
            PathSegment::from(root.response_key.clone()),
            PathSegment::from(index),
        ];
        // Each item runs the full machine with the item index in its path.
        let mut item_field = root.clone();
        item_field.arguments.insert("input".into(), item);
        let result = run_single(
            engine,
            schema,
            ctx,
            entity,
            RootKind::Create,
            &item_field,
            item_path,
        )
        .await;

        match result {
            Ok(Some(record)) => {
                let idx = resolver.add_node(entity, record, root.children.clone());
                first_level.push(idx);
                results.push(Some(idx));
            }
            Ok(None) => results.push(None),
            Err(mut item_errors) => {
                errors.append(&mut item_errors);
                results.push(None);
                if engine.config.fail_fast_bulk_mutations {
                    // Remaining items are skipped; applied ones stand.
                    results.resize(total, None);
                    break;
                }
            }
        }
    }
    Outcome::Many(results)
}

fn required_input<'a>(
    root: &'a PlanField,
    path: &[PathSegment],
) -> Result<&'a JsonMap<String, Value>, Vec<FieldError>> {
    match root.argument("input") {
        Some(Value::Object(input)) => Ok(input),
        _ => Err(vec![FieldError::validation(
            path.to_vec(),
            "input must be an object",
        )]),
    }
}

fn required_id(root: &PlanField, path: &[PathSegment]) -> Result<String, Vec<FieldError>> {
    root.argument("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| vec![FieldError::validation(path.to_vec(), "id must be a string")])
}

fn input_type<'a>(
    schema: &'a Schema,
    entity: &str,
    kind: TypeKind,
    path: &[PathSegment],
    development_mode: bool,
) -> Result<&'a GeneratedType, Vec<FieldError>> {
    schema.type_for(entity, kind).ok_or_else(|| {
        vec![FieldError::internal(
            path.to_vec(),
            format!("no input type for {entity}"),
            development_mode,
        )]
    })
}

/// Checks an input object against its generated input type and the model
/// constraints, returning the record to write. Collects every violation
/// instead of stopping at the first.
fn validate_input(
    input_type: &GeneratedType,
    model: &ModelMetadata,
    input: &JsonMap<String, Value>,
    create: bool,
    path: &[PathSegment],
) -> Result<Record, Vec<FieldError>> {
    let mut errors = Vec::new();
    let field_path = |name: &str| {
        let mut p = path.to_vec();
        p.push(PathSegment::from(name));
        p
    };

    for key in input.keys() {
        if input_type.field(key).is_none() {
            errors.push(FieldError::validation(
                field_path(key),
                format!("unknown input field {key}"),
            ));
        }
    }

    let mut record = Record::new();
    for type_field in input_type.fields() {
        let name = &type_field.name;
        match input.get(name) {
            None => {
                if let Some(default) = model.field(name).and_then(|f| f.default.clone()) {
                    if create {
                        record.insert(name.clone(), default);
                    }
                } else if create && !type_field.nullable {
                    errors.push(FieldError::validation(
                        field_path(name),
                        format!("{name} is required"),
                    ));
                }
            }
            Some(Value::Null) => {
                let base_nullable = model.field(name).is_none_or(|f| f.nullable);
                if base_nullable {
                    record.insert(name.clone(), Value::Null);
                } else {
                    errors.push(FieldError::validation(
                        field_path(name),
                        format!("{name} may not be null"),
                    ));
                }
            }
            Some(value) => {
                if let Err(message) = check_value(type_field, model, name, value) {
                    errors.push(FieldError::validation(field_path(name), message));
                } else {
                    record.insert(name.clone(), value.clone());
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(record)
    } else {
        Err(errors)
    }
}

fn check_value(
    type_field: &crate::schema::TypeField,
    model: &ModelMetadata,
    name: &str,
    value: &Value,
) -> Result<(), String> {
    let crate::schema::TypeRef::Scalar(scalar) = &type_field.type_ref else {
        return Err(format!("{name} has a non-scalar input type"));
    };
    match scalar {
        ScalarType::Id | ScalarType::String => {
            let Some(s) = value.as_str() else {
                return Err(format!("{name} must be a string"));
            };
            if let Some(max) = model.field(name).and_then(|f| f.max_length) {
                if s.chars().count() > max {
                    return Err(format!("{name} exceeds maximum length {max}"));
                }
            }
        }
        ScalarType::Int => {
            if value.as_i64().is_none() {
                return Err(format!("{name} must be an integer"));
            }
        }
        ScalarType::Float => {
            if value.as_f64().is_none() {
                return Err(format!("{name} must be a number"));
            }
        }
        ScalarType::Boolean => {
            if !value.is_boolean() {
                return Err(format!("{name} must be a boolean"));
            }
        }
        ScalarType::DateTime => {
            let Some(s) = value.as_str() else {
                return Err(format!("{name} must be an RFC 3339 timestamp"));
            };
            time::OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
                .map_err(|_| format!("{name} must be an RFC 3339 timestamp"))?;
        }
    }
    if let Some(field) = model.field(name) {
        if let Some(n) = value.as_f64() {
            if field.min.is_some_and(|min| n < min) {
                return Err(format!("{name} is below the minimum"));
            }
            if field.max.is_some_and(|max| n > max) {
                return Err(format!("{name} is above the maximum"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Introspector;
    use crate::schema::{Fingerprint, GenerationOptions, TypeBuilder};
    use modelql_datasource::{EntityDescriptor, FieldDescriptor};
    use serde_json::json;

    fn schema() -> Schema {
        let raw = vec![EntityDescriptor::new("User")
            .with_field(FieldDescriptor::new("username", ScalarType::String).required().with_max_length(8))
            .with_field(FieldDescriptor::new("age", ScalarType::Int).with_range(Some(0.0), Some(150.0)))
            .with_field(
                FieldDescriptor::new("active", ScalarType::Boolean).with_default(json!(true)),
            )
            .with_field(FieldDescriptor::new("joined", ScalarType::DateTime))];
        let options = GenerationOptions::default();
        let models = Introspector::normalize(&raw, &options).unwrap();
        let fingerprint = Fingerprint::compute(&models, &options);
        TypeBuilder::build(fingerprint, models, &options).unwrap()
    }

    fn validate(input: Value, create: bool) -> Result<Record, Vec<FieldError>> {
        let schema = schema();
        let kind = if create {
            TypeKind::CreateInput
        } else {
            TypeKind::UpdateInput
        };
        let input_type = schema.type_for("User", kind).unwrap();
        let model = schema.model("User").unwrap();
        let Value::Object(input) = input else { panic!("input must be an object") };
        validate_input(input_type, model, &input, create, &["createUser".into()])
    }

    #[test]
    fn test_valid_create_applies_defaults() {
        let record = validate(json!({ "username": "ada" }), true).unwrap();
        assert_eq!(record["username"], json!("ada"));
        assert_eq!(record["active"], json!(true));
    }

    #[test]
    fn test_missing_required_field() {
        let errors = validate(json!({ "age": 30 }), true).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("username is required"));
        let json = serde_json::to_value(&errors[0]).unwrap();
        assert_eq!(json["path"], json!(["createUser", "username"]));
    }

    #[test]
    fn test_unknown_input_field_rejected() {
        let errors = validate(json!({ "username": "ada", "admin": true }), true).unwrap_err();
        assert!(errors[0].message.contains("unknown input field admin"));
    }

    #[test]
    fn test_type_and_constraint_checks() {
        let errors = validate(
            json!({ "username": "far-too-long-name", "age": 200, "joined": "yesterday" }),
            true,
        )
        .unwrap_err();
        let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("maximum length")));
        assert!(messages.iter().any(|m| m.contains("above the maximum")));
        assert!(messages.iter().any(|m| m.contains("RFC 3339")));
    }

    #[test]
    fn test_update_allows_partial_input() {
        let record = validate(json!({ "age": 31 }), false).unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record["age"], json!(31));
    }

    #[test]
    fn test_null_for_required_base_field_rejected() {
        let errors = validate(json!({ "username": null }), false).unwrap_err();
        assert!(errors[0].message.contains("may not be null"));
    }

    #[test]
    fn test_valid_datetime_accepted() {
        let record = validate(
            json!({ "username": "ada", "joined": "2024-06-01T12:00:00Z" }),
            true,
        )
        .unwrap();
        assert_eq!(record["joined"], json!("2024-06-01T12:00:00Z"));
    }
}
