//! Request execution: root resolution, breadth-first relation loading and
//! response shaping.
//!
//! Execution is level-by-level rather than field-by-field. All relation
//! fields of one level accumulate into batches which flush with one fetch
//! each, so N sibling parents asking for the same relation cost one backend
//! round trip instead of N.

mod loaders;
mod plan;

pub use loaders::{BatchKey, BatchSet, LoadedBatch};
pub use plan::{OperationKind, PlanField, QueryPlan, build_plan};
pub(crate) use plan::{decode_cursor, encode_cursor, filter_from_argument};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_graphql_parser::parse_query;
use async_graphql_value::Variables;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value, json};
use tracing::{debug, instrument};

use modelql_datasource::{
    DynDatasource, DynMetadataProvider, FetchRequest, KeySet, Record, RelationKind,
};

use crate::analyze::{Limits, analyze};
use crate::cache::{CacheManager, field_cache_key, query_cache_key};
use crate::config::EngineConfig;
use crate::context::{CancelFlag, Identity, RequestContext};
use crate::error::{EngineError, ErrorKind, FieldError, PathSegment};
use crate::permissions::PolicyChain;
use crate::schema::{GenerationOptions, RootKind, Schema, SchemaRegistry, TypeKind};

/// One request handed to [`Engine::execute`].
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// The query document.
    pub query: String,
    /// JSON object of variable values.
    pub variables: Value,
    /// The caller.
    pub identity: Identity,
    /// Cancellation flag shared with the transport.
    pub cancel: CancelFlag,
}

impl EngineRequest {
    /// Creates an anonymous request without variables.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: json!({}),
            identity: Identity::anonymous(),
            cancel: CancelFlag::new(),
        }
    }

    /// Sets the variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    /// Sets the caller identity.
    #[must_use]
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Wires a transport-owned cancellation flag.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

/// The response to one request. Sibling fields of a failed field still
/// resolve; each failure is attached at the narrowest path.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    /// The response tree.
    pub data: Value,
    /// Errors attached during execution, empty on full success.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

impl Response {
    /// Returns whether the response carries no errors.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn from_engine_error(err: &EngineError, development_mode: bool) -> Self {
        let error = match err {
            EngineError::ComplexityExceeded { .. } | EngineError::DepthExceeded { .. } => {
                FieldError::new(ErrorKind::ComplexityExceeded, Vec::new(), err.to_string())
            }
            EngineError::Schema(_) => {
                FieldError::new(ErrorKind::SchemaGeneration, Vec::new(), err.to_string())
            }
            EngineError::InvalidQuery(_) | EngineError::Configuration(_) => {
                FieldError::validation(Vec::new(), err.to_string())
            }
            EngineError::Cancelled | EngineError::Internal(_) => {
                FieldError::internal(Vec::new(), err.to_string(), development_mode)
            }
        };
        Self {
            data: Value::Null,
            errors: vec![error],
        }
    }
}

/// The query-execution engine.
///
/// Owns the schema registry, the cache tiers and the policy chain; the
/// datasource and metadata provider are injected.
pub struct Engine {
    pub(crate) config: EngineConfig,
    registry: Arc<SchemaRegistry>,
    pub(crate) datasource: DynDatasource,
    pub(crate) policies: PolicyChain,
    pub(crate) cache: CacheManager,
}

impl Engine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] when the configuration is
    /// invalid.
    pub fn new(
        config: EngineConfig,
        provider: DynMetadataProvider,
        datasource: DynDatasource,
        policies: PolicyChain,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let options = GenerationOptions::from_config(&config);
        let registry = Arc::new(SchemaRegistry::new(provider, options));
        let cache = CacheManager::new(&config);
        Ok(Self {
            config,
            registry,
            datasource,
            policies,
            cache,
        })
    }

    /// The schema registry, for definition-change notifications.
    #[must_use]
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Returns the current schema, compiling it on first use.
    ///
    /// # Errors
    ///
    /// Propagates schema compilation failures.
    pub async fn schema(&self) -> Result<Arc<Schema>, EngineError> {
        match self.registry.current_fingerprint() {
            Some(fingerprint) => self.registry.get_schema(fingerprint).await,
            None => self.registry.refresh().await,
        }
    }

    /// Drops all cached responses and recompiles the schema on next use.
    ///
    /// Call when the metadata provider reports a definition change.
    pub async fn reload(&self) -> Result<Arc<Schema>, EngineError> {
        if let Some(fingerprint) = self.registry.current_fingerprint() {
            self.registry.invalidate_schema(fingerprint);
        }
        self.cache.clear();
        self.registry.refresh().await
    }

    /// Stops the registry and drops all caches.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        self.cache.clear();
    }

    /// Executes one request. Request-level failures (parse errors, limit
    /// breaches, cancellation) produce a null-data response with one error.
    #[instrument(skip_all, fields(caller = %request.identity.partition()))]
    pub async fn execute(&self, request: EngineRequest) -> Response {
        match self.run(&request).await {
            Ok(response) => response,
            Err(err) => {
                debug!(error = %err, "Request aborted");
                Response::from_engine_error(&err, self.config.development_mode)
            }
        }
    }

    async fn run(&self, request: &EngineRequest) -> Result<Response, EngineError> {
        let schema = self.schema().await?;
        let document =
            parse_query(&request.query).map_err(|e| EngineError::InvalidQuery(e.to_string()))?;
        let variables = Variables::from_json(request.variables.clone());

        let limits = Limits {
            max_complexity: self.config.max_complexity,
            max_depth: self.config.max_depth,
            default_page_size: self.config.default_page_size,
        };
        analyze(&document, &variables, &schema, &limits)?;

        let plan = build_plan(&document, &variables)?;
        let ctx = RequestContext::with_cancel(request.identity.clone(), request.cancel.clone());

        match plan.operation {
            OperationKind::Mutation => crate::mutation::execute(self, &schema, &plan, &ctx).await,
            OperationKind::Query => {
                let key = query_cache_key(
                    schema.fingerprint,
                    &request.query,
                    &request.variables,
                    ctx.identity.partition(),
                );
                if let Some(data) = self.cache.get_query(&key) {
                    debug!("Query cache hit");
                    return Ok(Response {
                        data,
                        errors: Vec::new(),
                    });
                }

                let (data, errors, touched) = self.resolve_query(&schema, &plan, &ctx).await?;
                if errors.is_empty() {
                    self.cache
                        .put_query(key, data.clone(), touched.into_iter().collect());
                }
                Ok(Response { data, errors })
            }
        }
    }

    async fn resolve_query(
        &self,
        schema: &Schema,
        plan: &QueryPlan,
        ctx: &RequestContext,
    ) -> Result<(Value, Vec<FieldError>, BTreeSet<String>), EngineError> {
        let mut resolver = Resolver::new(schema, &self.datasource, &self.policies, ctx, &self.config);
        let mut errors = Vec::new();
        let mut roots = Vec::new();
        let mut first_level = Vec::new();

        for root in &plan.roots {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let value = self
                .resolve_root(schema, root, &mut resolver, &mut errors, &mut first_level)
                .await;
            roots.push((root, value));
        }

        resolver.load_relations(first_level).await?;

        let mut data = JsonMap::new();
        for (root, value) in roots {
            let mut path = vec![PathSegment::from(root.response_key.clone())];
            let shaped = match value {
                RootValue::Null => Value::Null,
                RootValue::Object(idx) => resolver.shape(idx, &mut path, &mut errors),
                RootValue::Connection(conn) => {
                    resolver.shape_connection(root, &conn, &mut path, &mut errors)
                }
            };
            data.insert(root.response_key.clone(), shaped);
        }
        Ok((Value::Object(data), errors, resolver.touched))
    }

    async fn resolve_root(
        &self,
        schema: &Schema,
        root: &PlanField,
        resolver: &mut Resolver<'_>,
        errors: &mut Vec<FieldError>,
        first_level: &mut Vec<usize>,
    ) -> RootValue {
        let path = || vec![PathSegment::from(root.response_key.clone())];

        let Some(binding) = schema.query_root(&root.name) else {
            errors.push(FieldError::validation(
                path(),
                format!("unknown query field {}", root.name),
            ));
            return RootValue::Null;
        };
        let entity = binding.entity.clone();

        let decision = self.policies.check_operation(resolver.ctx, &entity, binding.kind);
        if !decision.is_allowed() {
            errors.push(FieldError::permission(
                path(),
                decision
                    .denial_reason()
                    .unwrap_or("operation not permitted")
                    .to_string(),
            ));
            return RootValue::Null;
        }
        resolver.touched.insert(entity.clone());

        match binding.kind {
            RootKind::Read => {
                self.resolve_read_root(schema, root, &entity, resolver, errors, first_level)
                    .await
            }
            RootKind::List => {
                self.resolve_list_root(schema, root, &entity, resolver, errors, first_level)
                    .await
            }
            // Mutation roots never bind into the query root map.
            _ => RootValue::Null,
        }
    }

    async fn resolve_read_root(
        &self,
        schema: &Schema,
        root: &PlanField,
        entity: &str,
        resolver: &mut Resolver<'_>,
        errors: &mut Vec<FieldError>,
        first_level: &mut Vec<usize>,
    ) -> RootValue {
        let path = || vec![PathSegment::from(root.response_key.clone())];
        let Some(id) = root.argument("id").and_then(Value::as_str) else {
            errors.push(FieldError::validation(path(), "id must be a string"));
            return RootValue::Null;
        };
        let Some(model) = schema.model(entity) else {
            errors.push(FieldError::internal(
                path(),
                format!("no model for entity {entity}"),
                self.config.development_mode,
            ));
            return RootValue::Null;
        };

        let cache_key = field_cache_key(
            schema.fingerprint,
            entity,
            id,
            resolver.ctx.identity.partition(),
        );
        let record = match self.cache.get_field(&cache_key) {
            Some(Value::Object(record)) => Some(record),
            _ => {
                let request = FetchRequest::new(entity)
                    .with_keys(KeySet::new(model.primary_key.clone(), vec![json!(id)]));
                match self.datasource.fetch(&request).await {
                    Ok(records) => {
                        let record = records.into_iter().next();
                        if let Some(record) = &record {
                            self.cache.put_field(
                                cache_key,
                                Value::Object(record.clone()),
                                entity,
                                id,
                            );
                        }
                        record
                    }
                    Err(e) => {
                        errors.push(FieldError::internal(
                            path(),
                            e.to_string(),
                            self.config.development_mode,
                        ));
                        return RootValue::Null;
                    }
                }
            }
        };

        match record {
            Some(record) => {
                let idx = resolver.add_node(entity, record, root.children.clone());
                first_level.push(idx);
                RootValue::Object(idx)
            }
            None => {
                errors.push(FieldError::not_found(
                    path(),
                    format!("{entity} with id {id} not found"),
                ));
                RootValue::Null
            }
        }
    }

    async fn resolve_list_root(
        &self,
        schema: &Schema,
        root: &PlanField,
        entity: &str,
        resolver: &mut Resolver<'_>,
        errors: &mut Vec<FieldError>,
        first_level: &mut Vec<usize>,
    ) -> RootValue {
        let path = || vec![PathSegment::from(root.response_key.clone())];

        let mut request = FetchRequest::new(entity);
        if let Some(filter_arg) = root.argument("filter") {
            let Some(filter_type) = schema.type_for(entity, TypeKind::Filter) else {
                errors.push(FieldError::internal(
                    path(),
                    format!("no filter type for {entity}"),
                    self.config.development_mode,
                ));
                return RootValue::Null;
            };
            match filter_from_argument(filter_type, filter_arg) {
                Ok(filter) => request = request.with_filter(filter),
                Err(message) => {
                    errors.push(FieldError::validation(path(), message));
                    return RootValue::Null;
                }
            }
        }

        let first = match root.first() {
            Ok(first) => first.unwrap_or(self.config.default_page_size),
            Err(message) => {
                errors.push(FieldError::validation(path(), message));
                return RootValue::Null;
            }
        };
        let offset = match root.argument("after").and_then(Value::as_str) {
            None => 0,
            Some(cursor) => match decode_cursor(cursor) {
                Ok(position) => position + 1,
                Err(message) => {
                    errors.push(FieldError::validation(path(), message));
                    return RootValue::Null;
                }
            },
        };

        let records = match self.datasource.fetch(&request).await {
            Ok(records) => records,
            Err(e) => {
                errors.push(FieldError::internal(
                    path(),
                    e.to_string(),
                    self.config.development_mode,
                ));
                return RootValue::Null;
            }
        };

        let total = records.len();
        let page: Vec<Record> = records.into_iter().skip(offset).take(first).collect();
        let has_next = offset + page.len() < total;

        let node_selection = root.child("nodes").map(|c| c.children.clone());
        let edge_node_selection = root
            .child("edges")
            .and_then(|e| e.child("node"))
            .map(|n| n.children.clone());

        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for record in page {
            if let Some(selection) = &node_selection {
                let idx = resolver.add_node(entity, record.clone(), selection.clone());
                first_level.push(idx);
                nodes.push(idx);
            }
            if let Some(selection) = &edge_node_selection {
                let idx = resolver.add_node(entity, record.clone(), selection.clone());
                first_level.push(idx);
                edges.push(idx);
            }
        }

        RootValue::Connection(ConnectionValue {
            entity: entity.to_string(),
            total,
            offset,
            has_next,
            nodes,
            edges,
        })
    }
}

enum RootValue {
    Null,
    Object(usize),
    Connection(ConnectionValue),
}

struct ConnectionValue {
    entity: String,
    total: usize,
    offset: usize,
    has_next: bool,
    nodes: Vec<usize>,
    edges: Vec<usize>,
}

/// How one relation field of one parent resolved.
enum Slot {
    One(Option<usize>),
    Many(Vec<usize>),
    Failed(ErrorKind, String),
}

struct Node {
    entity: String,
    record: Record,
    selection: Vec<PlanField>,
    relations: HashMap<String, Slot>,
}

struct PendingRelation {
    node: usize,
    response_key: String,
    batch_key: BatchKey,
    parent_key: Value,
    kind: RelationKind,
    first: Option<usize>,
    children: Vec<PlanField>,
}

/// Request-scoped resolution state: the node arena and the entities touched.
pub(crate) struct Resolver<'a> {
    schema: &'a Schema,
    datasource: &'a DynDatasource,
    policies: &'a PolicyChain,
    pub(crate) ctx: &'a RequestContext,
    development_mode: bool,
    arena: Vec<Node>,
    pub(crate) touched: BTreeSet<String>,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(
        schema: &'a Schema,
        datasource: &'a DynDatasource,
        policies: &'a PolicyChain,
        ctx: &'a RequestContext,
        config: &EngineConfig,
    ) -> Self {
        Self {
            schema,
            datasource,
            policies,
            ctx,
            development_mode: config.development_mode,
            arena: Vec::new(),
            touched: BTreeSet::new(),
        }
    }

    pub(crate) fn add_node(
        &mut self,
        entity: &str,
        record: Record,
        selection: Vec<PlanField>,
    ) -> usize {
        self.arena.push(Node {
            entity: entity.to_string(),
            record,
            selection,
            relations: HashMap::new(),
        });
        self.arena.len() - 1
    }

    /// Resolves relations breadth-first until no level asks for more.
    pub(crate) async fn load_relations(&mut self, mut level: Vec<usize>) -> Result<(), EngineError> {
        while !level.is_empty() {
            if self.ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let mut batches = BatchSet::new();
            let mut pending = Vec::new();
            for &idx in &level {
                self.register_node_relations(idx, &mut batches, &mut pending);
            }
            if batches.is_empty() {
                break;
            }

            let loaded = batches.flush(self.datasource).await;

            let mut next_level = Vec::new();
            for entry in pending {
                let slot = match loaded[&entry.batch_key].records_for(&entry.parent_key) {
                    Err(message) => Slot::Failed(ErrorKind::Internal, message.to_string()),
                    Ok(records) => {
                        let mut records: Vec<Record> = records.into_iter().cloned().collect();
                        if let Some(first) = entry.first {
                            records.truncate(first);
                        }
                        let target = entry.batch_key.target.clone();
                        let mut children = Vec::new();
                        for record in records {
                            let child =
                                self.add_node(&target, record, entry.children.clone());
                            next_level.push(child);
                            children.push(child);
                        }
                        match entry.kind {
                            RelationKind::ToOne => Slot::One(children.first().copied()),
                            _ => Slot::Many(children),
                        }
                    }
                };
                self.arena[entry.node]
                    .relations
                    .insert(entry.response_key, slot);
            }
            level = next_level;
        }
        Ok(())
    }

    fn register_node_relations(
        &mut self,
        idx: usize,
        batches: &mut BatchSet,
        pending: &mut Vec<PendingRelation>,
    ) {
        let Some(model) = self.schema.model(&self.arena[idx].entity) else {
            return;
        };
        let model = model.clone();
        let fields = self.arena[idx].selection.clone();
        let record = self.arena[idx].record.clone();

        for field in fields {
            let Some(relation) = model.relation(&field.name) else {
                continue;
            };

            let fail = |resolver: &mut Self, kind: ErrorKind, message: String| {
                resolver.arena[idx]
                    .relations
                    .insert(field.response_key.clone(), Slot::Failed(kind, message));
            };

            // Relation targets need operation-level read access just like
            // root fields; a denial fails the subtree before any batch forms.
            let decision =
                self.policies
                    .check_operation(self.ctx, &relation.target, RootKind::Read);
            if !decision.is_allowed() {
                let message = decision
                    .denial_reason()
                    .unwrap_or("operation not permitted")
                    .to_string();
                fail(self, ErrorKind::Permission, message);
                continue;
            }

            if let Some(bad) = field
                .arguments
                .keys()
                .find(|k| !matches!(k.as_str(), "filter" | "first"))
            {
                let message = format!("unknown argument {bad}");
                fail(self, ErrorKind::Validation, message);
                continue;
            }
            let first = match field.first() {
                Ok(first) => first,
                Err(message) => {
                    fail(self, ErrorKind::Validation, message);
                    continue;
                }
            };
            let filter = match field.argument("filter") {
                None => None,
                Some(arg) => {
                    let filter_type = self
                        .schema
                        .type_for(&relation.target, TypeKind::Filter);
                    let Some(filter_type) = filter_type else {
                        let message = format!("no filter type for {}", relation.target);
                        fail(self, ErrorKind::Internal, message);
                        continue;
                    };
                    match filter_from_argument(filter_type, arg) {
                        Ok(filter) => Some(filter),
                        Err(message) => {
                            fail(self, ErrorKind::Validation, message);
                            continue;
                        }
                    }
                }
            };

            let key_field = match relation.kind {
                RelationKind::ToOne => self
                    .schema
                    .model(&relation.target)
                    .map(|m| m.primary_key.clone()),
                RelationKind::ToMany | RelationKind::ManyToMany => relation.inverse.clone(),
            };
            let Some(key_field) = key_field else {
                let message = format!("relation {} has no usable key", field.name);
                fail(self, ErrorKind::Internal, message);
                continue;
            };

            let Some(parent_key) =
                loaders::parent_key(relation.kind, &record, &relation.name, &model.primary_key)
            else {
                // Nothing to load: a null to-one reference or a missing key.
                let slot = match relation.kind {
                    RelationKind::ToOne => Slot::One(None),
                    _ => Slot::Many(Vec::new()),
                };
                self.arena[idx]
                    .relations
                    .insert(field.response_key.clone(), slot);
                continue;
            };

            let batch_key = BatchKey {
                target: relation.target.clone(),
                source: model.entity.clone(),
                relation: relation.name.clone(),
                args: serde_json::to_string(&field.arguments).unwrap_or_default(),
            };
            self.touched.insert(relation.target.clone());
            batches.add(batch_key.clone(), &key_field, filter, parent_key.clone());
            pending.push(PendingRelation {
                node: idx,
                response_key: field.response_key.clone(),
                batch_key,
                parent_key,
                kind: relation.kind,
                first,
                children: field.children.clone(),
            });
        }
    }

    /// Shapes one loaded node into a response value, applying object- and
    /// field-level permissions.
    pub(crate) fn shape(
        &self,
        idx: usize,
        path: &mut Vec<PathSegment>,
        errors: &mut Vec<FieldError>,
    ) -> Value {
        let node = &self.arena[idx];

        let decision = self.policies.check_object(self.ctx, &node.entity, &node.record);
        if !decision.is_allowed() {
            errors.push(FieldError::permission(
                path.clone(),
                decision
                    .denial_reason()
                    .unwrap_or("object access denied")
                    .to_string(),
            ));
            return Value::Null;
        }

        let object_type = self.schema.type_for(&node.entity, TypeKind::Object);
        let mut out = JsonMap::new();
        for field in &node.selection {
            path.push(PathSegment::from(field.response_key.clone()));
            let value = if field.name == "__typename" {
                Value::String(
                    object_type
                        .map_or_else(|| node.entity.clone(), |t| t.name.clone()),
                )
            } else if let Some(slot) = node.relations.get(&field.response_key) {
                self.shape_slot(slot, path, errors)
            } else {
                self.shape_scalar(node, object_type.and_then(|t| t.field(&field.name)), field, path, errors)
            };
            out.insert(field.response_key.clone(), value);
            path.pop();
        }
        Value::Object(out)
    }

    fn shape_slot(
        &self,
        slot: &Slot,
        path: &mut Vec<PathSegment>,
        errors: &mut Vec<FieldError>,
    ) -> Value {
        match slot {
            Slot::One(None) => Value::Null,
            Slot::One(Some(child)) => self.shape(*child, path, errors),
            Slot::Many(children) => {
                let mut items = Vec::with_capacity(children.len());
                for (i, &child) in children.iter().enumerate() {
                    path.push(PathSegment::from(i));
                    items.push(self.shape(child, path, errors));
                    path.pop();
                }
                Value::Array(items)
            }
            Slot::Failed(kind, message) => {
                errors.push(match kind {
                    ErrorKind::Internal => {
                        FieldError::internal(path.clone(), message.clone(), self.development_mode)
                    }
                    kind => FieldError::new(*kind, path.clone(), message.clone()),
                });
                Value::Null
            }
        }
    }

    fn shape_scalar(
        &self,
        node: &Node,
        type_field: Option<&crate::schema::TypeField>,
        field: &PlanField,
        path: &mut Vec<PathSegment>,
        errors: &mut Vec<FieldError>,
    ) -> Value {
        match type_field {
            Some(type_field) if type_field.relation.is_none() => {
                let decision =
                    self.policies
                        .check_field(self.ctx, &node.entity, &field.name, &node.record);
                if decision.is_allowed() {
                    node.record.get(&field.name).cloned().unwrap_or(Value::Null)
                } else {
                    errors.push(FieldError::permission(
                        path.clone(),
                        decision
                            .denial_reason()
                            .unwrap_or("field access denied")
                            .to_string(),
                    ));
                    Value::Null
                }
            }
            _ => {
                errors.push(FieldError::validation(
                    path.clone(),
                    format!("unknown field {} on {}", field.name, node.entity),
                ));
                Value::Null
            }
        }
    }

    fn shape_connection(
        &self,
        root: &PlanField,
        conn: &ConnectionValue,
        path: &mut Vec<PathSegment>,
        errors: &mut Vec<FieldError>,
    ) -> Value {
        let mut out = JsonMap::new();
        let page_len = conn.nodes.len().max(conn.edges.len());
        for field in &root.children {
            path.push(PathSegment::from(field.response_key.clone()));
            let value = match field.name.as_str() {
                "nodes" => {
                    let mut items = Vec::with_capacity(conn.nodes.len());
                    for (i, &idx) in conn.nodes.iter().enumerate() {
                        path.push(PathSegment::from(i));
                        items.push(self.shape(idx, path, errors));
                        path.pop();
                    }
                    Value::Array(items)
                }
                "edges" => {
                    let mut items = Vec::with_capacity(conn.edges.len());
                    for (i, &idx) in conn.edges.iter().enumerate() {
                        path.push(PathSegment::from(i));
                        items.push(self.shape_edge(field, conn, i, idx, path, errors));
                        path.pop();
                    }
                    Value::Array(items)
                }
                "totalCount" => json!(conn.total),
                "hasNextPage" => json!(conn.has_next),
                "endCursor" => {
                    if page_len == 0 {
                        Value::Null
                    } else {
                        json!(encode_cursor(conn.offset + page_len - 1))
                    }
                }
                "__typename" => {
                    let name = self
                        .schema
                        .type_for(&conn.entity, TypeKind::Connection)
                        .map_or_else(String::new, |t| t.name.clone());
                    Value::String(name)
                }
                other => {
                    errors.push(FieldError::validation(
                        path.clone(),
                        format!("unknown field {other} on connection"),
                    ));
                    Value::Null
                }
            };
            out.insert(field.response_key.clone(), value);
            path.pop();
        }
        Value::Object(out)
    }

    fn shape_edge(
        &self,
        edges_field: &PlanField,
        conn: &ConnectionValue,
        position: usize,
        node_idx: usize,
        path: &mut Vec<PathSegment>,
        errors: &mut Vec<FieldError>,
    ) -> Value {
        let mut out = JsonMap::new();
        for field in &edges_field.children {
            path.push(PathSegment::from(field.response_key.clone()));
            let value = match field.name.as_str() {
                "node" => self.shape(node_idx, path, errors),
                "cursor" => json!(encode_cursor(conn.offset + position)),
                "__typename" => {
                    let name = self
                        .schema
                        .type_for(&conn.entity, TypeKind::Edge)
                        .map_or_else(String::new, |t| t.name.clone());
                    Value::String(name)
                }
                other => {
                    errors.push(FieldError::validation(
                        path.clone(),
                        format!("unknown field {other} on edge"),
                    ));
                    Value::Null
                }
            };
            out.insert(field.response_key.clone(), value);
            path.pop();
        }
        Value::Object(out)
    }
}
