//! Fingerprint-keyed schema storage with single-flight compilation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use modelql_datasource::DynMetadataProvider;

use crate::cache::CacheTier;
use crate::error::{EngineError, SchemaError};
use crate::metadata::{Introspector, ModelMetadata};

use super::type_builder::TypeBuilder;
use super::types::{Fingerprint, GenerationOptions, Schema};

type BuildResult = Result<Arc<Schema>, EngineError>;

/// Compiles and stores schemas keyed by metadata fingerprint.
///
/// Identical concurrent requests for an uncompiled fingerprint trigger
/// exactly one build; every waiter receives the same result, failure
/// included. Failed builds are never stored, so the next request retries.
///
/// Lifecycle: [`new`](Self::new) → [`refresh`](Self::refresh) /
/// [`get_schema`](Self::get_schema) →
/// [`invalidate_schema`](Self::invalidate_schema) on definition changes →
/// [`shutdown`](Self::shutdown).
pub struct SchemaRegistry {
    provider: DynMetadataProvider,
    options: GenerationOptions,
    schemas: CacheTier<Arc<Schema>>,
    inflight: Mutex<HashMap<Fingerprint, watch::Receiver<Option<BuildResult>>>>,
    current: RwLock<Option<Fingerprint>>,
    shut_down: AtomicBool,
}

impl SchemaRegistry {
    /// Creates a registry over a metadata provider.
    #[must_use]
    pub fn new(provider: DynMetadataProvider, options: GenerationOptions) -> Self {
        Self {
            provider,
            options,
            schemas: CacheTier::new("schema"),
            inflight: Mutex::new(HashMap::new()),
            current: RwLock::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Introspects the provider and compiles (or fetches) the schema for the
    /// metadata it currently reports.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] via [`EngineError::Schema`] when the
    /// metadata is invalid or the provider fails.
    pub async fn refresh(&self) -> BuildResult {
        self.guard()?;
        let models = self.load_models().await?;
        let fingerprint = Fingerprint::compute(&models, &self.options);
        let schema = self.get_or_build(fingerprint, Some(models)).await?;
        if let Ok(mut current) = self.current.write() {
            *current = Some(fingerprint);
        }
        info!(fingerprint = %fingerprint, types = schema.type_count(), "Schema refreshed");
        Ok(schema)
    }

    /// Returns the schema for a fingerprint, compiling it if absent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] when the provider's current metadata
    /// no longer matches the requested fingerprint, or the shared build error
    /// when compilation fails.
    pub async fn get_schema(&self, fingerprint: Fingerprint) -> BuildResult {
        self.guard()?;
        self.get_or_build(fingerprint, None).await
    }

    /// Fingerprint of the most recent successful [`refresh`](Self::refresh).
    #[must_use]
    pub fn current_fingerprint(&self) -> Option<Fingerprint> {
        self.current.read().ok().and_then(|c| *c)
    }

    /// Drops the stored schema for a fingerprint. The next request rebuilds.
    pub fn invalidate_schema(&self, fingerprint: Fingerprint) {
        let removed = self.schemas.invalidate(&fingerprint.tag());
        debug!(fingerprint = %fingerprint, removed, "Schema invalidated");
    }

    /// Rejects further requests and drops all stored schemas.
    ///
    /// Builds already in flight complete and deliver to their waiters.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.inflight.lock().await.clear();
        self.schemas.clear();
        if let Ok(mut current) = self.current.write() {
            *current = None;
        }
    }

    fn guard(&self) -> Result<(), EngineError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::Internal("schema registry is shut down".into()));
        }
        Ok(())
    }

    async fn load_models(&self) -> Result<Vec<ModelMetadata>, EngineError> {
        let entities = self
            .provider
            .list_entities()
            .await
            .map_err(|e| SchemaError::Provider(e.to_string()))?;
        let models = Introspector::normalize(&entities, &self.options)?;
        Ok(models)
    }

    async fn get_or_build(
        &self,
        fingerprint: Fingerprint,
        prebuilt: Option<Vec<ModelMetadata>>,
    ) -> BuildResult {
        if let Some(schema) = self.schemas.get(&fingerprint.to_string()) {
            return Ok(schema);
        }

        let mut rx = {
            let mut inflight = self.inflight.lock().await;
            // A build may have finished between the probe and the lock.
            if let Some(schema) = self.schemas.get(&fingerprint.to_string()) {
                return Ok(schema);
            }
            match inflight.get(&fingerprint) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(fingerprint, rx);
                    drop(inflight);
                    return self.lead_build(fingerprint, prebuilt, tx).await;
                }
            }
        };

        // Follower: wait for the leader's result.
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            rx.changed()
                .await
                .map_err(|_| EngineError::Internal("schema build abandoned".into()))?;
        }
    }

    async fn lead_build(
        &self,
        fingerprint: Fingerprint,
        prebuilt: Option<Vec<ModelMetadata>>,
        tx: watch::Sender<Option<BuildResult>>,
    ) -> BuildResult {
        let result = self.build(fingerprint, prebuilt).await;
        if let Ok(schema) = &result {
            self.schemas.put(
                fingerprint.to_string(),
                Arc::clone(schema),
                None,
                vec![fingerprint.tag()],
            );
        }
        // Deliver before clearing the inflight slot so no follower misses it.
        let _ = tx.send(Some(result.clone()));
        self.inflight.lock().await.remove(&fingerprint);
        result
    }

    async fn build(
        &self,
        fingerprint: Fingerprint,
        prebuilt: Option<Vec<ModelMetadata>>,
    ) -> BuildResult {
        let models = match prebuilt {
            Some(models) => models,
            None => self.load_models().await?,
        };
        let computed = Fingerprint::compute(&models, &self.options);
        if computed != fingerprint {
            return Err(EngineError::Internal(format!(
                "requested schema {fingerprint} but current metadata produces {computed}"
            )));
        }
        let schema = TypeBuilder::build(fingerprint, models, &self.options)?;
        debug!(fingerprint = %fingerprint, "Schema compiled");
        Ok(Arc::new(schema))
    }
}
