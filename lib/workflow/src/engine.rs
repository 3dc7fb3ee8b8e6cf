//! Engine facade.
//!
//! `WorkflowEngine` owns the definitions, the node registry, the executor and
//! the in-memory registry of runs, and mirrors every change to the configured
//! [`WorkflowStore`]. It is cheap to clone; clones share the same state.
//!
//! ```ignore
//! let engine = WorkflowEngine::builder(EngineConfig::from_env()?)
//!     .registry(registry)
//!     .build()?;
//! let workflow_id = engine.create_workflow(definition).await?;
//! let snapshot = engine.execute_and_wait(workflow_id, input, Some("alice".into())).await?;
//! ```

use crate::condition::{ConditionEvaluator, ExpressionEvaluator};
use crate::config::{EngineConfig, PersistenceBackend};
use crate::context::{ContextManager, ExecutionContext, ExecutionSnapshot};
use crate::definition::WorkflowDefinition;
use crate::error::WorkflowError;
use crate::executor::{Executor, ExecutorDefaults};
use crate::graph::ExecutionGraph;
use crate::middleware::{
    LoggingMiddleware, MetricsMiddleware, MiddlewareChain, NodeMetrics, RecoveryMiddleware,
    TracingMiddleware,
};
use crate::node::DataMap;
use crate::registry::NodeRegistry;
use crate::store::{
    ExecutionFilter, ExecutionRecord, ExecutionStatistics, MemoryStore, NoopStore,
    WorkflowFilter, WorkflowStore,
};
use chrono::{DateTime, TimeDelta, Utc};
use erp_flow_core::{ExecutionId, WorkflowId};
use rootcause::Report;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Builder for [`WorkflowEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<Arc<NodeRegistry>>,
    store: Option<Arc<dyn WorkflowStore>>,
    middleware: Option<MiddlewareChain>,
    evaluator: Option<Arc<dyn ConditionEvaluator>>,
}

impl EngineBuilder {
    /// Node registry to resolve node types from. Defaults to the built-ins.
    #[must_use]
    pub fn registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Store to mirror state to. Defaults to the configured backend; the
    /// postgres backend has no default and must be supplied here.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the default middleware (recovery, logging, and tracing when
    /// enabled). Metrics are appended innermost when enabled.
    #[must_use]
    pub fn middleware(mut self, middleware: MiddlewareChain) -> Self {
        self.middleware = Some(middleware);
        self
    }

    /// Replaces the built-in condition grammar.
    #[must_use]
    pub fn evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Validates the configuration and builds the engine.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the configuration is invalid or the
    /// configured backend needs a store that was not supplied.
    pub fn build(self) -> Result<WorkflowEngine, Report<WorkflowError>> {
        self.config.validate()?;

        let store: Arc<dyn WorkflowStore> = match (self.store, self.config.persistence.effective_backend()) {
            (Some(store), _) => store,
            (None, PersistenceBackend::None) => Arc::new(NoopStore),
            (None, PersistenceBackend::Memory) => Arc::new(MemoryStore::new()),
            (None, PersistenceBackend::Postgres) => {
                return Err(WorkflowError::Configuration {
                    reason: "the postgres backend needs a store supplied to the builder".to_string(),
                }
                .into());
            }
        };

        let mut middleware = self.middleware.unwrap_or_else(|| {
            let chain = MiddlewareChain::new()
                .with(RecoveryMiddleware)
                .with(LoggingMiddleware);
            if self.config.enable_tracing {
                chain.with(TracingMiddleware)
            } else {
                chain
            }
        });
        let metrics = self.config.enable_metrics.then(MetricsMiddleware::new);
        if let Some(metrics) = &metrics {
            middleware.push(Arc::new(metrics.clone()));
        }

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(NodeRegistry::with_builtins()));
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(ExpressionEvaluator::new()));
        let executor = Executor::new(
            Arc::clone(&registry),
            &middleware,
            evaluator,
            Arc::clone(&store),
            ExecutorDefaults::from(&self.config),
        );

        info!(
            middleware = ?middleware.names(),
            max_concurrent_executions = self.config.max_concurrent_executions,
            backend = ?self.config.persistence.effective_backend(),
            "workflow engine ready"
        );

        Ok(WorkflowEngine {
            inner: Arc::new(EngineInner {
                permits: Arc::new(Semaphore::new(self.config.max_concurrent_executions)),
                config: self.config,
                registry,
                store,
                executor,
                metrics,
                contexts: ContextManager::new(),
                workflows: RwLock::default(),
            }),
        })
    }
}

struct EngineInner {
    config: EngineConfig,
    registry: Arc<NodeRegistry>,
    store: Arc<dyn WorkflowStore>,
    executor: Executor,
    metrics: Option<MetricsMiddleware>,
    contexts: ContextManager,
    workflows: RwLock<HashMap<WorkflowId, WorkflowDefinition>>,
    permits: Arc<Semaphore>,
}

/// Counts removed by a cleanup sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Runs evicted from memory.
    pub evicted: usize,
    /// Runs deleted from the store.
    pub deleted: u64,
}

/// Workflow engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.inner.config)
            .field("tracked_executions", &self.inner.contexts.count())
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            registry: None,
            store: None,
            middleware: None,
            evaluator: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The registry node types are resolved from. Types may be registered
    /// after the engine was built.
    #[must_use]
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.inner.registry
    }

    /// Validates and stores a new definition.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists`, `InvalidDefinition` or a `Graph` error for a
    /// malformed definition, or `Persistence` if the store rejects it. Nothing
    /// is cached when the store write fails.
    #[instrument(skip_all, fields(workflow_id = %definition.id, name = %definition.name))]
    pub async fn create_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowId, Report<WorkflowError>> {
        let workflow_id = definition.id;
        if self.cached_workflow(workflow_id).is_some()
            || self
                .inner
                .store
                .get_workflow(workflow_id)
                .await
                .map_err(WorkflowError::from)?
                .is_some()
        {
            return Err(WorkflowError::AlreadyExists { workflow_id }.into());
        }

        validate_definition(&definition)?;
        self.inner
            .store
            .save_workflow(&definition)
            .await
            .map_err(WorkflowError::from)?;
        self.workflows_mut().insert(workflow_id, definition);

        info!("workflow created");
        Ok(workflow_id)
    }

    /// Returns a definition, from memory or the store.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the workflow does not exist, or `Persistence` if
    /// the store lookup failed.
    pub async fn get_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowDefinition, Report<WorkflowError>> {
        if let Some(definition) = self.cached_workflow(workflow_id) {
            return Ok(definition);
        }

        let definition = self
            .inner
            .store
            .get_workflow(workflow_id)
            .await
            .map_err(WorkflowError::from)?
            .ok_or(WorkflowError::NotFound { workflow_id })?;
        self.workflows_mut().insert(workflow_id, definition.clone());
        Ok(definition)
    }

    /// Replaces a definition wholesale. The version is incremented and the
    /// creation metadata of the stored definition is kept.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, a validation error, or `Persistence`.
    #[instrument(skip_all, fields(workflow_id = %definition.id))]
    pub async fn update_workflow(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, Report<WorkflowError>> {
        let current = self.get_workflow(definition.id).await?;
        validate_definition(&definition)?;

        definition.version = current.version;
        definition.created_at = current.created_at;
        definition.created_by = current.created_by;
        definition.touch();

        self.inner
            .store
            .save_workflow(&definition)
            .await
            .map_err(WorkflowError::from)?;
        self.workflows_mut()
            .insert(definition.id, definition.clone());

        info!(version = definition.version, "workflow updated");
        Ok(definition)
    }

    /// Deletes a definition. Runs already started are not affected.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the workflow does not exist, or `Persistence`.
    #[instrument(skip(self))]
    pub async fn delete_workflow(&self, workflow_id: WorkflowId) -> Result<(), Report<WorkflowError>> {
        let cached = self.cached_workflow(workflow_id).is_some();
        let stored = self
            .inner
            .store
            .delete_workflow(workflow_id)
            .await
            .map_err(WorkflowError::from)?;
        if !cached && !stored {
            return Err(WorkflowError::NotFound { workflow_id }.into());
        }

        self.workflows_mut().remove(&workflow_id);
        info!("workflow deleted");
        Ok(())
    }

    /// Definitions matching the filter, most recently updated first. Cached
    /// definitions take precedence over stored ones.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the store listing failed.
    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, Report<WorkflowError>> {
        let unpaged = WorkflowFilter {
            limit: None,
            offset: 0,
            ..filter.clone()
        };
        let mut merged: HashMap<WorkflowId, WorkflowDefinition> = self
            .inner
            .store
            .list_workflows(&unpaged)
            .await
            .map_err(WorkflowError::from)?
            .into_iter()
            .map(|w| (w.id, w))
            .collect();
        for definition in self.workflows().values().filter(|w| filter.matches(w)) {
            merged.insert(definition.id, definition.clone());
        }

        let mut workflows: Vec<_> = merged.into_values().collect();
        workflows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(workflows
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Starts a run in the background and returns its ID.
    ///
    /// The run waits for a free slot when `max_concurrent_executions` runs
    /// are already executing. Cancelling it while it waits ends it at once.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `InvalidState` for an archived workflow, or
    /// `Persistence` if the initial execution record cannot be stored.
    #[instrument(skip(self, input))]
    pub async fn execute(
        &self,
        workflow_id: WorkflowId,
        input: DataMap,
        triggered_by: Option<String>,
    ) -> Result<ExecutionId, Report<WorkflowError>> {
        let (definition, context) = self.prepare(workflow_id, input, triggered_by).await?;
        let execution_id = context.id();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let persisted = inner.run(&definition, &context).await;
            if let Err(e) = persisted {
                context.record_persistence_error();
                warn!(%execution_id, error = %e, "failed to persist execution result");
            }
        });

        Ok(execution_id)
    }

    /// Runs a workflow on the current task and returns the final snapshot.
    ///
    /// A failed, cancelled or timed out run is still `Ok`; inspect the
    /// snapshot's status and error.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `InvalidState`, or `Persistence` if the execution
    /// record cannot be stored.
    #[instrument(skip(self, input))]
    pub async fn execute_and_wait(
        &self,
        workflow_id: WorkflowId,
        input: DataMap,
        triggered_by: Option<String>,
    ) -> Result<ExecutionSnapshot, Report<WorkflowError>> {
        let (definition, context) = self.prepare(workflow_id, input, triggered_by).await?;
        self.inner.run(&definition, &context).await?;
        Ok(context.snapshot())
    }

    /// Waits for a run to finish and returns its snapshot.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound` if the run is neither tracked nor stored.
    pub async fn wait_for(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionSnapshot, Report<WorkflowError>> {
        match self.inner.contexts.load(&execution_id) {
            Some(context) => {
                context.wait().await;
                Ok(context.snapshot())
            }
            None => self.get_execution(execution_id).await,
        }
    }

    /// Returns the state of a run. Tracked runs are read from memory, others
    /// from the store.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound`, or `Persistence` if the store lookup
    /// failed.
    pub async fn get_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionSnapshot, Report<WorkflowError>> {
        if let Some(context) = self.inner.contexts.load(&execution_id) {
            return Ok(context.snapshot());
        }

        let store = &self.inner.store;
        let record = store
            .get_execution(execution_id)
            .await
            .map_err(WorkflowError::from)?
            .ok_or(WorkflowError::ExecutionNotFound { execution_id })?;
        let node_states = store
            .list_node_states(execution_id)
            .await
            .map_err(WorkflowError::from)?;
        Ok(record.into_snapshot(node_states))
    }

    /// Runs matching the filter, newest first. Tracked runs take precedence
    /// over stored ones.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the store listing failed.
    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, Report<WorkflowError>> {
        let unpaged = ExecutionFilter {
            limit: None,
            offset: 0,
            ..filter.clone()
        };
        let mut merged: HashMap<ExecutionId, ExecutionRecord> = self
            .inner
            .store
            .list_executions(&unpaged)
            .await
            .map_err(WorkflowError::from)?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();
        for context in self.inner.contexts.list() {
            let record = ExecutionRecord::from(&context.snapshot());
            if filter.matches(&record) {
                merged.insert(record.id, record);
            }
        }

        let mut records: Vec<_> = merged.into_values().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Requests cancellation of a run. In-flight nodes and backoff waits are
    /// interrupted; the run ends with status `cancelled`.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionAlreadyDone` if the run already finished, or
    /// `ExecutionNotFound`.
    #[instrument(skip(self))]
    pub async fn cancel_execution(&self, execution_id: ExecutionId) -> Result<(), Report<WorkflowError>> {
        let Some(context) = self.inner.contexts.load(&execution_id) else {
            // Untracked runs belong to another engine unless they finished.
            let snapshot = self.get_execution(execution_id).await?;
            if snapshot.status.is_terminal() {
                return Err(WorkflowError::ExecutionAlreadyDone {
                    execution_id,
                    status: snapshot.status,
                }
                .into());
            }
            return Err(WorkflowError::ExecutionNotFound { execution_id }.into());
        };

        let status = context.status();
        if status.is_terminal() {
            return Err(WorkflowError::ExecutionAlreadyDone {
                execution_id,
                status,
            }
            .into());
        }

        context.cancel();
        info!("execution cancellation requested");
        Ok(())
    }

    /// Removes finished runs older than the retention window from memory and
    /// from the store.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the store cleanup failed. Runs evicted from
    /// memory stay evicted.
    pub async fn cleanup_executions(&self) -> Result<CleanupSummary, Report<WorkflowError>> {
        let retention = TimeDelta::from_std(self.inner.config.retention.retention())
            .unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let evicted = self.inner.contexts.cleanup_before(cutoff);
        let deleted = self
            .inner
            .store
            .cleanup_executions(cutoff)
            .await
            .map_err(WorkflowError::from)?;

        if evicted > 0 || deleted > 0 {
            debug!(evicted, deleted, "execution cleanup");
        }
        Ok(CleanupSummary { evicted, deleted })
    }

    /// Spawns a task running [`Self::cleanup_executions`] every
    /// `retention.cleanup_interval_secs` until `shutdown` is cancelled.
    pub fn spawn_cleanup_task(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let period = self.inner.config.retention.cleanup_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = engine.cleanup_executions().await {
                            warn!(error = %e, "periodic execution cleanup failed");
                        }
                    }
                }
            }
        })
    }

    /// Per node type execution metrics. Empty when metrics are disabled.
    #[must_use]
    pub fn metrics(&self) -> BTreeMap<String, NodeMetrics> {
        self.inner
            .metrics
            .as_ref()
            .map(MetricsMiddleware::snapshot)
            .unwrap_or_default()
    }

    /// Aggregate statistics over all runs, or those of one workflow.
    ///
    /// Read from the store when persistence is enabled, otherwise computed
    /// over the runs still tracked in memory.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the store query failed.
    pub async fn statistics(
        &self,
        workflow_id: Option<WorkflowId>,
    ) -> Result<ExecutionStatistics, Report<WorkflowError>> {
        if self.inner.config.persistence.effective_backend() != PersistenceBackend::None {
            return Ok(self
                .inner
                .store
                .statistics(workflow_id)
                .await
                .map_err(WorkflowError::from)?);
        }

        let records: Vec<_> = self
            .inner
            .contexts
            .list()
            .iter()
            .filter(|c| workflow_id.is_none_or(|id| c.workflow_id() == id))
            .map(|c| ExecutionRecord::from(&c.snapshot()))
            .collect();
        Ok(ExecutionStatistics::from_records(&records))
    }

    /// Stored runs of a workflow created in `[from, to)`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the store query failed.
    pub async fn execution_history(
        &self,
        workflow_id: WorkflowId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, Report<WorkflowError>> {
        Ok(self
            .inner
            .store
            .execution_history(workflow_id, from, to)
            .await
            .map_err(WorkflowError::from)?)
    }

    async fn prepare(
        &self,
        workflow_id: WorkflowId,
        input: DataMap,
        triggered_by: Option<String>,
    ) -> Result<(WorkflowDefinition, Arc<ExecutionContext>), Report<WorkflowError>> {
        let definition = self.get_workflow(workflow_id).await?;
        if !definition.status.is_executable() {
            return Err(WorkflowError::InvalidState {
                workflow_id,
                status: definition.status.to_string(),
            }
            .into());
        }

        let context = Arc::new(ExecutionContext::new(
            workflow_id,
            input,
            definition.variables.clone(),
            triggered_by,
        ));
        context.set_metadata("workflow_name", JsonValue::String(definition.name.clone()));
        context.set_metadata("workflow_version", JsonValue::from(definition.version));
        self.inner
            .store
            .save_execution(&ExecutionRecord::from(&context.snapshot()))
            .await
            .map_err(WorkflowError::from)?;
        self.inner.contexts.store(Arc::clone(&context));

        debug!(execution_id = %context.id(), "execution registered");
        Ok((definition, context))
    }

    fn cached_workflow(&self, workflow_id: WorkflowId) -> Option<WorkflowDefinition> {
        self.workflows().get(&workflow_id).cloned()
    }

    fn workflows(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<WorkflowId, WorkflowDefinition>> {
        self.inner
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn workflows_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<WorkflowId, WorkflowDefinition>> {
        self.inner
            .workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl EngineInner {
    /// Waits for a slot, runs the workflow and stores the final record.
    async fn run(
        &self,
        definition: &WorkflowDefinition,
        context: &Arc<ExecutionContext>,
    ) -> Result<(), WorkflowError> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            () = context.cancellation_token().cancelled() => None,
        };

        match permit {
            Some(_permit) => {
                // The outcome is recorded on the context.
                let _ = self.executor.run(definition, Arc::clone(context)).await;
            }
            None => {
                context.mark_cancelled("cancelled before start");
            }
        }

        self.store
            .save_execution(&ExecutionRecord::from(&context.snapshot()))
            .await?;
        Ok(())
    }
}

fn validate_definition(definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
    definition.validate_shape()?;
    let graph = ExecutionGraph::from_definition(definition)?;
    graph.validate()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ExecutionStatus, NodeStatus};
    use crate::definition::WorkflowStatus;
    use crate::edge::Edge;
    use crate::error::{GraphError, NodeError};
    use crate::node::{Node, NodeDefinition, NodeId};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct SleepNode(Duration);

    #[async_trait]
    impl Node for SleepNode {
        fn node_type(&self) -> &str {
            "sleep"
        }

        async fn execute(&self, _input: DataMap) -> Result<DataMap, NodeError> {
            tokio::time::sleep(self.0).await;
            Ok(DataMap::new())
        }
    }

    fn engine_with(config: EngineConfig) -> WorkflowEngine {
        let engine = WorkflowEngine::builder(config).build().expect("build");
        engine
            .registry()
            .register("sleep", |def: &NodeDefinition| {
                let ms = def
                    .config
                    .get("ms")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(0);
                Ok(Arc::new(SleepNode(Duration::from_millis(ms))) as Arc<dyn Node>)
            })
            .expect("register");
        engine
    }

    fn engine() -> WorkflowEngine {
        let mut config = EngineConfig::default();
        config.persistence.enabled = true;
        config.persistence.backend = PersistenceBackend::Memory;
        engine_with(config)
    }

    fn approval() -> WorkflowDefinition {
        WorkflowDefinition::new("Leave approval")
            .with_status(WorkflowStatus::Active)
            .with_node(NodeDefinition::new("submit", "noop").with_config("step", json!("submit")))
            .with_node(
                NodeDefinition::new("decide", "set_variables").with_config("approved", json!(true)),
            )
            .with_edge(Edge::new("submit", "decide"))
    }

    #[tokio::test]
    async fn create_get_update_delete_workflow() {
        let engine = engine();
        let definition = approval();
        let workflow_id = engine.create_workflow(definition.clone()).await.expect("create");

        let err = engine.create_workflow(definition.clone()).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            WorkflowError::AlreadyExists { .. }
        ));

        let fetched = engine.get_workflow(workflow_id).await.expect("get");
        assert_eq!(fetched.version, 1);

        let updated = engine
            .update_workflow(fetched.with_description("two step"))
            .await
            .expect("update");
        assert_eq!(updated.version, 2);
        assert_eq!(updated.created_at, definition.created_at);

        let listed = engine
            .list_workflows(&WorkflowFilter::default())
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].description.as_deref(), Some("two step"));

        engine.delete_workflow(workflow_id).await.expect("delete");
        let err = engine.get_workflow(workflow_id).await.unwrap_err();
        assert!(matches!(err.current_context(), WorkflowError::NotFound { .. }));
        let err = engine.delete_workflow(workflow_id).await.unwrap_err();
        assert!(matches!(err.current_context(), WorkflowError::NotFound { .. }));
    }

    #[tokio::test]
    async fn create_rejects_structural_errors() {
        let engine = engine();

        let err = engine
            .create_workflow(WorkflowDefinition::new("empty"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            WorkflowError::InvalidDefinition { .. }
        ));

        let cyclic = WorkflowDefinition::new("cyclic")
            .with_node(NodeDefinition::new("start", "noop"))
            .with_node(NodeDefinition::new("a", "noop"))
            .with_node(NodeDefinition::new("b", "noop"))
            .with_edge(Edge::new("start", "a"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "a"));
        let err = engine.create_workflow(cyclic).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            WorkflowError::Graph(GraphError::CyclicDependency { .. })
        ));
    }

    #[tokio::test]
    async fn execute_and_wait_returns_final_snapshot() {
        let engine = engine();
        let workflow_id = engine.create_workflow(approval()).await.expect("create");

        let mut input = DataMap::new();
        input.insert("employee".to_string(), json!("e-42"));
        let snapshot = engine
            .execute_and_wait(workflow_id, input, Some("alice".to_string()))
            .await
            .expect("execute");

        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(snapshot.variables.get("approved"), Some(&json!(true)));
        assert_eq!(snapshot.output.get("$approved"), Some(&json!(true)));
        assert_eq!(snapshot.triggered_by.as_deref(), Some("alice"));
        assert_eq!(
            snapshot.node_states[&NodeId::new("submit")].status,
            NodeStatus::Completed
        );

        // The store holds the same final state.
        engine.inner.contexts.delete(&snapshot.id);
        let stored = engine.get_execution(snapshot.id).await.expect("stored");
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(stored.node_states.len(), 2);
        assert_eq!(stored.metadata.get("workflow_version"), Some(&json!(1)));
        assert_eq!(stored.metadata, snapshot.metadata);

        let metrics = engine.metrics();
        assert_eq!(metrics["noop"].executions, 1);
        assert_eq!(metrics["set_variables"].successes, 1);

        let stats = engine.statistics(Some(workflow_id)).await.expect("stats");
        assert_eq!(stats.total, 1);
        assert_eq!(stats.completed, 1);
    }

    struct PanicNode;

    #[async_trait]
    impl Node for PanicNode {
        fn node_type(&self) -> &str {
            "panic"
        }

        async fn execute(&self, _input: DataMap) -> Result<DataMap, NodeError> {
            panic!("ledger unavailable");
        }
    }

    #[tokio::test]
    async fn background_run_with_panicking_node_still_finishes() {
        let engine = WorkflowEngine::builder(EngineConfig::default())
            .middleware(MiddlewareChain::new())
            .build()
            .expect("build");
        engine
            .registry()
            .register("panic", |_: &NodeDefinition| Ok(Arc::new(PanicNode) as Arc<dyn Node>))
            .expect("register");
        let definition = WorkflowDefinition::new("post ledger")
            .with_node(NodeDefinition::new("post", "panic"));
        let workflow_id = engine.create_workflow(definition).await.expect("create");

        let execution_id = engine
            .execute(workflow_id, DataMap::new(), None)
            .await
            .expect("execute");
        let snapshot = engine.wait_for(execution_id).await.expect("wait");

        assert_eq!(snapshot.status, ExecutionStatus::Failed);
        assert_eq!(
            snapshot.node_states[&NodeId::new("post")].status,
            NodeStatus::Failed
        );
        assert!(snapshot.error.unwrap_or_default().contains("ledger unavailable"));
    }

    #[tokio::test]
    async fn archived_workflow_cannot_run() {
        let engine = engine();
        let workflow_id = engine
            .create_workflow(approval().with_status(WorkflowStatus::Archived))
            .await
            .expect("create");

        let err = engine
            .execute(workflow_id, DataMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            WorkflowError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_workflow_and_execution_are_not_found() {
        let engine = engine();
        let err = engine
            .execute(WorkflowId::new(), DataMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), WorkflowError::NotFound { .. }));

        let err = engine.get_execution(ExecutionId::new()).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            WorkflowError::ExecutionNotFound { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_running_execution() {
        let engine = engine();
        let definition = WorkflowDefinition::new("slow")
            .with_node(NodeDefinition::new("wait", "sleep").with_config("ms", json!(30_000)));
        let workflow_id = engine.create_workflow(definition).await.expect("create");

        let execution_id = engine
            .execute(workflow_id, DataMap::new(), None)
            .await
            .expect("execute");
        tokio::time::sleep(Duration::from_millis(10)).await;

        engine.cancel_execution(execution_id).await.expect("cancel");
        let snapshot = engine.wait_for(execution_id).await.expect("wait");
        assert_eq!(snapshot.status, ExecutionStatus::Cancelled);

        let err = engine.cancel_execution(execution_id).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            WorkflowError::ExecutionAlreadyDone {
                status: ExecutionStatus::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_queues_runs() {
        let mut config = EngineConfig {
            max_concurrent_executions: 1,
            ..EngineConfig::default()
        };
        config.persistence.enabled = true;
        config.persistence.backend = PersistenceBackend::Memory;
        let engine = engine_with(config);
        let definition = WorkflowDefinition::new("slow")
            .with_node(NodeDefinition::new("wait", "sleep").with_config("ms", json!(1_000)));
        let workflow_id = engine.create_workflow(definition).await.expect("create");

        let first = engine.execute(workflow_id, DataMap::new(), None).await.expect("first");
        let second = engine.execute(workflow_id, DataMap::new(), None).await.expect("second");
        tokio::time::sleep(Duration::from_millis(500)).await;

        let running = engine.get_execution(first).await.expect("first");
        let queued = engine.get_execution(second).await.expect("second");
        assert_eq!(running.status, ExecutionStatus::Running);
        assert_eq!(queued.status, ExecutionStatus::Pending);

        // Cancelling a queued run ends it without waiting for a slot.
        engine.cancel_execution(second).await.expect("cancel");
        let queued = engine.wait_for(second).await.expect("wait");
        assert_eq!(queued.status, ExecutionStatus::Cancelled);
        assert!(queued.node_states.is_empty());

        let running = engine.wait_for(first).await.expect("wait");
        assert_eq!(running.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn cleanup_removes_finished_runs_past_retention() {
        let mut config = EngineConfig::default();
        config.persistence.enabled = true;
        config.persistence.backend = PersistenceBackend::Memory;
        config.retention.execution_retention_secs = 0;
        let engine = engine_with(config);
        let workflow_id = engine.create_workflow(approval()).await.expect("create");

        let snapshot = engine
            .execute_and_wait(workflow_id, DataMap::new(), None)
            .await
            .expect("execute");
        tokio::time::sleep(Duration::from_millis(5)).await;

        let summary = engine.cleanup_executions().await.expect("cleanup");
        assert_eq!(summary, CleanupSummary { evicted: 1, deleted: 1 });
        let err = engine.get_execution(snapshot.id).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            WorkflowError::ExecutionNotFound { .. }
        ));
    }

    #[test]
    fn postgres_backend_requires_a_store() {
        let mut config = EngineConfig::default();
        config.persistence.enabled = true;
        config.persistence.backend = PersistenceBackend::Postgres;
        config.persistence.database_url = Some("postgres://localhost/erp".to_string());

        let err = WorkflowEngine::builder(config).build().unwrap_err();
        assert!(matches!(
            err.current_context(),
            WorkflowError::Configuration { .. }
        ));
    }

    #[test]
    fn metrics_are_empty_when_disabled() {
        let config = EngineConfig {
            enable_metrics: false,
            ..EngineConfig::default()
        };
        let engine = engine_with(config);
        assert!(engine.metrics().is_empty());
    }
}
