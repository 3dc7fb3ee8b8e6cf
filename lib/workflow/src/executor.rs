//! Workflow run driver.
//!
//! A run builds and validates the graph, instantiates every enabled node,
//! then executes the topological layers in order. Nodes of one layer run
//! concurrently on a `JoinSet`; the next layer starts only after every task of
//! the current one finished.
//!
//! Each node receives a single input map:
//! - `input`: the run input
//! - `variables`: the run variables when the node starts
//! - `config`: the node's configuration
//! - `nodes`: outputs of all completed nodes, by node ID
//! - `previous`: the output of the only completed predecessor, if exactly one
//!
//! Output keys starting with `$` are promoted into run variables once the
//! node completes: `{"$approved": true}` sets the variable `approved`.

use crate::builtin::VARIABLE_MARKER;
use crate::condition::{ConditionEvaluator, ConditionScope};
use crate::config::EngineConfig;
use crate::context::{ExecutionContext, NodeState};
use crate::definition::{ErrorStrategy, WorkflowDefinition};
use crate::error::{ExecutionError, NodeError};
use crate::graph::ExecutionGraph;
use crate::middleware::{MiddlewareChain, NodeFn, NodeInvocation, execute_node, panic_message};
use crate::node::{DataMap, Node, NodeDefinition, NodeId, RetryPolicy};
use crate::registry::NodeRegistry;
use crate::store::{ExecutionRecord, WorkflowStore};
use futures::FutureExt;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Fallbacks for values a workflow or node does not set itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorDefaults {
    pub retry_policy: RetryPolicy,
    pub node_timeout: Duration,
    pub execution_timeout: Duration,
}

impl Default for ExecutorDefaults {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ExecutorDefaults {
    fn from(config: &EngineConfig) -> Self {
        Self {
            retry_policy: config.default_retry.policy(),
            node_timeout: config.node_timeout(),
            execution_timeout: config.execution_timeout(),
        }
    }
}

/// Runs workflow definitions.
pub struct Executor {
    registry: Arc<NodeRegistry>,
    node_fn: NodeFn,
    evaluator: Arc<dyn ConditionEvaluator>,
    store: Arc<dyn WorkflowStore>,
    defaults: ExecutorDefaults,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("node_types", &self.registry.types())
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl Executor {
    #[must_use]
    pub fn new(
        registry: Arc<NodeRegistry>,
        middleware: &MiddlewareChain,
        evaluator: Arc<dyn ConditionEvaluator>,
        store: Arc<dyn WorkflowStore>,
        defaults: ExecutorDefaults,
    ) -> Self {
        Self {
            registry,
            node_fn: middleware.apply(execute_node()),
            evaluator,
            store,
            defaults,
        }
    }

    /// Executes a workflow to completion and records the outcome on the
    /// context.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run: a structural error before any
    /// node ran, `ExecutionCancelled`, `ExecutionTimeout`, or a node failure
    /// under the `stop` and `retry` strategies.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        context: Arc<ExecutionContext>,
    ) -> Result<DataMap, ExecutionError> {
        let execution_id = context.id();
        let timeout = definition
            .settings
            .timeout_secs
            .map_or(self.defaults.execution_timeout, Duration::from_secs);

        context.mark_running();
        info!(%execution_id, workflow_id = %definition.id, "execution started");
        if let Err(e) = self
            .store
            .save_execution(&ExecutionRecord::from(&context.snapshot()))
            .await
        {
            context.record_persistence_error();
            warn!(%execution_id, error = %e, "failed to persist running execution");
        }

        let run = self.run_layers(definition, &context);
        tokio::pin!(run);
        let mut timed_out = false;
        let result = tokio::select! {
            result = &mut run => result,
            () = tokio::time::sleep(timeout) => {
                timed_out = true;
                context.cancel();
                run.await
            }
        };

        match result {
            Ok(output) => {
                context.mark_completed(output.clone());
                info!(%execution_id, "execution completed");
                Ok(output)
            }
            Err(_) if timed_out => {
                let err = ExecutionError::ExecutionTimeout;
                context.mark_timeout(err.to_string());
                warn!(%execution_id, timeout_secs = timeout.as_secs(), "execution timed out");
                Err(err)
            }
            Err(ExecutionError::ExecutionCancelled) => {
                context.mark_cancelled(ExecutionError::ExecutionCancelled.to_string());
                info!(%execution_id, "execution cancelled");
                Err(ExecutionError::ExecutionCancelled)
            }
            Err(e) => {
                context.mark_failed(e.to_string());
                error!(%execution_id, error = %e, "execution failed");
                Err(e)
            }
        }
    }

    async fn run_layers(
        &self,
        definition: &WorkflowDefinition,
        context: &Arc<ExecutionContext>,
    ) -> Result<DataMap, ExecutionError> {
        let graph = ExecutionGraph::from_definition(definition)?;
        graph.validate()?;

        for edge in definition.edges.iter().filter(|e| e.is_conditional()) {
            let expression = edge.condition.as_deref().unwrap_or_default();
            self.evaluator
                .check(expression)
                .map_err(|error| ExecutionError::InvalidCondition {
                    edge_id: edge.id.clone(),
                    error,
                })?;
        }

        let mut instances: HashMap<NodeId, Arc<dyn Node>> = HashMap::new();
        for node in graph.nodes().filter(|n| !n.disabled) {
            instances.insert(node.id.clone(), self.registry.create(node)?);
        }

        let layers = graph.topological_sort()?.to_vec();
        debug!(
            execution_id = %context.id(),
            layers = layers.len(),
            nodes = graph.node_count(),
            "graph validated"
        );

        for layer in &layers {
            if context.is_cancelled() {
                return Err(ExecutionError::ExecutionCancelled);
            }

            let mut runs: Vec<NodeRun> = Vec::new();
            for node_id in layer {
                let Some(node) = graph.node(node_id) else {
                    continue;
                };
                if let Some(reason) = self.skip_reason(&graph, node, context)? {
                    self.skip_node(context, node_id, &reason).await;
                    continue;
                }
                let Some(instance) = instances.get(node_id) else {
                    continue;
                };
                runs.push(self.prepare(&graph, node, Arc::clone(instance), definition, context));
            }

            let scheduled: Vec<NodeId> = runs.iter().map(|r| r.definition.id.clone()).collect();
            let mut outcomes = match runs.len() {
                0 => Vec::new(),
                1 => match runs.pop() {
                    Some(run) => match AssertUnwindSafe(run.execute()).catch_unwind().await {
                        Ok(outcome) => vec![outcome],
                        Err(payload) => {
                            error!(
                                execution_id = %context.id(),
                                panic = %panic_message(payload.as_ref()),
                                "node run panicked"
                            );
                            Vec::new()
                        }
                    },
                    None => Vec::new(),
                },
                _ => {
                    let mut tasks = JoinSet::new();
                    for run in runs {
                        tasks.spawn(run.execute());
                    }
                    let mut outcomes = Vec::new();
                    while let Some(joined) = tasks.join_next().await {
                        match joined {
                            Ok(outcome) => outcomes.push(outcome),
                            Err(e) => {
                                error!(execution_id = %context.id(), error = %e, "node task aborted");
                            }
                        }
                    }
                    outcomes
                }
            };

            // A run that died without an outcome still ends its node.
            for node_id in &scheduled {
                if !outcomes.iter().any(|o| &o.node_id == node_id) {
                    outcomes.push(self.abandon_node(context, node_id).await);
                }
            }

            let mut first_error = None;
            for outcome in outcomes {
                if let Err(e) = self.apply_outcome(definition.settings.on_error, context, outcome) {
                    first_error.get_or_insert(e);
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(final_output(&graph, context))
    }

    /// Returns why the node must be skipped, or `None` if it runs.
    fn skip_reason(
        &self,
        graph: &ExecutionGraph,
        node: &NodeDefinition,
        context: &ExecutionContext,
    ) -> Result<Option<String>, ExecutionError> {
        if node.disabled {
            return Ok(Some("node is disabled".to_string()));
        }

        let incoming = graph.incoming_edges(&node.id);
        if incoming.is_empty() {
            return Ok(None);
        }

        let outputs = context.completed_outputs();
        let variables = context.variables();
        for edge in incoming {
            let Some(source_output) = outputs.get(&edge.source) else {
                continue;
            };
            if !edge.is_conditional() {
                return Ok(None);
            }

            let scope = ConditionScope {
                output: source_output,
                variables: &variables,
                input: context.input(),
                nodes: &outputs,
            };
            let expression = edge.condition.as_deref().unwrap_or_default();
            let fired = self
                .evaluator
                .evaluate(expression, &scope)
                .map_err(|error| ExecutionError::InvalidCondition {
                    edge_id: edge.id.clone(),
                    error,
                })?;
            if fired {
                return Ok(None);
            }
        }

        Ok(Some("no incoming edge was satisfied".to_string()))
    }

    async fn skip_node(&self, context: &ExecutionContext, node_id: &NodeId, reason: &str) {
        debug!(execution_id = %context.id(), %node_id, reason, "node skipped");
        let mut state = NodeState::new(node_id.clone());
        state.skip(reason);
        context.set_node_state(state.clone());
        write_back(self.store.as_ref(), context, &state).await;
    }

    async fn abandon_node(&self, context: &ExecutionContext, node_id: &NodeId) -> NodeOutcome {
        let mut state = context
            .node_state(node_id)
            .unwrap_or_else(|| NodeState::new(node_id.clone()));
        let error = NodeError::Panicked {
            message: "node run ended without a result".to_string(),
        };
        state.fail(error.to_string());
        context.set_node_state(state.clone());
        write_back(self.store.as_ref(), context, &state).await;

        NodeOutcome {
            node_id: node_id.clone(),
            attempts: state.attempts,
            result: Err(error),
        }
    }

    fn prepare(
        &self,
        graph: &ExecutionGraph,
        node: &NodeDefinition,
        instance: Arc<dyn Node>,
        definition: &WorkflowDefinition,
        context: &Arc<ExecutionContext>,
    ) -> NodeRun {
        NodeRun {
            definition: node.clone(),
            instance,
            node_fn: Arc::clone(&self.node_fn),
            input: resolve_input(graph, node, context),
            policy: self.retry_policy(node, definition),
            timeout: node.timeout().unwrap_or(self.defaults.node_timeout),
            context: Arc::clone(context),
            store: Arc::clone(&self.store),
        }
    }

    /// Node override, then the workflow settings, then the engine default.
    fn retry_policy(&self, node: &NodeDefinition, definition: &WorkflowDefinition) -> RetryPolicy {
        if let Some(policy) = &node.retry_policy {
            return policy.clone();
        }
        let settings = &definition.settings;
        let mut policy = self.defaults.retry_policy.clone();
        if let Some(max_attempts) = settings.max_attempts {
            policy.max_attempts = max_attempts;
        }
        if let Some(delay_ms) = settings.retry_delay_ms {
            policy.delay_ms = delay_ms;
        }
        policy
    }

    fn apply_outcome(
        &self,
        strategy: ErrorStrategy,
        context: &ExecutionContext,
        outcome: NodeOutcome,
    ) -> Result<(), ExecutionError> {
        match outcome.result {
            Ok(output) => {
                for (key, value) in &output {
                    match key.strip_prefix(VARIABLE_MARKER) {
                        Some(name) if !name.is_empty() => context.set_variable(name, value.clone()),
                        _ => {}
                    }
                }
                Ok(())
            }
            Err(NodeError::Cancelled) => Err(ExecutionError::ExecutionCancelled),
            Err(e) => match strategy {
                ErrorStrategy::Continue => {
                    warn!(
                        execution_id = %context.id(),
                        node_id = %outcome.node_id,
                        error = %e,
                        "node failed, continuing"
                    );
                    Ok(())
                }
                ErrorStrategy::Stop => Err(ExecutionError::NodeExecutionFailed {
                    node_id: outcome.node_id,
                    message: e.to_string(),
                }),
                ErrorStrategy::Retry => Err(ExecutionError::RetriesExhausted {
                    node_id: outcome.node_id,
                    attempts: outcome.attempts,
                    message: e.to_string(),
                }),
            },
        }
    }
}

fn resolve_input(graph: &ExecutionGraph, node: &NodeDefinition, context: &ExecutionContext) -> DataMap {
    let outputs = context.completed_outputs();
    let completed_predecessors: Vec<&DataMap> = graph
        .predecessors(&node.id)
        .iter()
        .filter_map(|pred| outputs.get(pred))
        .collect();

    let mut input = DataMap::new();
    input.insert("input".to_string(), JsonValue::Object(context.input().clone()));
    input.insert("variables".to_string(), JsonValue::Object(context.variables()));
    input.insert("config".to_string(), JsonValue::Object(node.config.clone()));
    if let [previous] = completed_predecessors.as_slice() {
        input.insert("previous".to_string(), JsonValue::Object((*previous).clone()));
    }
    input.insert(
        "nodes".to_string(),
        JsonValue::Object(
            outputs
                .into_iter()
                .map(|(id, output)| (id.to_string(), JsonValue::Object(output)))
                .collect(),
        ),
    );
    input
}

/// Merged outputs of the completed end nodes, in node ID order. Without any,
/// every completed node's output under its node ID.
fn final_output(graph: &ExecutionGraph, context: &ExecutionContext) -> DataMap {
    let outputs = context.completed_outputs();
    let mut merged = DataMap::new();
    let mut any = false;
    for node_id in graph.end_nodes() {
        if let Some(output) = outputs.get(&node_id) {
            any = true;
            merged.extend(output.clone());
        }
    }
    if any {
        return merged;
    }

    outputs
        .into_iter()
        .map(|(id, output)| (id.to_string(), JsonValue::Object(output)))
        .collect()
}

async fn write_back(store: &dyn WorkflowStore, context: &ExecutionContext, state: &NodeState) {
    if let Err(e) = store.save_node_state(context.id(), state).await {
        context.record_persistence_error();
        warn!(
            execution_id = %context.id(),
            node_id = %state.node_id,
            error = %e,
            "failed to persist node state"
        );
    }
}

struct NodeOutcome {
    node_id: NodeId,
    attempts: u32,
    result: Result<DataMap, NodeError>,
}

/// Everything one node execution needs, owned so it can run on its own task.
struct NodeRun {
    definition: NodeDefinition,
    instance: Arc<dyn Node>,
    node_fn: NodeFn,
    input: DataMap,
    policy: RetryPolicy,
    timeout: Duration,
    context: Arc<ExecutionContext>,
    store: Arc<dyn WorkflowStore>,
}

impl NodeRun {
    async fn execute(self) -> NodeOutcome {
        let execution_id = self.context.id();
        let node_id = self.definition.id.clone();
        let token = self.context.cancellation_token().clone();
        let max_attempts = self.policy.attempts();
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);

        let mut state = NodeState::new(node_id.clone());
        state.start(self.input.clone());
        self.context.set_node_state(state.clone());

        let mut last_error = NodeError::Cancelled;
        for attempt in 1..=max_attempts {
            if token.is_cancelled() {
                last_error = NodeError::Cancelled;
                break;
            }

            let invocation = NodeInvocation {
                execution_id,
                node_id: node_id.clone(),
                node_type: self.definition.node_type.clone(),
                attempt,
                input: self.input.clone(),
                node: Arc::clone(&self.instance),
            };
            let started = Instant::now();
            let call = AssertUnwindSafe((self.node_fn)(invocation))
                .catch_unwind()
                .map(|caught| {
                    caught.unwrap_or_else(|payload| {
                        Err(NodeError::Panicked {
                            message: panic_message(payload.as_ref()),
                        })
                    })
                });
            let result = tokio::select! {
                result = tokio::time::timeout(self.timeout, call) => {
                    result.unwrap_or(Err(NodeError::Timeout { timeout_ms }))
                }
                () = token.cancelled() => Err(NodeError::Cancelled),
            };
            state.record_attempt(started.elapsed());

            match result {
                Ok(output) => {
                    state.complete(output.clone());
                    self.finish(&state).await;
                    return NodeOutcome {
                        node_id,
                        attempts: attempt,
                        result: Ok(output),
                    };
                }
                Err(NodeError::Cancelled) => {
                    last_error = NodeError::Cancelled;
                    break;
                }
                Err(e) => {
                    warn!(%execution_id, %node_id, attempt, max_attempts, error = %e, "node attempt failed");
                    last_error = e;
                    if attempt < max_attempts {
                        let delay = self.policy.delay_for_attempt(attempt);
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = token.cancelled() => {
                                last_error = NodeError::Cancelled;
                                break;
                            }
                        }
                    }
                }
            }
        }

        let message = if state.attempts > 1 && last_error != NodeError::Cancelled {
            format!("failed after {} attempts: {last_error}", state.attempts)
        } else {
            last_error.to_string()
        };
        state.fail(message);
        self.finish(&state).await;

        NodeOutcome {
            node_id,
            attempts: state.attempts,
            result: Err(last_error),
        }
    }

    async fn finish(&self, state: &NodeState) {
        self.context.set_node_state(state.clone());
        write_back(self.store.as_ref(), &self.context, state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ExpressionEvaluator;
    use crate::context::{ExecutionStatus, NodeStatus};
    use crate::definition::WorkflowSettings;
    use crate::edge::Edge;
    use crate::error::{GraphError, RegistryError, StoreError};
    use crate::middleware::TimeoutMiddleware;
    use crate::store::{MemoryStore, NoopStore};
    use async_trait::async_trait;
    use erp_flow_core::WorkflowId;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records every call; fails its first `fail_first` calls.
    struct ScriptedNode {
        id: String,
        output: DataMap,
        fail_first: u32,
        panics: bool,
        delay: Duration,
        calls: Arc<AtomicU32>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Node for ScriptedNode {
        fn node_type(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, _input: DataMap) -> Result<DataMap, NodeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.log.lock().unwrap().push(format!("{}:start", self.id));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.panics {
                panic!("{} blew up", self.id);
            }
            self.log.lock().unwrap().push(format!("{}:end", self.id));
            if call <= self.fail_first {
                return Err(NodeError::failed(format!("{} attempt {call} failed", self.id)));
            }
            Ok(self.output.clone())
        }
    }

    /// Registers a `scripted` type driven by node config:
    /// `fail_first` (number), `delay_ms` (number), `output` (object).
    struct Harness {
        registry: Arc<NodeRegistry>,
        calls: Arc<Mutex<HashMap<String, Arc<AtomicU32>>>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(NodeRegistry::with_builtins());
            let calls: Arc<Mutex<HashMap<String, Arc<AtomicU32>>>> = Arc::default();
            let log: Arc<Mutex<Vec<String>>> = Arc::default();
            {
                let calls = Arc::clone(&calls);
                let log = Arc::clone(&log);
                registry
                    .register("scripted", move |def: &NodeDefinition| {
                        let counter = Arc::clone(
                            calls
                                .lock()
                                .unwrap()
                                .entry(def.id.to_string())
                                .or_default(),
                        );
                        let config = &def.config;
                        Ok(Arc::new(ScriptedNode {
                            id: def.id.to_string(),
                            output: config
                                .get("output")
                                .and_then(JsonValue::as_object)
                                .cloned()
                                .unwrap_or_default(),
                            fail_first: config
                                .get("fail_first")
                                .and_then(JsonValue::as_u64)
                                .unwrap_or(0) as u32,
                            panics: config
                                .get("panic")
                                .and_then(JsonValue::as_bool)
                                .unwrap_or(false),
                            delay: Duration::from_millis(
                                config.get("delay_ms").and_then(JsonValue::as_u64).unwrap_or(0),
                            ),
                            calls: counter,
                            log: Arc::clone(&log),
                        }) as Arc<dyn Node>)
                    })
                    .expect("register");
            }
            Self {
                registry,
                calls,
                log,
            }
        }

        fn executor(&self, store: Arc<dyn WorkflowStore>) -> Executor {
            Executor::new(
                Arc::clone(&self.registry),
                &MiddlewareChain::new(),
                Arc::new(ExpressionEvaluator::new()),
                store,
                ExecutorDefaults {
                    retry_policy: RetryPolicy::none(),
                    node_timeout: Duration::from_secs(5),
                    execution_timeout: Duration::from_secs(60),
                },
            )
        }

        fn calls(&self, node_id: &str) -> u32 {
            self.calls
                .lock()
                .unwrap()
                .get(node_id)
                .map_or(0, |c| c.load(Ordering::SeqCst))
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn scripted(id: &str, output: JsonValue) -> NodeDefinition {
        NodeDefinition::new(id, "scripted").with_config("output", output)
    }

    fn context_for(definition: &WorkflowDefinition) -> Arc<ExecutionContext> {
        let mut input = DataMap::new();
        input.insert("days".to_string(), json!(5));
        Arc::new(ExecutionContext::new(
            definition.id,
            input,
            definition.variables.clone(),
            None,
        ))
    }

    fn status(context: &ExecutionContext, node_id: &str) -> Option<NodeStatus> {
        context.node_state(&NodeId::new(node_id)).map(|s| s.status)
    }

    #[tokio::test]
    async fn linear_chain_runs_one_node_per_layer() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("chain")
            .with_node(scripted("a", json!({"step": "a"})))
            .with_node(scripted("b", json!({"step": "b"})))
            .with_node(scripted("c", json!({"step": "c", "done": true})))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "c"));
        let context = context_for(&definition);

        let output = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .expect("run");

        assert_eq!(output, json!({"step": "c", "done": true}).as_object().cloned().unwrap());
        assert_eq!(
            harness.log(),
            vec!["a:start", "a:end", "b:start", "b:end", "c:start", "c:end"]
        );
        assert_eq!(context.status(), ExecutionStatus::Completed);
        assert_eq!(context.output(), output);
    }

    fn fan_out(on_error: ErrorStrategy) -> WorkflowDefinition {
        WorkflowDefinition::new("fan-out")
            .with_settings(WorkflowSettings {
                on_error,
                ..WorkflowSettings::default()
            })
            .with_node(scripted("a", json!({})))
            .with_node(scripted("b", json!({"b": 1})).with_config("fail_first", json!(10)))
            .with_node(scripted("c", json!({"c": 1})).with_config("delay_ms", json!(20)))
            .with_node(scripted("d", json!({"d": 1})))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("a", "c"))
            .with_edge(Edge::new("b", "d"))
            .with_edge(Edge::new("c", "d"))
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_with_continue_still_runs_join() {
        let harness = Harness::new();
        let definition = fan_out(ErrorStrategy::Continue);
        let context = context_for(&definition);

        let output = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .expect("run");

        assert_eq!(status(&context, "b"), Some(NodeStatus::Failed));
        assert_eq!(status(&context, "c"), Some(NodeStatus::Completed));
        assert_eq!(status(&context, "d"), Some(NodeStatus::Completed));
        assert_eq!(output.get("d"), Some(&json!(1)));

        // d starts only after both b and c finished.
        let log = harness.log();
        let d_start = log.iter().position(|e| e == "d:start").expect("d ran");
        for end in ["b:end", "c:end"] {
            assert!(log.iter().position(|e| e == end).expect("ended") < d_start);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_with_stop_fails_without_join() {
        let harness = Harness::new();
        let definition = fan_out(ErrorStrategy::Stop);
        let context = context_for(&definition);

        let err = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::NodeExecutionFailed { ref node_id, .. } if node_id.as_str() == "b"));
        // The sibling still finished before the layer completed.
        assert_eq!(status(&context, "c"), Some(NodeStatus::Completed));
        assert_eq!(harness.calls("d"), 0);
        assert_eq!(status(&context, "d"), None);
        assert_eq!(context.status(), ExecutionStatus::Failed);
    }

    fn fan_out_with_panic(on_error: ErrorStrategy) -> WorkflowDefinition {
        WorkflowDefinition::new("fan-out-panic")
            .with_settings(WorkflowSettings {
                on_error,
                ..WorkflowSettings::default()
            })
            .with_node(scripted("a", json!({})))
            .with_node(scripted("b", json!({})).with_config("panic", json!(true)))
            .with_node(scripted("c", json!({"c": 1})))
            .with_node(scripted("d", json!({"d": 1})))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("a", "c"))
            .with_edge(Edge::new("b", "d"))
            .with_edge(Edge::new("c", "d"))
    }

    #[tokio::test]
    async fn panicking_sibling_fails_the_layer_without_recovery_middleware() {
        let harness = Harness::new();
        let definition = fan_out_with_panic(ErrorStrategy::Stop);
        let context = context_for(&definition);

        let err = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::NodeExecutionFailed { ref node_id, .. } if node_id.as_str() == "b"));
        let b = context.node_state(&NodeId::new("b")).expect("b state");
        assert_eq!(b.status, NodeStatus::Failed);
        assert!(b.error.as_deref().unwrap_or_default().contains("b blew up"));
        assert_eq!(status(&context, "c"), Some(NodeStatus::Completed));
        assert_eq!(harness.calls("d"), 0);
        assert_eq!(context.status(), ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn panicking_sibling_follows_continue_strategy() {
        let harness = Harness::new();
        let definition = fan_out_with_panic(ErrorStrategy::Continue);
        let context = context_for(&definition);

        let output = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .expect("run");

        assert_eq!(status(&context, "b"), Some(NodeStatus::Failed));
        assert_eq!(status(&context, "d"), Some(NodeStatus::Completed));
        assert_eq!(output.get("d"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn panicking_single_node_ends_the_run() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("lonely-panic")
            .with_node(scripted("a", json!({})).with_config("panic", json!(true)));
        let context = context_for(&definition);

        let err = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::NodeExecutionFailed { .. }));
        assert_eq!(status(&context, "a"), Some(NodeStatus::Failed));
        assert!(context.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_strategy_reports_attempts() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("retry")
            .with_settings(WorkflowSettings {
                on_error: ErrorStrategy::Retry,
                max_attempts: Some(2),
                retry_delay_ms: Some(10),
                ..WorkflowSettings::default()
            })
            .with_node(scripted("a", json!({})).with_config("fail_first", json!(10)));
        let context = context_for(&definition);

        let err = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, context)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(harness.calls("a"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn node_retries_with_backoff_until_success() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("flaky").with_node(
            scripted("a", json!({"ok": true}))
                .with_config("fail_first", json!(2))
                .with_retry(RetryPolicy::new(3, Duration::from_millis(100), 2.0)),
        );
        let context = context_for(&definition);

        let started = Instant::now();
        harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .expect("run");
        let elapsed = started.elapsed();

        let state = context.node_state(&NodeId::new("a")).expect("state");
        assert_eq!(state.status, NodeStatus::Completed);
        assert_eq!(state.attempts, 3);
        assert_eq!(state.attempt_durations_ms.len(), 3);
        // Backoffs of 200ms and 400ms.
        assert!(elapsed >= Duration::from_millis(600), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_the_run() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("cancel")
            .with_node(
                scripted("a", json!({}))
                    .with_config("fail_first", json!(10))
                    .with_retry(RetryPolicy::new(5, Duration::from_secs(10), 1.0)),
            )
            .with_node(scripted("b", json!({})))
            .with_edge(Edge::new("a", "b"));
        let context = context_for(&definition);

        let executor = Arc::new(harness.executor(Arc::new(NoopStore)));
        let run = {
            let executor = Arc::clone(&executor);
            let context = Arc::clone(&context);
            let definition = definition.clone();
            tokio::spawn(async move { executor.run(&definition, context).await })
        };

        // First attempt fails at once; the run is now waiting out the backoff.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(harness.calls("a"), 1);
        context.cancel();

        let err = run.await.expect("join").unwrap_err();
        assert_eq!(err, ExecutionError::ExecutionCancelled);
        assert_eq!(harness.calls("a"), 1);
        assert_eq!(harness.calls("b"), 0);
        assert_eq!(context.status(), ExecutionStatus::Cancelled);
        assert_eq!(status(&context, "a"), Some(NodeStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn workflow_timeout_ends_run_with_timeout_status() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("slow")
            .with_settings(WorkflowSettings {
                timeout_secs: Some(1),
                ..WorkflowSettings::default()
            })
            .with_node(scripted("a", json!({})).with_config("delay_ms", json!(4000)));
        let context = context_for(&definition);

        let err = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .unwrap_err();

        assert_eq!(err, ExecutionError::ExecutionTimeout);
        assert_eq!(context.status(), ExecutionStatus::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn node_timeout_counts_as_failed_attempt() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("node-timeout").with_node(
            scripted("a", json!({}))
                .with_config("delay_ms", json!(500))
                .with_timeout(Duration::from_millis(100)),
        );
        let context = context_for(&definition);

        let err = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::NodeExecutionFailed { ref message, .. } if message.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_middleware_expiry_is_a_node_failure() {
        let harness = Harness::new();
        let executor = Executor::new(
            Arc::clone(&harness.registry),
            &MiddlewareChain::new().with(TimeoutMiddleware::new(Duration::from_millis(50))),
            Arc::new(ExpressionEvaluator::new()),
            Arc::new(NoopStore),
            ExecutorDefaults::default(),
        );
        let definition = WorkflowDefinition::new("middleware-timeout")
            .with_node(scripted("a", json!({})).with_config("delay_ms", json!(500)));
        let context = context_for(&definition);

        let err = executor
            .run(&definition, Arc::clone(&context))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExecutionError::NodeExecutionFailed { ref message, .. } if message.contains("timed out after 50ms")
        ));
        assert_eq!(status(&context, "a"), Some(NodeStatus::Failed));
        assert_eq!(context.status(), ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn conditions_select_branches() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("branch")
            .with_node(scripted("review", json!({"approved": true, "amount": 900})))
            .with_node(scripted("approve", json!({"result": "approved"})))
            .with_node(scripted("reject", json!({"result": "rejected"})))
            .with_node(scripted("escalate", json!({"escalated": true})))
            .with_edge(Edge::new("review", "approve").with_condition("output.approved"))
            .with_edge(Edge::new("review", "reject").with_condition("!output.approved"))
            .with_edge(
                Edge::new("review", "escalate")
                    .with_condition("output.amount > 500 && input.days >= 5"),
            );
        let context = context_for(&definition);

        let output = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .expect("run");

        assert_eq!(status(&context, "approve"), Some(NodeStatus::Completed));
        assert_eq!(status(&context, "reject"), Some(NodeStatus::Skipped));
        assert_eq!(status(&context, "escalate"), Some(NodeStatus::Completed));
        assert_eq!(harness.calls("reject"), 0);
        assert_eq!(output.get("result"), Some(&json!("approved")));
        assert_eq!(output.get("escalated"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn skipped_branch_propagates_downstream() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("skip-chain")
            .with_node(scripted("a", json!({"go": false})))
            .with_node(scripted("b", json!({})))
            .with_node(scripted("c", json!({})))
            .with_edge(Edge::new("a", "b").with_condition("go"))
            .with_edge(Edge::new("b", "c"));
        let context = context_for(&definition);

        let output = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .expect("run");

        assert_eq!(status(&context, "b"), Some(NodeStatus::Skipped));
        assert_eq!(status(&context, "c"), Some(NodeStatus::Skipped));
        // No end node completed: outputs are keyed by node.
        assert_eq!(output.get("a"), Some(&json!({"go": false})));
    }

    #[tokio::test]
    async fn malformed_condition_fails_before_any_node_runs() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("bad-condition")
            .with_node(scripted("a", json!({})))
            .with_node(scripted("b", json!({})))
            .with_edge(Edge::new("a", "b").with_id("a-b").with_condition("output.x =="));
        let context = context_for(&definition);

        let err = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, context)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::InvalidCondition { ref edge_id, .. } if edge_id == "a-b"));
        assert_eq!(harness.calls("a"), 0);
    }

    #[tokio::test]
    async fn disabled_nodes_are_skipped_and_not_instantiated() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("disabled")
            .with_node(scripted("a", json!({"a": 1})))
            .with_node(NodeDefinition::new("b", "unregistered").disabled())
            .with_edge(Edge::new("a", "b"));
        let context = context_for(&definition);

        harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .expect("run");

        assert_eq!(status(&context, "a"), Some(NodeStatus::Completed));
        assert_eq!(status(&context, "b"), Some(NodeStatus::Skipped));
    }

    #[tokio::test]
    async fn unknown_node_type_fails_the_run() {
        let harness = Harness::new();
        let definition =
            WorkflowDefinition::new("unknown").with_node(NodeDefinition::new("a", "unregistered"));
        let context = context_for(&definition);

        let err = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExecutionError::Registry(RegistryError::TypeNotRegistered { .. })
        ));
        assert_eq!(context.status(), ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn invalid_graph_is_reported() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("cycle")
            .with_node(scripted("a", json!({})))
            .with_node(scripted("b", json!({})))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "a"));

        let err = harness
            .executor(Arc::new(NoopStore))
            .run(&definition, context_for(&definition))
            .await
            .unwrap_err();

        assert_eq!(err, ExecutionError::InvalidGraph(GraphError::MissingTriggerNode));
    }

    #[tokio::test]
    async fn marked_outputs_become_variables_and_inputs_carry_context() {
        let harness = Harness::new();
        let seen: Arc<Mutex<Option<DataMap>>> = Arc::default();
        {
            let seen = Arc::clone(&seen);
            harness
                .registry
                .register("capture", move |_def: &NodeDefinition| {
                    Ok(Arc::new(CaptureNode {
                        seen: Arc::clone(&seen),
                    }) as Arc<dyn Node>)
                })
                .expect("register");
        }

        let definition = WorkflowDefinition::new("variables")
            .with_variable("department", json!("finance"))
            .with_node(
                NodeDefinition::new("mark", "set_variables").with_config("approved", json!(true)),
            )
            .with_node(NodeDefinition::new("check", "capture").with_config("level", json!(2)))
            .with_edge(Edge::new("mark", "check").with_condition("vars.approved"));
        let context = context_for(&definition);

        harness
            .executor(Arc::new(NoopStore))
            .run(&definition, Arc::clone(&context))
            .await
            .expect("run");

        assert_eq!(context.get_variable("approved"), Some(json!(true)));
        assert_eq!(context.get_variable("department"), Some(json!("finance")));

        let seen = seen.lock().unwrap().clone().expect("captured");
        assert_eq!(seen["input"]["days"], json!(5));
        assert_eq!(seen["variables"]["approved"], json!(true));
        assert_eq!(seen["config"]["level"], json!(2));
        assert_eq!(seen["previous"]["$approved"], json!(true));
        assert_eq!(seen["nodes"]["mark"]["$approved"], json!(true));
    }

    struct CaptureNode {
        seen: Arc<Mutex<Option<DataMap>>>,
    }

    #[async_trait]
    impl Node for CaptureNode {
        fn node_type(&self) -> &str {
            "capture"
        }

        async fn execute(&self, input: DataMap) -> Result<DataMap, NodeError> {
            *self.seen.lock().unwrap() = Some(input);
            Ok(DataMap::new())
        }
    }

    #[tokio::test]
    async fn node_states_are_written_back() {
        let harness = Harness::new();
        let store = Arc::new(MemoryStore::new());
        let definition = WorkflowDefinition::new("persist")
            .with_node(scripted("a", json!({})))
            .with_node(scripted("b", json!({})).disabled())
            .with_edge(Edge::new("a", "b"));
        let context = context_for(&definition);

        harness
            .executor(store.clone())
            .run(&definition, Arc::clone(&context))
            .await
            .expect("run");

        let states = store.list_node_states(context.id()).await.expect("list");
        let summary: Vec<_> = states
            .iter()
            .map(|s| (s.node_id.as_str(), s.status))
            .collect();
        assert_eq!(
            summary,
            vec![("a", NodeStatus::Completed), ("b", NodeStatus::Skipped)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn running_record_is_stored_while_nodes_execute() {
        let harness = Harness::new();
        let store = Arc::new(MemoryStore::new());
        let definition = WorkflowDefinition::new("slow")
            .with_node(scripted("a", json!({})).with_config("delay_ms", json!(1_000)));
        let context = context_for(&definition);
        let execution_id = context.id();

        let executor = Arc::new(harness.executor(store.clone()));
        let run = {
            let executor = Arc::clone(&executor);
            let context = Arc::clone(&context);
            tokio::spawn(async move { executor.run(&definition, context).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let running = store
            .get_execution(execution_id)
            .await
            .expect("get")
            .expect("stored while running");
        assert_eq!(running.status, ExecutionStatus::Running);
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        run.await.expect("join").expect("run");
        assert_eq!(context.persistence_errors(), 0);
    }

    struct FailingStore;

    #[async_trait]
    impl WorkflowStore for FailingStore {
        async fn save_workflow(&self, _: &WorkflowDefinition) -> Result<(), StoreError> {
            Err(StoreError::failed("save_workflow", "offline"))
        }
        async fn get_workflow(&self, _: WorkflowId) -> Result<Option<WorkflowDefinition>, StoreError> {
            Ok(None)
        }
        async fn delete_workflow(&self, _: WorkflowId) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn list_workflows(
            &self,
            _: &crate::store::WorkflowFilter,
        ) -> Result<Vec<WorkflowDefinition>, StoreError> {
            Ok(Vec::new())
        }
        async fn save_execution(&self, _: &crate::store::ExecutionRecord) -> Result<(), StoreError> {
            Err(StoreError::failed("save_execution", "offline"))
        }
        async fn get_execution(
            &self,
            _: erp_flow_core::ExecutionId,
        ) -> Result<Option<crate::store::ExecutionRecord>, StoreError> {
            Ok(None)
        }
        async fn delete_execution(&self, _: erp_flow_core::ExecutionId) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn list_executions(
            &self,
            _: &crate::store::ExecutionFilter,
        ) -> Result<Vec<crate::store::ExecutionRecord>, StoreError> {
            Ok(Vec::new())
        }
        async fn save_node_state(
            &self,
            _: erp_flow_core::ExecutionId,
            _: &NodeState,
        ) -> Result<(), StoreError> {
            Err(StoreError::failed("save_node_state", "offline"))
        }
        async fn get_node_state(
            &self,
            _: erp_flow_core::ExecutionId,
            _: &NodeId,
        ) -> Result<Option<NodeState>, StoreError> {
            Ok(None)
        }
        async fn list_node_states(
            &self,
            _: erp_flow_core::ExecutionId,
        ) -> Result<Vec<NodeState>, StoreError> {
            Ok(Vec::new())
        }
        async fn statistics(
            &self,
            _: Option<WorkflowId>,
        ) -> Result<crate::store::ExecutionStatistics, StoreError> {
            Ok(crate::store::ExecutionStatistics::default())
        }
        async fn execution_history(
            &self,
            _: WorkflowId,
            _: chrono::DateTime<chrono::Utc>,
            _: chrono::DateTime<chrono::Utc>,
        ) -> Result<Vec<crate::store::ExecutionRecord>, StoreError> {
            Ok(Vec::new())
        }
        async fn cleanup_executions(
            &self,
            _: chrono::DateTime<chrono::Utc>,
        ) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn persistence_failures_do_not_change_the_run() {
        let harness = Harness::new();
        let definition = WorkflowDefinition::new("offline")
            .with_node(scripted("a", json!({"a": 1})))
            .with_node(scripted("b", json!({"b": 2})))
            .with_edge(Edge::new("a", "b"));
        let context = context_for(&definition);

        let output = harness
            .executor(Arc::new(FailingStore))
            .run(&definition, Arc::clone(&context))
            .await
            .expect("run");

        assert_eq!(output.get("b"), Some(&json!(2)));
        assert_eq!(context.status(), ExecutionStatus::Completed);
        // The running record and both node states.
        assert_eq!(context.persistence_errors(), 3);
    }
}
