//! Cross-cutting wrappers around node execution.
//!
//! A middleware turns the next node function into a new one. The chain is
//! folded from the last middleware to the first, so the first middleware in
//! the chain is the outermost wrapper. The executor applies the same chain to
//! every node type.

use crate::error::NodeError;
use crate::node::{DataMap, Node, NodeId, RetryPolicy};
use erp_flow_core::ExecutionId;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use std::backtrace::Backtrace;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, oneshot};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info_span, warn};

/// One call of a node, as seen by middleware.
#[derive(Clone)]
pub struct NodeInvocation {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub node_type: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub input: DataMap,
    pub node: Arc<dyn Node>,
}

impl std::fmt::Debug for NodeInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeInvocation")
            .field("execution_id", &self.execution_id)
            .field("node_id", &self.node_id)
            .field("node_type", &self.node_type)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// A node function: the innermost one calls [`Node::execute`].
pub type NodeFn =
    Arc<dyn Fn(NodeInvocation) -> BoxFuture<'static, Result<DataMap, NodeError>> + Send + Sync>;

/// The innermost node function.
#[must_use]
pub fn execute_node() -> NodeFn {
    Arc::new(|invocation: NodeInvocation| {
        Box::pin(async move {
            let NodeInvocation { node, input, .. } = invocation;
            node.execute(input).await
        })
    })
}

/// Wraps a node function.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn wrap(&self, next: NodeFn) -> NodeFn;
}

/// Ordered list of middleware.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware; it wraps inside the ones added before it.
    #[must_use]
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Names, outermost first.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.middlewares.iter().map(|m| m.name().to_string()).collect()
    }

    /// Wraps `base` with every middleware.
    #[must_use]
    pub fn apply(&self, base: NodeFn) -> NodeFn {
        self.middlewares
            .iter()
            .rev()
            .fold(base, |next, middleware| middleware.wrap(next))
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Logs the start, duration and outcome of every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn wrap(&self, next: NodeFn) -> NodeFn {
        Arc::new(move |invocation: NodeInvocation| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let execution_id = invocation.execution_id;
                let node_id = invocation.node_id.clone();
                let attempt = invocation.attempt;
                debug!(%execution_id, %node_id, attempt, "node started");

                let started = Instant::now();
                let result = next(invocation).await;
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

                match &result {
                    Ok(_) => debug!(%execution_id, %node_id, attempt, duration_ms, "node finished"),
                    Err(e) => warn!(
                        %execution_id,
                        %node_id,
                        attempt,
                        duration_ms,
                        error = %e,
                        "node failed"
                    ),
                }
                result
            })
        })
    }
}

/// Converts panics into [`NodeError::Panicked`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryMiddleware;

impl Middleware for RecoveryMiddleware {
    fn name(&self) -> &str {
        "recovery"
    }

    fn wrap(&self, next: NodeFn) -> NodeFn {
        Arc::new(move |invocation: NodeInvocation| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let execution_id = invocation.execution_id;
                let node_id = invocation.node_id.clone();
                match AssertUnwindSafe(next(invocation)).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        let backtrace = Backtrace::force_capture();
                        error!(
                            %execution_id,
                            %node_id,
                            panic = %message,
                            %backtrace,
                            "node panicked"
                        );
                        Err(NodeError::Panicked { message })
                    }
                }
            })
        })
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Counters for one node type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeMetrics {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

impl NodeMetrics {
    /// Mean duration of a call, in milliseconds.
    #[must_use]
    pub fn average_duration_ms(&self) -> u64 {
        self.total_duration_ms.checked_div(self.executions).unwrap_or(0)
    }
}

/// Collects [`NodeMetrics`] per node type. Clones share the counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsMiddleware {
    metrics: Arc<Mutex<HashMap<String, NodeMetrics>>>,
}

impl MetricsMiddleware {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counters keyed by node type.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, NodeMetrics> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn reset(&self) {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    fn wrap(&self, next: NodeFn) -> NodeFn {
        let metrics = Arc::clone(&self.metrics);
        Arc::new(move |invocation: NodeInvocation| {
            let next = Arc::clone(&next);
            let metrics = Arc::clone(&metrics);
            Box::pin(async move {
                let node_type = invocation.node_type.clone();
                let started = Instant::now();
                let result = next(invocation).await;
                let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

                let mut metrics = metrics.lock().unwrap_or_else(PoisonError::into_inner);
                let entry = metrics.entry(node_type).or_default();
                entry.executions += 1;
                entry.total_duration_ms = entry.total_duration_ms.saturating_add(elapsed);
                if result.is_ok() {
                    entry.successes += 1;
                } else {
                    entry.failures += 1;
                }
                result
            })
        })
    }
}

/// Bounds every call by a deadline.
///
/// The node runs on its own task and reports through a oneshot channel; the
/// task is aborted when the deadline passes first.
///
/// An expired call fails with `NodeError::Timeout`, which the executor
/// treats like any other node failure: it is retried, then reported as
/// `NodeExecutionFailed` or `RetriesExhausted` according to the workflow's
/// `on_error`. `ExecutionError::ExecutionTimeout` is reserved for the
/// workflow-level deadline.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &str {
        "timeout"
    }

    fn wrap(&self, next: NodeFn) -> NodeFn {
        let timeout = self.timeout;
        Arc::new(move |invocation: NodeInvocation| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let (tx, rx) = oneshot::channel();
                let task = tokio::spawn(async move {
                    let _ = tx.send(next(invocation).await);
                });

                tokio::select! {
                    result = rx => result.unwrap_or_else(|_| {
                        Err(NodeError::Panicked {
                            message: "node task ended without a result".to_string(),
                        })
                    }),
                    () = tokio::time::sleep(timeout) => {
                        task.abort();
                        Err(NodeError::Timeout {
                            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        })
                    }
                }
            })
        })
    }
}

/// Retries failed calls with a fixed policy, independent of the executor's
/// per-node retry.
#[derive(Debug, Clone)]
pub struct RetryMiddleware {
    policy: RetryPolicy,
}

impl RetryMiddleware {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    fn wrap(&self, next: NodeFn) -> NodeFn {
        let policy = self.policy.clone();
        Arc::new(move |invocation: NodeInvocation| {
            let next = Arc::clone(&next);
            let policy = policy.clone();
            Box::pin(async move {
                let attempts = policy.attempts();
                let mut attempt = 1;
                loop {
                    let mut call = invocation.clone();
                    call.attempt = attempt;
                    match next(call).await {
                        Ok(output) => return Ok(output),
                        Err(NodeError::Cancelled) => return Err(NodeError::Cancelled),
                        Err(e) if attempt >= attempts => return Err(e),
                        Err(e) => {
                            debug!(
                                node_id = %invocation.node_id,
                                attempt,
                                error = %e,
                                "retrying node"
                            );
                            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                            attempt += 1;
                        }
                    }
                }
            })
        })
    }
}

/// Limits the number of concurrent calls with a counting semaphore.
#[derive(Debug, Clone)]
pub struct RateLimitMiddleware {
    semaphore: Arc<Semaphore>,
}

impl RateLimitMiddleware {
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn wrap(&self, next: NodeFn) -> NodeFn {
        let semaphore = Arc::clone(&self.semaphore);
        Arc::new(move |invocation: NodeInvocation| {
            let next = Arc::clone(&next);
            let semaphore = Arc::clone(&semaphore);
            Box::pin(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| NodeError::failed("rate limiter closed"))?;
                next(invocation).await
            })
        })
    }
}

/// Caches successful outputs for a time-to-live.
///
/// The key is the node type, the node ID and the serialized input. Serde JSON
/// maps are ordered, so equal inputs always serialize the same way.
#[derive(Debug, Clone)]
pub struct CacheMiddleware {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, (Instant, DataMap)>>>,
}

impl CacheMiddleware {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::default(),
        }
    }

    /// Drops every cached entry.
    pub fn invalidate(&self) {
        self.lock().clear();
    }

    /// Number of cached entries, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Instant, DataMap)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(invocation: &NodeInvocation) -> String {
        let input = serde_json::to_string(&invocation.input).unwrap_or_default();
        format!("{}:{}:{input}", invocation.node_type, invocation.node_id)
    }
}

impl Middleware for CacheMiddleware {
    fn name(&self) -> &str {
        "cache"
    }

    fn wrap(&self, next: NodeFn) -> NodeFn {
        let cache = self.clone();
        Arc::new(move |invocation: NodeInvocation| {
            let next = Arc::clone(&next);
            let cache = cache.clone();
            Box::pin(async move {
                let key = Self::key(&invocation);
                {
                    let mut entries = cache.lock();
                    let hit = entries
                        .get(&key)
                        .filter(|(stored, _)| stored.elapsed() < cache.ttl)
                        .map(|(_, output)| output.clone());
                    if let Some(output) = hit {
                        debug!(node_id = %invocation.node_id, "cache hit");
                        return Ok(output);
                    }
                    entries.remove(&key);
                }

                let output = next(invocation).await?;
                cache.lock().insert(key, (Instant::now(), output.clone()));
                Ok(output)
            })
        })
    }
}

/// Runs every call inside a `node` span.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

impl Middleware for TracingMiddleware {
    fn name(&self) -> &str {
        "tracing"
    }

    fn wrap(&self, next: NodeFn) -> NodeFn {
        Arc::new(move |invocation: NodeInvocation| {
            let span = info_span!(
                "node",
                execution_id = %invocation.execution_id,
                node_id = %invocation.node_id,
                node_type = %invocation.node_type,
                attempt = invocation.attempt,
            );
            next(invocation).instrument(span).boxed()
        })
    }
}

/// A predicate over node input or output.
pub type Validator = Arc<dyn Fn(&DataMap) -> Result<(), String> + Send + Sync>;

/// Checks input before and output after every call.
#[derive(Clone, Default)]
pub struct ValidationMiddleware {
    input_rules: Vec<Validator>,
    output_rules: Vec<Validator>,
}

impl ValidationMiddleware {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_input_rule(
        mut self,
        rule: impl Fn(&DataMap) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.input_rules.push(Arc::new(rule));
        self
    }

    #[must_use]
    pub fn with_output_rule(
        mut self,
        rule: impl Fn(&DataMap) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.output_rules.push(Arc::new(rule));
        self
    }
}

impl std::fmt::Debug for ValidationMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationMiddleware")
            .field("input_rules", &self.input_rules.len())
            .field("output_rules", &self.output_rules.len())
            .finish()
    }
}

impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    fn wrap(&self, next: NodeFn) -> NodeFn {
        let input_rules = self.input_rules.clone();
        let output_rules = self.output_rules.clone();
        Arc::new(move |invocation: NodeInvocation| {
            let next = Arc::clone(&next);
            let input_rules = input_rules.clone();
            let output_rules = output_rules.clone();
            Box::pin(async move {
                for rule in &input_rules {
                    rule(&invocation.input).map_err(|message| NodeError::InvalidInput { message })?;
                }
                let output = next(invocation).await?;
                for rule in &output_rules {
                    rule(&output).map_err(|message| NodeError::InvalidOutput { message })?;
                }
                Ok(output)
            })
        })
    }
}
