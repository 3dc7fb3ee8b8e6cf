//! Per-run execution state.
//!
//! An `ExecutionContext` is created for every run and shared through `Arc`
//! between the executor, the engine and callers polling for progress. The
//! executor is the only writer. The `ContextManager` keeps the contexts of
//! recent runs until the retention window passes.

use crate::node::{DataMap, NodeId};
use chrono::{DateTime, TimeDelta, Utc};
use erp_flow_core::{ExecutionId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not started yet.
    Pending,
    /// Nodes are executing.
    Running,
    /// All scheduled nodes finished and the run produced its output.
    Completed,
    /// A node failure or a structural problem ended the run.
    Failed,
    /// The run was cancelled.
    Cancelled,
    /// The run exceeded its execution timeout.
    Timeout,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Returns the status as its stored string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// The status of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Disabled, or no incoming edge fired.
    Skipped,
}

impl NodeStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns the status as its stored string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

/// Execution record of a single node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: NodeId,
    pub status: NodeStatus,
    /// Input the node received.
    #[serde(default)]
    pub input: DataMap,
    /// Output of the successful attempt.
    #[serde(default)]
    pub output: DataMap,
    /// Error of the last failed attempt, or the skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts made so far.
    pub attempts: u32,
    /// Wall-clock duration of every attempt, in milliseconds.
    #[serde(default)]
    pub attempt_durations_ms: Vec<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeState {
    /// Creates a pending node state.
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: NodeStatus::Pending,
            input: DataMap::new(),
            output: DataMap::new(),
            error: None,
            attempts: 0,
            attempt_durations_ms: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Starts execution of this node.
    pub fn start(&mut self, input: DataMap) {
        self.status = NodeStatus::Running;
        self.started_at = Some(Utc::now());
        self.input = input;
    }

    /// Records one finished attempt.
    pub fn record_attempt(&mut self, duration: Duration) {
        self.attempts += 1;
        self.attempt_durations_ms
            .push(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
    }

    /// Marks the node as completed.
    pub fn complete(&mut self, output: DataMap) {
        self.status = NodeStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.output = output;
        self.error = None;
    }

    /// Marks the node as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = NodeStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    /// Marks the node as skipped.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = NodeStatus::Skipped;
        self.completed_at = Some(Utc::now());
        self.error = Some(reason.into());
    }

    /// Total time spent in attempts.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        Duration::from_millis(self.attempt_durations_ms.iter().sum())
    }
}

/// Serializable point-in-time copy of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub input: DataMap,
    pub output: DataMap,
    pub variables: DataMap,
    pub node_states: BTreeMap<NodeId, NodeState>,
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Caller annotations, such as the definition version the run used.
    #[serde(default)]
    pub metadata: DataMap,
    /// Node-state writes the store rejected during the run.
    #[serde(default)]
    pub persistence_errors: u64,
}

impl ExecutionSnapshot {
    /// Duration of the run, if it has started.
    #[must_use]
    pub fn duration(&self) -> Option<TimeDelta> {
        let start = self.started_at?;
        Some(self.completed_at.unwrap_or_else(Utc::now) - start)
    }
}

#[derive(Debug)]
struct ContextState {
    status: ExecutionStatus,
    output: DataMap,
    variables: DataMap,
    node_states: HashMap<NodeId, NodeState>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    metadata: DataMap,
}

/// Live state of one run.
#[derive(Debug)]
pub struct ExecutionContext {
    id: ExecutionId,
    workflow_id: WorkflowId,
    input: DataMap,
    triggered_by: Option<String>,
    created_at: DateTime<Utc>,
    state: RwLock<ContextState>,
    cancel: CancellationToken,
    status_tx: watch::Sender<ExecutionStatus>,
    persistence_errors: AtomicU64,
}

impl ExecutionContext {
    /// Creates a pending context. `variables` seeds the run variables.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        input: DataMap,
        variables: DataMap,
        triggered_by: Option<String>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ExecutionStatus::Pending);
        Self {
            id: ExecutionId::new(),
            workflow_id,
            input,
            triggered_by,
            created_at: Utc::now(),
            state: RwLock::new(ContextState {
                status: ExecutionStatus::Pending,
                output: DataMap::new(),
                variables,
                node_states: HashMap::new(),
                started_at: None,
                completed_at: None,
                error: None,
                metadata: DataMap::new(),
            }),
            cancel: CancellationToken::new(),
            status_tx,
            persistence_errors: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    #[must_use]
    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    /// Input the run was started with.
    #[must_use]
    pub fn input(&self) -> &DataMap {
        &self.input
    }

    #[must_use]
    pub fn triggered_by(&self) -> Option<&str> {
        self.triggered_by.as_deref()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        self.read().status
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Token cancelled when the run is cancelled or times out.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests cancellation. The executor observes the token and finishes
    /// the run as cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn get_variable(&self, key: &str) -> Option<JsonValue> {
        self.read().variables.get(key).cloned()
    }

    #[must_use]
    pub fn metadata(&self) -> DataMap {
        self.read().metadata.clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: JsonValue) {
        self.write().metadata.insert(key.into(), value);
    }

    pub fn set_variable(&self, key: impl Into<String>, value: JsonValue) {
        self.write().variables.insert(key.into(), value);
    }

    /// Copy of all run variables.
    #[must_use]
    pub fn variables(&self) -> DataMap {
        self.read().variables.clone()
    }

    #[must_use]
    pub fn output(&self) -> DataMap {
        self.read().output.clone()
    }

    pub fn set_output(&self, output: DataMap) {
        self.write().output = output;
    }

    #[must_use]
    pub fn node_state(&self, node_id: &NodeId) -> Option<NodeState> {
        self.read().node_states.get(node_id).cloned()
    }

    /// Stores a node state. A node state that is already terminal is never
    /// replaced; returns false in that case.
    pub fn set_node_state(&self, node_state: NodeState) -> bool {
        let mut state = self.write();
        if state
            .node_states
            .get(&node_state.node_id)
            .is_some_and(|existing| existing.status.is_terminal())
        {
            debug!(
                execution_id = %self.id,
                node_id = %node_state.node_id,
                "ignoring write to terminal node state"
            );
            return false;
        }
        state
            .node_states
            .insert(node_state.node_id.clone(), node_state);
        true
    }

    /// All node states.
    #[must_use]
    pub fn node_states(&self) -> HashMap<NodeId, NodeState> {
        self.read().node_states.clone()
    }

    /// Outputs of the completed nodes.
    #[must_use]
    pub fn completed_outputs(&self) -> HashMap<NodeId, DataMap> {
        self.read()
            .node_states
            .values()
            .filter(|s| s.status == NodeStatus::Completed)
            .map(|s| (s.node_id.clone(), s.output.clone()))
            .collect()
    }

    /// Moves a pending run to running.
    pub fn mark_running(&self) -> bool {
        let mut state = self.write();
        if state.status != ExecutionStatus::Pending {
            return false;
        }
        state.status = ExecutionStatus::Running;
        state.started_at = Some(Utc::now());
        drop(state);
        self.status_tx.send_replace(ExecutionStatus::Running);
        true
    }

    /// Marks the run as completed with its final output.
    pub fn mark_completed(&self, output: DataMap) -> bool {
        self.finish(ExecutionStatus::Completed, Some(output), None)
    }

    /// Marks the run as failed.
    pub fn mark_failed(&self, error: impl Into<String>) -> bool {
        self.finish(ExecutionStatus::Failed, None, Some(error.into()))
    }

    /// Marks the run as cancelled.
    pub fn mark_cancelled(&self, reason: impl Into<String>) -> bool {
        self.finish(ExecutionStatus::Cancelled, None, Some(reason.into()))
    }

    /// Marks the run as timed out.
    pub fn mark_timeout(&self, error: impl Into<String>) -> bool {
        self.finish(ExecutionStatus::Timeout, None, Some(error.into()))
    }

    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.read().started_at
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.read().completed_at
    }

    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.read().error.clone()
    }

    /// Time since the run started, up to completion. Zero before start.
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        let state = self.read();
        match state.started_at {
            Some(start) => state.completed_at.unwrap_or_else(Utc::now) - start,
            None => TimeDelta::zero(),
        }
    }

    /// Counts a rejected node-state write.
    pub fn record_persistence_error(&self) {
        self.persistence_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn persistence_errors(&self) -> u64 {
        self.persistence_errors.load(Ordering::Relaxed)
    }

    /// Subscribes to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ExecutionStatus> {
        self.status_tx.subscribe()
    }

    /// Waits until the run reaches a terminal status.
    pub async fn wait(&self) -> ExecutionStatus {
        let mut rx = self.status_tx.subscribe();
        match rx.wait_for(ExecutionStatus::is_terminal).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ExecutionSnapshot {
        let state = self.read();
        ExecutionSnapshot {
            id: self.id,
            workflow_id: self.workflow_id,
            status: state.status,
            input: self.input.clone(),
            output: state.output.clone(),
            variables: state.variables.clone(),
            node_states: state
                .node_states
                .iter()
                .map(|(id, s)| (id.clone(), s.clone()))
                .collect(),
            triggered_by: self.triggered_by.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            error: state.error.clone(),
            metadata: state.metadata.clone(),
            persistence_errors: self.persistence_errors(),
        }
    }

    fn finish(
        &self,
        status: ExecutionStatus,
        output: Option<DataMap>,
        error: Option<String>,
    ) -> bool {
        let mut state = self.write();
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        state.completed_at = Some(Utc::now());
        if let Some(output) = output {
            state.output = output;
        }
        state.error = error;
        drop(state);
        self.status_tx.send_replace(status);
        true
    }

    fn read(&self) -> RwLockReadGuard<'_, ContextState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ContextState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of tracked runs with time-based eviction.
#[derive(Debug, Default)]
pub struct ContextManager {
    contexts: RwLock<HashMap<ExecutionId, Arc<ExecutionContext>>>,
}

impl ContextManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, context: Arc<ExecutionContext>) {
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(context.id(), context);
    }

    #[must_use]
    pub fn load(&self, execution_id: &ExecutionId) -> Option<Arc<ExecutionContext>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
    }

    /// Removes a context. Returns the removed context, if any.
    pub fn delete(&self, execution_id: &ExecutionId) -> Option<Arc<ExecutionContext>> {
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// All tracked contexts, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<ExecutionContext>> {
        let mut contexts: Vec<_> = self
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        contexts.sort_by_key(|c| (c.created_at(), c.id()));
        contexts
    }

    /// Removes terminal runs that completed more than `retention` ago.
    /// Returns the number of removed runs.
    pub fn cleanup(&self, retention: Duration) -> usize {
        let retention = TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.cleanup_before(cutoff)
    }

    /// Removes terminal runs that completed before `cutoff`.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut contexts = self
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = contexts.len();
        contexts.retain(|_, context| {
            !(context.is_terminal() && context.completed_at().is_some_and(|at| at < cutoff))
        });
        let removed = before - contexts.len();
        if removed > 0 {
            debug!(removed, "evicted finished executions");
        }
        removed
    }
}
