//! Persistence boundary.
//!
//! The store is a write-behind mirror of engine state: definitions are
//! written on every change, executions when a run is registered, starts and
//! ends, node states as each node finishes. In-flight runs are always read from memory first.

use crate::context::{ExecutionSnapshot, ExecutionStatus, NodeState};
use crate::definition::{WorkflowDefinition, WorkflowStatus};
use crate::error::StoreError;
use crate::node::{DataMap, NodeId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use erp_flow_core::{ExecutionId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

/// Stored form of a run, without its node states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub input: DataMap,
    pub output: DataMap,
    pub variables: DataMap,
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: DataMap,
}

impl ExecutionRecord {
    /// Duration in milliseconds, for finished runs.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        Some((self.completed_at? - self.started_at?).num_milliseconds())
    }

    /// Rebuilds a snapshot from the record and its node states.
    #[must_use]
    pub fn into_snapshot(self, node_states: Vec<NodeState>) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id: self.id,
            workflow_id: self.workflow_id,
            status: self.status,
            input: self.input,
            output: self.output,
            variables: self.variables,
            node_states: node_states
                .into_iter()
                .map(|s| (s.node_id.clone(), s))
                .collect(),
            triggered_by: self.triggered_by,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error,
            metadata: self.metadata,
            persistence_errors: 0,
        }
    }
}

impl From<&ExecutionSnapshot> for ExecutionRecord {
    fn from(snapshot: &ExecutionSnapshot) -> Self {
        Self {
            id: snapshot.id,
            workflow_id: snapshot.workflow_id,
            status: snapshot.status,
            input: snapshot.input.clone(),
            output: snapshot.output.clone(),
            variables: snapshot.variables.clone(),
            triggered_by: snapshot.triggered_by.clone(),
            created_at: snapshot.created_at,
            started_at: snapshot.started_at,
            completed_at: snapshot.completed_at,
            error: snapshot.error.clone(),
            metadata: snapshot.metadata.clone(),
        }
    }
}

/// Filter for listing workflow definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    /// Case-insensitive substring of the name.
    pub name_contains: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl WorkflowFilter {
    #[must_use]
    pub fn matches(&self, workflow: &WorkflowDefinition) -> bool {
        self.status.is_none_or(|s| workflow.status == s)
            && self.name_contains.as_deref().is_none_or(|needle| {
                workflow
                    .name
                    .to_lowercase()
                    .contains(&needle.to_lowercase())
            })
    }
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
    pub workflow_id: Option<WorkflowId>,
    pub status: Option<ExecutionStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ExecutionFilter {
    #[must_use]
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.workflow_id.is_none_or(|id| record.workflow_id == id)
            && self.status.is_none_or(|s| record.status == s)
            && self.created_after.is_none_or(|t| record.created_at >= t)
            && self.created_before.is_none_or(|t| record.created_at < t)
    }
}

/// Aggregate counts over stored executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    /// Pending or running.
    pub running: u64,
    /// Mean duration of finished runs, in milliseconds.
    pub average_duration_ms: Option<f64>,
}

impl ExecutionStatistics {
    /// Computes statistics over records.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ExecutionRecord>) -> Self {
        let mut stats = Self::default();
        let mut duration_total = 0i64;
        let mut duration_count = 0i64;

        for record in records {
            stats.total += 1;
            match record.status {
                ExecutionStatus::Completed => stats.completed += 1,
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Cancelled => stats.cancelled += 1,
                ExecutionStatus::Timeout => stats.timed_out += 1,
                ExecutionStatus::Pending | ExecutionStatus::Running => stats.running += 1,
            }
            if let Some(ms) = record.duration_ms() {
                duration_total += ms;
                duration_count += 1;
            }
        }

        if duration_count > 0 {
            stats.average_duration_ms = Some(duration_total as f64 / duration_count as f64);
        }
        stats
    }
}

/// Durable storage for definitions, executions and node states.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Inserts or replaces a definition.
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Deletes a definition. Returns true if it existed.
    async fn delete_workflow(&self, id: WorkflowId) -> Result<bool, StoreError>;

    /// Definitions matching the filter, most recently updated first.
    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// Inserts or replaces an execution.
    async fn save_execution(&self, execution: &ExecutionRecord) -> Result<(), StoreError>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Deletes an execution and its node states. Returns true if it existed.
    async fn delete_execution(&self, id: ExecutionId) -> Result<bool, StoreError>;

    /// Executions matching the filter, newest first.
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Inserts or replaces the state of one node in one execution.
    async fn save_node_state(
        &self,
        execution_id: ExecutionId,
        state: &NodeState,
    ) -> Result<(), StoreError>;

    async fn get_node_state(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
    ) -> Result<Option<NodeState>, StoreError>;

    /// Node states of an execution, ordered by node ID.
    async fn list_node_states(&self, execution_id: ExecutionId)
    -> Result<Vec<NodeState>, StoreError>;

    /// Statistics over all executions, or those of one workflow.
    async fn statistics(
        &self,
        workflow_id: Option<WorkflowId>,
    ) -> Result<ExecutionStatistics, StoreError>;

    /// Executions of a workflow created in `[from, to)`, oldest first.
    async fn execution_history(
        &self,
        workflow_id: WorkflowId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Deletes finished executions completed before `before`. Returns the
    /// number of deleted executions.
    async fn cleanup_executions(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Store that keeps nothing. Writes succeed, reads find nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

#[async_trait]
impl WorkflowStore for NoopStore {
    async fn save_workflow(&self, _workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_workflow(&self, _id: WorkflowId) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(None)
    }

    async fn delete_workflow(&self, _id: WorkflowId) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn list_workflows(
        &self,
        _filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        Ok(Vec::new())
    }

    async fn save_execution(&self, _execution: &ExecutionRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_execution(&self, _id: ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(None)
    }

    async fn delete_execution(&self, _id: ExecutionId) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn list_executions(
        &self,
        _filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn save_node_state(
        &self,
        _execution_id: ExecutionId,
        _state: &NodeState,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_node_state(
        &self,
        _execution_id: ExecutionId,
        _node_id: &NodeId,
    ) -> Result<Option<NodeState>, StoreError> {
        Ok(None)
    }

    async fn list_node_states(
        &self,
        _execution_id: ExecutionId,
    ) -> Result<Vec<NodeState>, StoreError> {
        Ok(Vec::new())
    }

    async fn statistics(
        &self,
        _workflow_id: Option<WorkflowId>,
    ) -> Result<ExecutionStatistics, StoreError> {
        Ok(ExecutionStatistics::default())
    }

    async fn execution_history(
        &self,
        _workflow_id: WorkflowId,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn cleanup_executions(&self, _before: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(0)
    }
}

/// In-memory store with the full semantics of the trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<WorkflowId, WorkflowDefinition>>,
    executions: RwLock<HashMap<ExecutionId, ExecutionRecord>>,
    node_states: RwLock<HashMap<ExecutionId, BTreeMap<NodeId, NodeState>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T>(items: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    items
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        self.workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    async fn delete_workflow(&self, id: WorkflowId) -> Result<bool, StoreError> {
        Ok(self
            .workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some())
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut workflows: Vec<_> = self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        workflows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(page(workflows, filter.offset, filter.limit))
    }

    async fn save_execution(&self, execution: &ExecutionRecord) -> Result<(), StoreError> {
        self.executions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self
            .executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    async fn delete_execution(&self, id: ExecutionId) -> Result<bool, StoreError> {
        self.node_states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(self
            .executions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut records: Vec<_> = self
            .executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page(records, filter.offset, filter.limit))
    }

    async fn save_node_state(
        &self,
        execution_id: ExecutionId,
        state: &NodeState,
    ) -> Result<(), StoreError> {
        self.node_states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(execution_id)
            .or_default()
            .insert(state.node_id.clone(), state.clone());
        Ok(())
    }

    async fn get_node_state(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
    ) -> Result<Option<NodeState>, StoreError> {
        Ok(self
            .node_states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&execution_id)
            .and_then(|states| states.get(node_id))
            .cloned())
    }

    async fn list_node_states(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<NodeState>, StoreError> {
        Ok(self
            .node_states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&execution_id)
            .map(|states| states.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn statistics(
        &self,
        workflow_id: Option<WorkflowId>,
    ) -> Result<ExecutionStatistics, StoreError> {
        let executions = self
            .executions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(ExecutionStatistics::from_records(
            executions
                .values()
                .filter(|r| workflow_id.is_none_or(|id| r.workflow_id == id)),
        ))
    }

    async fn execution_history(
        &self,
        workflow_id: WorkflowId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut records: Vec<_> = self
            .executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.workflow_id == workflow_id && r.created_at >= from && r.created_at < to)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn cleanup_executions(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut executions = self
            .executions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<ExecutionId> = executions
            .values()
            .filter(|r| r.status.is_terminal() && r.completed_at.is_some_and(|at| at < before))
            .map(|r| r.id)
            .collect();

        let mut node_states = self
            .node_states
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for id in &expired {
            executions.remove(id);
            node_states.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NodeStatus;
    use crate::node::NodeDefinition;
    use chrono::TimeDelta;
    use serde_json::json;

    fn record(workflow_id: WorkflowId, status: ExecutionStatus, age: TimeDelta) -> ExecutionRecord {
        let created_at = Utc::now() - age;
        let terminal = status.is_terminal();
        ExecutionRecord {
            id: ExecutionId::new(),
            workflow_id,
            status,
            input: DataMap::new(),
            output: DataMap::new(),
            variables: DataMap::new(),
            triggered_by: None,
            created_at,
            started_at: Some(created_at),
            completed_at: terminal.then(|| created_at + TimeDelta::milliseconds(200)),
            error: None,
            metadata: DataMap::new(),
        }
    }

    #[tokio::test]
    async fn noop_store_accepts_writes_and_finds_nothing() {
        let store = NoopStore;
        let workflow = WorkflowDefinition::new("leave").with_node(NodeDefinition::new("a", "noop"));
        store.save_workflow(&workflow).await.expect("save");
        assert!(store.get_workflow(workflow.id).await.expect("get").is_none());
        assert_eq!(store.cleanup_executions(Utc::now()).await.expect("cleanup"), 0);
    }

    #[tokio::test]
    async fn memory_store_workflow_crud_and_filter() {
        let store = MemoryStore::new();
        let leave = WorkflowDefinition::new("Leave approval")
            .with_status(WorkflowStatus::Active)
            .with_node(NodeDefinition::new("a", "noop"));
        let overtime = WorkflowDefinition::new("Overtime approval")
            .with_node(NodeDefinition::new("a", "noop"));

        store.save_workflow(&leave).await.expect("save");
        store.save_workflow(&overtime).await.expect("save");

        let active = store
            .list_workflows(&WorkflowFilter {
                status: Some(WorkflowStatus::Active),
                ..WorkflowFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, leave.id);

        let named = store
            .list_workflows(&WorkflowFilter {
                name_contains: Some("OVERTIME".to_string()),
                ..WorkflowFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(named.len(), 1);

        let limited = store
            .list_workflows(&WorkflowFilter {
                limit: Some(1),
                ..WorkflowFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(limited.len(), 1);

        assert!(store.delete_workflow(leave.id).await.expect("delete"));
        assert!(!store.delete_workflow(leave.id).await.expect("delete"));
        assert!(store.get_workflow(leave.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn memory_store_node_states_upsert() {
        let store = MemoryStore::new();
        let execution_id = ExecutionId::new();

        let mut state = NodeState::new(NodeId::new("approve"));
        state.start(DataMap::new());
        store.save_node_state(execution_id, &state).await.expect("save");

        let mut output = DataMap::new();
        output.insert("approved".to_string(), json!(true));
        state.complete(output);
        store.save_node_state(execution_id, &state).await.expect("save");
        store
            .save_node_state(execution_id, &NodeState::new(NodeId::new("notify")))
            .await
            .expect("save");

        let stored = store
            .get_node_state(execution_id, &NodeId::new("approve"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, NodeStatus::Completed);

        let all = store.list_node_states(execution_id).await.expect("list");
        let ids: Vec<_> = all.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, vec!["approve", "notify"]);
    }

    #[tokio::test]
    async fn statistics_history_and_cleanup() {
        let store = MemoryStore::new();
        let workflow_id = WorkflowId::new();
        let other = WorkflowId::new();

        let old = record(workflow_id, ExecutionStatus::Completed, TimeDelta::days(2));
        let failed = record(workflow_id, ExecutionStatus::Failed, TimeDelta::hours(1));
        let running = record(workflow_id, ExecutionStatus::Running, TimeDelta::days(3));
        let foreign = record(other, ExecutionStatus::Timeout, TimeDelta::minutes(5));
        for r in [&old, &failed, &running, &foreign] {
            store.save_execution(r).await.expect("save");
        }
        store
            .save_node_state(old.id, &NodeState::new(NodeId::new("a")))
            .await
            .expect("save");

        let stats = store.statistics(Some(workflow_id)).await.expect("stats");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.average_duration_ms, Some(200.0));

        let all = store.statistics(None).await.expect("stats");
        assert_eq!(all.total, 4);
        assert_eq!(all.timed_out, 1);

        let history = store
            .execution_history(workflow_id, Utc::now() - TimeDelta::days(4), Utc::now())
            .await
            .expect("history");
        let ids: Vec<_> = history.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![running.id, old.id, failed.id]);

        let by_status = store
            .list_executions(&ExecutionFilter {
                status: Some(ExecutionStatus::Failed),
                ..ExecutionFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(by_status.len(), 1);

        // Only the finished run older than a day goes; the stale running one stays.
        let removed = store
            .cleanup_executions(Utc::now() - TimeDelta::days(1))
            .await
            .expect("cleanup");
        assert_eq!(removed, 1);
        assert!(store.get_execution(old.id).await.expect("get").is_none());
        assert!(store.get_execution(running.id).await.expect("get").is_some());
        assert!(store.list_node_states(old.id).await.expect("list").is_empty());
    }

    #[test]
    fn record_round_trips_through_snapshot() {
        let r = record(WorkflowId::new(), ExecutionStatus::Completed, TimeDelta::zero());
        let snapshot = r.clone().into_snapshot(vec![NodeState::new(NodeId::new("a"))]);
        assert_eq!(snapshot.node_states.len(), 1);
        assert_eq!(ExecutionRecord::from(&snapshot), r);
    }
}
