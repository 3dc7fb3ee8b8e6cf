//! Row types and their conversions to engine types.

use chrono::{DateTime, Utc};
use erp_flow_core::{ExecutionId, WorkflowId};
use erp_flow_workflow::{
    DataMap, ExecutionRecord, ExecutionStatus, NodeId, NodeState, NodeStatus, StoreError,
    WorkflowDefinition, WorkflowStatus,
};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use std::str::FromStr;

fn decode_error(what: &str, value: &str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization {
        details: format!("invalid {what} '{value}': {reason}"),
    }
}

fn object(value: JsonValue) -> Result<DataMap, StoreError> {
    match value {
        JsonValue::Object(map) => Ok(map),
        JsonValue::Null => Ok(DataMap::new()),
        other => Err(decode_error("object", &other.to_string(), "not a JSON object")),
    }
}

/// Row of `workflow_definitions`.
#[derive(Debug, FromRow)]
pub(crate) struct WorkflowRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: i32,
    pub status: String,
    pub nodes: JsonValue,
    pub edges: JsonValue,
    pub variables: JsonValue,
    pub settings: JsonValue,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    pub fn from_definition(definition: &WorkflowDefinition) -> Result<Self, StoreError> {
        Ok(Self {
            id: definition.id.to_string(),
            name: definition.name.clone(),
            description: definition.description.clone(),
            version: i32::try_from(definition.version).unwrap_or(i32::MAX),
            status: definition.status.as_str().to_string(),
            nodes: serde_json::to_value(&definition.nodes)?,
            edges: serde_json::to_value(&definition.edges)?,
            variables: JsonValue::Object(definition.variables.clone()),
            settings: serde_json::to_value(&definition.settings)?,
            created_by: definition.created_by.clone(),
            created_at: definition.created_at,
            updated_at: definition.updated_at,
        })
    }

    pub fn try_into_definition(self) -> Result<WorkflowDefinition, StoreError> {
        let id = WorkflowId::from_str(&self.id).map_err(|e| decode_error("workflow id", &self.id, e))?;
        let status = WorkflowStatus::from_str(&self.status)
            .map_err(|e| decode_error("workflow status", &self.status, e))?;

        Ok(WorkflowDefinition {
            id,
            name: self.name,
            description: self.description,
            version: u32::try_from(self.version).unwrap_or_default(),
            status,
            nodes: serde_json::from_value(self.nodes)?,
            edges: serde_json::from_value(self.edges)?,
            variables: object(self.variables)?,
            settings: serde_json::from_value(self.settings)?,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row of `workflow_executions`.
#[derive(Debug, FromRow)]
pub(crate) struct ExecutionRow {
    pub id: String,
    pub workflow_id: String,
    pub status: String,
    pub input: JsonValue,
    pub output: JsonValue,
    pub variables: JsonValue,
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: JsonValue,
}

impl ExecutionRow {
    pub fn from_record(record: &ExecutionRecord) -> Self {
        Self {
            id: record.id.to_string(),
            workflow_id: record.workflow_id.to_string(),
            status: record.status.as_str().to_string(),
            input: JsonValue::Object(record.input.clone()),
            output: JsonValue::Object(record.output.clone()),
            variables: JsonValue::Object(record.variables.clone()),
            triggered_by: record.triggered_by.clone(),
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            error: record.error.clone(),
            metadata: JsonValue::Object(record.metadata.clone()),
        }
    }

    pub fn try_into_record(self) -> Result<ExecutionRecord, StoreError> {
        Ok(ExecutionRecord {
            id: ExecutionId::from_str(&self.id)
                .map_err(|e| decode_error("execution id", &self.id, e))?,
            workflow_id: WorkflowId::from_str(&self.workflow_id)
                .map_err(|e| decode_error("workflow id", &self.workflow_id, e))?,
            status: ExecutionStatus::from_str(&self.status)
                .map_err(|e| decode_error("execution status", &self.status, e))?,
            input: object(self.input)?,
            output: object(self.output)?,
            variables: object(self.variables)?,
            triggered_by: self.triggered_by,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error,
            metadata: object(self.metadata)?,
        })
    }
}

/// Row of `workflow_node_states`, without the surrogate key.
#[derive(Debug, FromRow)]
pub(crate) struct NodeStateRow {
    pub execution_id: String,
    pub node_id: String,
    pub status: String,
    pub input: JsonValue,
    pub output: JsonValue,
    pub error: Option<String>,
    pub attempts: i32,
    pub attempt_durations_ms: JsonValue,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeStateRow {
    pub fn from_state(execution_id: ExecutionId, state: &NodeState) -> Result<Self, StoreError> {
        Ok(Self {
            execution_id: execution_id.to_string(),
            node_id: state.node_id.to_string(),
            status: state.status.as_str().to_string(),
            input: JsonValue::Object(state.input.clone()),
            output: JsonValue::Object(state.output.clone()),
            error: state.error.clone(),
            attempts: i32::try_from(state.attempts).unwrap_or(i32::MAX),
            attempt_durations_ms: serde_json::to_value(&state.attempt_durations_ms)?,
            started_at: state.started_at,
            completed_at: state.completed_at,
        })
    }

    pub fn try_into_state(self) -> Result<NodeState, StoreError> {
        Ok(NodeState {
            node_id: NodeId::new(self.node_id),
            status: NodeStatus::from_str(&self.status)
                .map_err(|e| decode_error("node status", &self.status, e))?,
            input: object(self.input)?,
            output: object(self.output)?,
            error: self.error,
            attempts: u32::try_from(self.attempts).unwrap_or_default(),
            attempt_durations_ms: serde_json::from_value(self.attempt_durations_ms)?,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}
