//! Workflow definition types.
//!
//! A workflow definition is created by the embedding service and replaced
//! wholesale on update; each update bumps `version`.

use crate::edge::Edge;
use crate::error::WorkflowError;
use crate::node::{DataMap, NodeDefinition, NodeId};
use chrono::{DateTime, Utc};
use erp_flow_core::WorkflowId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Being edited, not yet published.
    #[default]
    Draft,
    /// Published and executable.
    Active,
    /// Temporarily switched off.
    Inactive,
    /// Retired; can no longer be executed.
    Archived,
}

impl WorkflowStatus {
    /// Returns the status as its storage string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Archived => "archived",
        }
    }

    /// Returns true if runs may be started for a workflow in this status.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        !matches!(self, Self::Archived)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "archived" => Ok(Self::Archived),
            other => Err(WorkflowError::InvalidDefinition {
                reason: format!("unknown workflow status '{other}'"),
            }),
        }
    }
}

/// What the executor does after a node exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Record the failure and keep executing later layers.
    Continue,
    /// Abort the run.
    #[default]
    Stop,
    /// Abort the run, reporting the exhausted retry count.
    Retry,
}

impl ErrorStrategy {
    /// Returns the strategy as its configuration string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Stop => "stop",
            Self::Retry => "retry",
        }
    }
}

impl FromStr for ErrorStrategy {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(Self::Continue),
            "stop" => Ok(Self::Stop),
            "retry" => Ok(Self::Retry),
            other => Err(WorkflowError::InvalidDefinition {
                reason: format!("unknown error strategy '{other}'"),
            }),
        }
    }
}

/// Run-wide settings of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Execution timeout in seconds; engine default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Default attempts for nodes without their own retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Default base retry delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    /// Behavior after a node failure.
    #[serde(default)]
    pub on_error: ErrorStrategy,
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier for this workflow.
    pub id: WorkflowId,
    /// Human-readable name.
    pub name: String,
    /// What this workflow does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Incremented on every update.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Lifecycle status.
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Nodes in declaration order.
    pub nodes: Vec<NodeDefinition>,
    /// Dependencies between nodes.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Global variables seeded into every run.
    #[serde(default)]
    pub variables: DataMap,
    /// Run-wide settings.
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Identity of the creator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// When this workflow was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When this workflow was last updated.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Creates an empty draft workflow with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            description: None,
            version: default_version(),
            status: WorkflowStatus::Draft,
            nodes: Vec::new(),
            edges: Vec::new(),
            variables: DataMap::new(),
            settings: WorkflowSettings::default(),
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the lifecycle status.
    #[must_use]
    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = status;
        self
    }

    /// Appends a node.
    #[must_use]
    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    /// Appends an edge.
    #[must_use]
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Sets a global variable.
    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns a node definition by ID.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| &n.id == node_id)
    }

    /// Checks the shape of the definition without building a graph.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDefinition` if the workflow has no nodes, repeats a
    /// node or edge ID, or has an edge that references an undeclared node.
    pub fn validate_shape(&self) -> Result<(), WorkflowError> {
        let invalid = |reason: String| WorkflowError::InvalidDefinition { reason };

        if self.nodes.is_empty() {
            return Err(invalid("workflow must contain at least one node".to_string()));
        }

        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(&node.id) {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }
            if node.node_type.trim().is_empty() {
                return Err(invalid(format!("node '{}' has no type", node.id)));
            }
        }

        let mut edge_ids = HashSet::new();
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(invalid(format!("duplicate edge id '{}'", edge.id)));
            }
            for endpoint in [&edge.source, &edge.target] {
                if !node_ids.contains(endpoint) {
                    return Err(invalid(format!(
                        "edge '{}' references unknown node '{endpoint}'",
                        edge.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Marks the definition as updated: bumps the version and timestamp.
    pub fn touch(&mut self) {
        self.version = self.version.saturating_add(1);
        self.updated_at = Utc::now();
    }
}

/// Summary information about a workflow (for listings).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow ID.
    pub id: WorkflowId,
    /// Workflow name.
    pub name: String,
    /// Current version.
    pub version: u32,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Number of nodes.
    pub node_count: usize,
    /// Last updated timestamp.
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
    fn from(workflow: &WorkflowDefinition) -> Self {
        Self {
            id: workflow.id,
            name: workflow.name.clone(),
            version: workflow.version,
            status: workflow.status,
            node_count: workflow.nodes.len(),
            updated_at: workflow.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_step() -> WorkflowDefinition {
        WorkflowDefinition::new("Leave approval")
            .with_node(NodeDefinition::new("submit", "noop"))
            .with_node(NodeDefinition::new("approve", "noop"))
            .with_edge(Edge::new("submit", "approve"))
    }

    #[test]
    fn new_definition_is_draft_version_one() {
        let workflow = WorkflowDefinition::new("Overtime");
        assert_eq!(workflow.status, WorkflowStatus::Draft);
        assert_eq!(workflow.version, 1);
        assert_eq!(workflow.settings.on_error, ErrorStrategy::Stop);
    }

    #[test]
    fn validate_shape_accepts_well_formed_definition() {
        assert!(two_step().validate_shape().is_ok());
    }

    #[test]
    fn validate_shape_rejects_empty_definition() {
        let err = WorkflowDefinition::new("Empty").validate_shape().unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidDefinition { .. }));
    }

    #[test]
    fn validate_shape_rejects_duplicate_node() {
        let workflow = two_step().with_node(NodeDefinition::new("submit", "noop"));
        let err = workflow.validate_shape().unwrap_err();
        assert!(err.to_string().contains("duplicate node id 'submit'"));
    }

    #[test]
    fn validate_shape_rejects_dangling_edge() {
        let workflow = two_step().with_edge(Edge::new("approve", "archive"));
        let err = workflow.validate_shape().unwrap_err();
        assert!(err.to_string().contains("unknown node 'archive'"));
    }

    #[test]
    fn touch_bumps_version() {
        let mut workflow = two_step();
        let before = workflow.updated_at;
        workflow.touch();
        assert_eq!(workflow.version, 2);
        assert!(workflow.updated_at >= before);
    }

    #[test]
    fn unknown_error_strategy_is_rejected() {
        assert_eq!("continue".parse::<ErrorStrategy>().ok(), Some(ErrorStrategy::Continue));
        assert!("ignore".parse::<ErrorStrategy>().is_err());

        let settings = serde_json::from_value::<WorkflowSettings>(json!({"on_error": "ignore"}));
        assert!(settings.is_err());
    }

    #[test]
    fn archived_workflows_are_not_executable() {
        assert!(WorkflowStatus::Active.is_executable());
        assert!(WorkflowStatus::Draft.is_executable());
        assert!(!WorkflowStatus::Archived.is_executable());
    }

    #[test]
    fn definition_deserializes_with_defaults() {
        let workflow: WorkflowDefinition = serde_json::from_value(json!({
            "id": ulid_string(),
            "name": "Trip sign-off",
            "nodes": [{"id": "a", "name": "A", "type": "noop"}],
        }))
        .expect("deserialize");

        assert_eq!(workflow.version, 1);
        assert_eq!(workflow.status, WorkflowStatus::Draft);
        assert!(workflow.edges.is_empty());
    }

    #[test]
    fn summary_counts_nodes() {
        let workflow = two_step();
        let summary = WorkflowSummary::from(&workflow);
        assert_eq!(summary.id, workflow.id);
        assert_eq!(summary.node_count, 2);
    }

    fn ulid_string() -> String {
        WorkflowId::new().as_ulid().to_string()
    }
}
