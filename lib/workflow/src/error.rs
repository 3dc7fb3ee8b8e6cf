//! Error types for the workflow crate.
//!
//! Errors are layered the same way the engine is:
//! - `GraphError`: structural problems found while building or validating a graph
//! - `RegistryError`: node type lookup and construction failures
//! - `NodeError`: failures reported by a node implementation or a middleware
//! - `ConditionError`: edge condition parse and evaluation failures
//! - `ExecutionError`: run-level failures produced by the executor
//! - `StoreError`: persistence boundary failures
//! - `WorkflowError`: the engine API error, wrapping the lower layers
//!
//! The engine API returns `WorkflowError` inside a rootcause `Report`; match on
//! `report.current_context()` to branch on the failure kind.

use crate::context::ExecutionStatus;
use crate::node::NodeId;
use erp_flow_core::{ExecutionId, WorkflowId};
use std::fmt;

/// Errors from graph construction and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Node with the given ID was not found in the graph.
    NodeNotFound { node_id: NodeId },
    /// A node with the same ID was already added.
    DuplicateNode { node_id: NodeId },
    /// Edge references a missing node or duplicates an existing edge.
    InvalidEdge {
        source: NodeId,
        target: NodeId,
        reason: String,
    },
    /// Graph contains a directed cycle through the given node.
    CyclicDependency { node_id: NodeId },
    /// Graph has no nodes.
    EmptyGraph,
    /// No node without incoming edges exists to start execution from.
    MissingTriggerNode,
    /// Some nodes cannot be reached from any start node.
    DisconnectedGraph { unreachable: Vec<NodeId> },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => write!(f, "node not found: {node_id}"),
            Self::DuplicateNode { node_id } => write!(f, "duplicate node: {node_id}"),
            Self::InvalidEdge {
                source,
                target,
                reason,
            } => write!(f, "invalid edge {source} -> {target}: {reason}"),
            Self::CyclicDependency { node_id } => {
                write!(f, "cyclic dependency detected at node {node_id}")
            }
            Self::EmptyGraph => write!(f, "graph has no nodes"),
            Self::MissingTriggerNode => write!(f, "graph has no start node"),
            Self::DisconnectedGraph { unreachable } => {
                let ids: Vec<_> = unreachable.iter().map(NodeId::as_str).collect();
                write!(f, "unreachable nodes: {}", ids.join(", "))
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from the node registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A factory is already registered under this type name.
    TypeAlreadyRegistered { node_type: String },
    /// No factory is registered under this type name.
    TypeNotRegistered { node_type: String },
    /// The factory or the node's own validation rejected the configuration.
    InvalidNodeConfig { node_id: NodeId, reason: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeAlreadyRegistered { node_type } => {
                write!(f, "node type already registered: {node_type}")
            }
            Self::TypeNotRegistered { node_type } => {
                write!(f, "node type not registered: {node_type}")
            }
            Self::InvalidNodeConfig { node_id, reason } => {
                write!(f, "invalid config for node {node_id}: {reason}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Errors produced while executing a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Node logic failed.
    Failed { message: String },
    /// Input rejected before execution.
    InvalidInput { message: String },
    /// Output rejected after execution.
    InvalidOutput { message: String },
    /// Node configuration is invalid.
    InvalidConfig { message: String },
    /// Node did not finish within its deadline.
    Timeout { timeout_ms: u64 },
    /// Execution was interrupted by run cancellation.
    Cancelled,
    /// Node panicked; the panic was converted into an error.
    Panicked { message: String },
}

impl NodeError {
    /// Shorthand for a generic failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Shorthand for a configuration failure.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { message } => write!(f, "{message}"),
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::InvalidOutput { message } => write!(f, "invalid output: {message}"),
            Self::InvalidConfig { message } => write!(f, "invalid config: {message}"),
            Self::Timeout { timeout_ms } => write!(f, "timed out after {timeout_ms}ms"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Panicked { message } => write!(f, "panicked: {message}"),
        }
    }
}

impl std::error::Error for NodeError {}

/// Errors from parsing or evaluating an edge condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// Expression could not be parsed.
    Parse { expression: String, reason: String },
    /// Operands have types the operator does not support.
    Type { expression: String, reason: String },
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { expression, reason } => {
                write!(f, "cannot parse condition '{expression}': {reason}")
            }
            Self::Type { expression, reason } => {
                write!(f, "cannot evaluate condition '{expression}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConditionError {}

/// Run-level errors produced by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Graph construction or validation failed; no node was executed.
    InvalidGraph(GraphError),
    /// A node could not be instantiated from its definition.
    Registry(RegistryError),
    /// An edge condition is malformed.
    InvalidCondition {
        edge_id: String,
        error: ConditionError,
    },
    /// The run exceeded its execution timeout.
    ExecutionTimeout,
    /// The run was cancelled.
    ExecutionCancelled,
    /// A node failed and the workflow's error strategy is `stop`.
    NodeExecutionFailed { node_id: NodeId, message: String },
    /// A node failed after exhausting its retries and the strategy is `retry`.
    RetriesExhausted {
        node_id: NodeId,
        attempts: u32,
        message: String,
    },
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidGraph(e) => write!(f, "invalid graph: {e}"),
            Self::Registry(e) => write!(f, "node construction failed: {e}"),
            Self::InvalidCondition { edge_id, error } => {
                write!(f, "invalid condition on edge {edge_id}: {error}")
            }
            Self::ExecutionTimeout => write!(f, "execution timed out"),
            Self::ExecutionCancelled => write!(f, "execution cancelled"),
            Self::NodeExecutionFailed { node_id, message } => {
                write!(f, "node {node_id} failed: {message}")
            }
            Self::RetriesExhausted {
                node_id,
                attempts,
                message,
            } => write!(
                f,
                "node {node_id} failed after {attempts} attempts: {message}"
            ),
        }
    }
}

impl std::error::Error for ExecutionError {}

impl From<GraphError> for ExecutionError {
    fn from(e: GraphError) -> Self {
        Self::InvalidGraph(e)
    }
}

impl From<RegistryError> for ExecutionError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

/// Errors from the persistence boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A backend operation failed.
    Failed { operation: String, details: String },
    /// A stored value could not be encoded or decoded.
    Serialization { details: String },
}

impl StoreError {
    /// Creates a backend failure for the named operation.
    pub fn failed(operation: impl Into<String>, details: impl fmt::Display) -> Self {
        Self::Failed {
            operation: operation.into(),
            details: details.to_string(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { operation, details } => {
                write!(f, "persistence failed during {operation}: {details}")
            }
            Self::Serialization { details } => {
                write!(f, "persistence serialization failed: {details}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            details: e.to_string(),
        }
    }
}

/// Engine API errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// Workflow not found.
    NotFound { workflow_id: WorkflowId },
    /// A workflow with this ID already exists.
    AlreadyExists { workflow_id: WorkflowId },
    /// Workflow lifecycle status does not allow the operation.
    InvalidState {
        workflow_id: WorkflowId,
        status: String,
    },
    /// Workflow definition is malformed.
    InvalidDefinition { reason: String },
    /// Execution not found.
    ExecutionNotFound { execution_id: ExecutionId },
    /// Execution already reached a terminal status.
    ExecutionAlreadyDone {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
    /// Engine configuration is invalid.
    Configuration { reason: String },
    /// Graph-level failure.
    Graph(GraphError),
    /// Registry failure.
    Registry(RegistryError),
    /// Run failure.
    Execution(ExecutionError),
    /// Persistence failure.
    Persistence(StoreError),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { workflow_id } => write!(f, "workflow not found: {workflow_id}"),
            Self::AlreadyExists { workflow_id } => {
                write!(f, "workflow already exists: {workflow_id}")
            }
            Self::InvalidState {
                workflow_id,
                status,
            } => write!(f, "workflow {workflow_id} is {status}"),
            Self::InvalidDefinition { reason } => {
                write!(f, "invalid workflow definition: {reason}")
            }
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "execution not found: {execution_id}")
            }
            Self::ExecutionAlreadyDone {
                execution_id,
                status,
            } => write!(f, "execution {execution_id} already {status}"),
            Self::Configuration { reason } => write!(f, "invalid configuration: {reason}"),
            Self::Graph(e) => write!(f, "{e}"),
            Self::Registry(e) => write!(f, "{e}"),
            Self::Execution(e) => write!(f, "{e}"),
            Self::Persistence(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<GraphError> for WorkflowError {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}

impl From<RegistryError> for WorkflowError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl From<ExecutionError> for WorkflowError {
    fn from(e: ExecutionError) -> Self {
        Self::Execution(e)
    }
}

impl From<StoreError> for WorkflowError {
    fn from(e: StoreError) -> Self {
        Self::Persistence(e)
    }
}
