//! Workflow engine for erp-flow approval processes.
//!
//! A workflow is a DAG of typed nodes. The engine validates the graph, splits
//! it into topological layers and runs each layer's nodes concurrently, with
//! per-node retry, timeout and a middleware chain around every node call.
//!
//! - **Definitions**: [`WorkflowDefinition`], [`NodeDefinition`], [`Edge`]
//! - **Node contract**: [`Node`] implementations created by a [`NodeRegistry`]
//! - **Graph**: cycle detection, reachability and layering in [`ExecutionGraph`]
//! - **Conditions**: a small boolean grammar gating edges, see [`condition`]
//! - **Execution**: [`Executor`] plus the [`ExecutionContext`] of each run
//! - **Persistence**: the [`WorkflowStore`] boundary, with no-op and in-memory
//!   implementations here and a PostgreSQL one in `erp-flow-store`
//! - **Facade**: [`WorkflowEngine`], configured by [`EngineConfig`]

pub mod builtin;
pub mod condition;
pub mod config;
pub mod context;
pub mod definition;
pub mod edge;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod middleware;
pub mod node;
pub mod registry;
pub mod store;

pub use condition::{ConditionEvaluator, ConditionScope, ExpressionEvaluator};
pub use crate::config::{EngineConfig, PersistenceBackend};
pub use context::{
    ContextManager, ExecutionContext, ExecutionSnapshot, ExecutionStatus, NodeState, NodeStatus,
};
pub use definition::{
    ErrorStrategy, WorkflowDefinition, WorkflowSettings, WorkflowStatus, WorkflowSummary,
};
pub use edge::Edge;
pub use engine::{CleanupSummary, EngineBuilder, WorkflowEngine};
pub use error::{
    ConditionError, ExecutionError, GraphError, NodeError, RegistryError, StoreError,
    WorkflowError,
};
pub use executor::{Executor, ExecutorDefaults};
pub use graph::ExecutionGraph;
pub use middleware::{Middleware, MiddlewareChain, NodeFn, NodeInvocation};
pub use node::{DataMap, Node, NodeDefinition, NodeFactory, NodeId, RetryPolicy};
pub use registry::NodeRegistry;
pub use store::{
    ExecutionFilter, ExecutionRecord, ExecutionStatistics, MemoryStore, NoopStore,
    WorkflowFilter, WorkflowStore,
};
