//! PostgreSQL persistence for the erp-flow workflow engine.
//!
//! Three tables back the [`erp_flow_workflow::WorkflowStore`] boundary:
//! `workflow_definitions`, `workflow_executions` and `workflow_node_states`.
//! Composite fields (nodes, edges, inputs, outputs, variables) are JSONB
//! columns, and every write is an upsert on the primary key, or on
//! `(execution_id, node_id)` for node states.

mod postgres;
mod rows;

pub use postgres::PgWorkflowStore;
