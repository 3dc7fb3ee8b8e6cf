//! Command-line runner for erp-flow workflows.
//!
//! Loads a JSON workflow definition, runs it once on an engine built from the
//! environment and returns the final snapshot.

pub mod config;
pub mod error;

pub use crate::config::RunnerConfig;
pub use error::RunnerError;

use erp_flow_store::PgWorkflowStore;
use erp_flow_workflow::{
    EngineConfig, ExecutionSnapshot, PersistenceBackend, WorkflowDefinition, WorkflowEngine,
    WorkflowError,
};
use rootcause::Report;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn engine_error(report: &Report<WorkflowError>) -> RunnerError {
    RunnerError::Engine {
        details: report.current_context().to_string(),
    }
}

/// Reads a workflow definition from a JSON file.
///
/// # Errors
///
/// Returns `Definition` if the file cannot be read or is not a valid
/// definition.
pub fn load_definition(path: &Path) -> Result<WorkflowDefinition, RunnerError> {
    let definition_error = |details: String| RunnerError::Definition {
        path: path.to_path_buf(),
        details,
    };
    let text = std::fs::read_to_string(path).map_err(|e| definition_error(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| definition_error(e.to_string()))
}

/// Builds an engine with the store selected by the persistence settings.
/// The postgres store is connected and migrated first.
///
/// # Errors
///
/// Returns `Store` if the database is unreachable, or `Engine` if the
/// configuration is rejected.
pub async fn build_engine(config: &EngineConfig) -> Result<WorkflowEngine, Report<RunnerError>> {
    let mut builder = WorkflowEngine::builder(config.clone());

    if config.persistence.effective_backend() == PersistenceBackend::Postgres {
        let url = config.persistence.database_url.as_deref().ok_or_else(|| {
            RunnerError::Configuration {
                details: "persistence.database_url is required for the postgres backend"
                    .to_string(),
            }
        })?;
        let store = PgWorkflowStore::connect(url, config.persistence.max_connections)
            .await
            .map_err(|e| RunnerError::Store {
                details: e.to_string(),
            })?;
        info!("running database migrations");
        store.migrate().await.map_err(|e| RunnerError::Store {
            details: e.to_string(),
        })?;
        builder = builder.store(Arc::new(store));
    }

    Ok(builder.build().map_err(|report| engine_error(&report))?)
}

/// Runs the configured definition once and returns its final snapshot.
///
/// # Errors
///
/// Returns an error if the definition, input, store or engine setup fails.
/// A failed run is not an error; see the snapshot's status.
pub async fn run(config: &RunnerConfig) -> Result<ExecutionSnapshot, Report<RunnerError>> {
    let definition = load_definition(&config.definition_path)?;
    let input = config.parse_input()?;
    let engine = build_engine(&config.engine).await?;

    info!(
        workflow = %definition.name,
        nodes = definition.nodes.len(),
        path = %config.definition_path.display(),
        "loaded workflow definition"
    );
    let workflow_id = engine
        .create_workflow(definition)
        .await
        .map_err(|report| engine_error(&report))?;
    let snapshot = engine
        .execute_and_wait(workflow_id, input, Some("erp-flow-runner".to_string()))
        .await
        .map_err(|report| engine_error(&report))?;

    info!(
        execution_id = %snapshot.id,
        status = %snapshot.status,
        "workflow run finished"
    );
    Ok(snapshot)
}
