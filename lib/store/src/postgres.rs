//! `WorkflowStore` on PostgreSQL.

use crate::rows::{ExecutionRow, NodeStateRow, WorkflowRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use erp_flow_core::{ExecutionId, WorkflowId};
use erp_flow_workflow::{
    ExecutionFilter, ExecutionRecord, ExecutionStatistics, ExecutionStatus, NodeId, NodeState,
    StoreError, WorkflowDefinition, WorkflowFilter, WorkflowStore,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::{debug, instrument};

const WORKFLOW_COLUMNS: &str = "id, name, description, version, status, nodes, edges, variables, \
     settings, created_by, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, workflow_id, status, input, output, variables, triggered_by, \
     created_at, started_at, completed_at, error, metadata";

const NODE_STATE_COLUMNS: &str = "execution_id, node_id, status, input, output, error, attempts, \
     attempt_durations_ms, started_at, completed_at";

const TERMINAL_STATUSES: [ExecutionStatus; 4] = [
    ExecutionStatus::Completed,
    ExecutionStatus::Failed,
    ExecutionStatus::Cancelled,
    ExecutionStatus::Timeout,
];

fn failed(operation: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::failed(operation, e)
}

fn page_bounds(limit: Option<usize>, offset: usize) -> (i64, i64) {
    let limit = limit.map_or(i64::MAX, |l| i64::try_from(l).unwrap_or(i64::MAX));
    (limit, i64::try_from(offset).unwrap_or(i64::MAX))
}

#[derive(FromRow)]
struct StatisticsRow {
    total: i64,
    completed: i64,
    failed: i64,
    cancelled: i64,
    timed_out: i64,
    running: i64,
    average_duration_ms: Option<f64>,
}

impl From<StatisticsRow> for ExecutionStatistics {
    fn from(row: StatisticsRow) -> Self {
        let count = |n: i64| u64::try_from(n).unwrap_or_default();
        Self {
            total: count(row.total),
            completed: count(row.completed),
            failed: count(row.failed),
            cancelled: count(row.cancelled),
            timed_out: count(row.timed_out),
            running: count(row.running),
            average_duration_ms: row.average_duration_ms,
        }
    }
}

/// Store backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be established.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(failed("connect"))?;
        Ok(Self::new(pool))
    }

    /// Applies the embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::failed("migrate", e))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    #[instrument(skip_all, fields(workflow_id = %workflow.id))]
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        let row = WorkflowRow::from_definition(workflow)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions
                (id, name, description, version, status, nodes, edges, variables, settings,
                 created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                version = EXCLUDED.version,
                status = EXCLUDED.status,
                nodes = EXCLUDED.nodes,
                edges = EXCLUDED.edges,
                variables = EXCLUDED.variables,
                settings = EXCLUDED.settings,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(row.id)
        .bind(row.name)
        .bind(row.description)
        .bind(row.version)
        .bind(row.status)
        .bind(row.nodes)
        .bind(row.edges)
        .bind(row.variables)
        .bind(row.settings)
        .bind(row.created_by)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(failed("save_workflow"))?;

        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row: Option<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflow_definitions WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(failed("get_workflow"))?;

        row.map(WorkflowRow::try_into_definition).transpose()
    }

    #[instrument(skip(self))]
    async fn delete_workflow(&self, id: WorkflowId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM workflow_definitions WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(failed("delete_workflow"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut query: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflow_definitions WHERE TRUE"
        ));
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(needle) = &filter.name_contains {
            query
                .push(" AND name ILIKE '%' || ")
                .push_bind(needle.clone())
                .push(" || '%'");
        }
        let (limit, offset) = page_bounds(filter.limit, filter.offset);
        query
            .push(" ORDER BY updated_at DESC, id LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows: Vec<WorkflowRow> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(failed("list_workflows"))?;
        rows.into_iter().map(WorkflowRow::try_into_definition).collect()
    }

    #[instrument(skip_all, fields(execution_id = %execution.id, status = %execution.status))]
    async fn save_execution(&self, execution: &ExecutionRecord) -> Result<(), StoreError> {
        let row = ExecutionRow::from_record(execution);
        sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (id, workflow_id, status, input, output, variables, triggered_by,
                 created_at, started_at, completed_at, error, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                output = EXCLUDED.output,
                variables = EXCLUDED.variables,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                error = EXCLUDED.error,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(row.id)
        .bind(row.workflow_id)
        .bind(row.status)
        .bind(row.input)
        .bind(row.output)
        .bind(row.variables)
        .bind(row.triggered_by)
        .bind(row.created_at)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(row.error)
        .bind(row.metadata)
        .execute(&self.pool)
        .await
        .map_err(failed("save_execution"))?;

        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(failed("get_execution"))?;

        row.map(ExecutionRow::try_into_record).transpose()
    }

    #[instrument(skip(self))]
    async fn delete_execution(&self, id: ExecutionId) -> Result<bool, StoreError> {
        // Node states go with it through the cascading foreign key.
        let result = sqlx::query("DELETE FROM workflow_executions WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(failed("delete_execution"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut query: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE TRUE"
        ));
        if let Some(workflow_id) = filter.workflow_id {
            query
                .push(" AND workflow_id = ")
                .push_bind(workflow_id.to_string());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(after) = filter.created_after {
            query.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            query.push(" AND created_at < ").push_bind(before);
        }
        let (limit, offset) = page_bounds(filter.limit, filter.offset);
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows: Vec<ExecutionRow> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(failed("list_executions"))?;
        rows.into_iter().map(ExecutionRow::try_into_record).collect()
    }

    #[instrument(skip_all, fields(%execution_id, node_id = %state.node_id, status = %state.status))]
    async fn save_node_state(
        &self,
        execution_id: ExecutionId,
        state: &NodeState,
    ) -> Result<(), StoreError> {
        let row = NodeStateRow::from_state(execution_id, state)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_node_states
                (execution_id, node_id, status, input, output, error, attempts,
                 attempt_durations_ms, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (execution_id, node_id) DO UPDATE SET
                status = EXCLUDED.status,
                input = EXCLUDED.input,
                output = EXCLUDED.output,
                error = EXCLUDED.error,
                attempts = EXCLUDED.attempts,
                attempt_durations_ms = EXCLUDED.attempt_durations_ms,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(row.execution_id)
        .bind(row.node_id)
        .bind(row.status)
        .bind(row.input)
        .bind(row.output)
        .bind(row.error)
        .bind(row.attempts)
        .bind(row.attempt_durations_ms)
        .bind(row.started_at)
        .bind(row.completed_at)
        .execute(&self.pool)
        .await
        .map_err(failed("save_node_state"))?;

        Ok(())
    }

    async fn get_node_state(
        &self,
        execution_id: ExecutionId,
        node_id: &NodeId,
    ) -> Result<Option<NodeState>, StoreError> {
        let row: Option<NodeStateRow> = sqlx::query_as(&format!(
            "SELECT {NODE_STATE_COLUMNS} FROM workflow_node_states \
             WHERE execution_id = $1 AND node_id = $2"
        ))
        .bind(execution_id.to_string())
        .bind(node_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(failed("get_node_state"))?;

        row.map(NodeStateRow::try_into_state).transpose()
    }

    async fn list_node_states(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<NodeState>, StoreError> {
        let rows: Vec<NodeStateRow> = sqlx::query_as(&format!(
            "SELECT {NODE_STATE_COLUMNS} FROM workflow_node_states \
             WHERE execution_id = $1 ORDER BY node_id"
        ))
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(failed("list_node_states"))?;

        rows.into_iter().map(NodeStateRow::try_into_state).collect()
    }

    async fn statistics(
        &self,
        workflow_id: Option<WorkflowId>,
    ) -> Result<ExecutionStatistics, StoreError> {
        let row: StatisticsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                COUNT(*) FILTER (WHERE status = 'timeout') AS timed_out,
                COUNT(*) FILTER (WHERE status IN ('pending', 'running')) AS running,
                (AVG(EXTRACT(EPOCH FROM (completed_at - started_at))) * 1000)::FLOAT8
                    AS average_duration_ms
            FROM workflow_executions
            WHERE $1::TEXT IS NULL OR workflow_id = $1
            "#,
        )
        .bind(workflow_id.map(|id| id.to_string()))
        .fetch_one(&self.pool)
        .await
        .map_err(failed("statistics"))?;

        Ok(row.into())
    }

    async fn execution_history(
        &self,
        workflow_id: WorkflowId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE workflow_id = $1 AND created_at >= $2 AND created_at < $3 \
             ORDER BY created_at, id"
        ))
        .bind(workflow_id.to_string())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(failed("execution_history"))?;

        rows.into_iter().map(ExecutionRow::try_into_record).collect()
    }

    #[instrument(skip(self))]
    async fn cleanup_executions(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let terminal: Vec<&str> = TERMINAL_STATUSES.iter().map(ExecutionStatus::as_str).collect();
        let result = sqlx::query(
            "DELETE FROM workflow_executions WHERE status = ANY($1) AND completed_at < $2",
        )
        .bind(terminal)
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(failed("cleanup_executions"))?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!(deleted, "deleted finished executions");
        }
        Ok(deleted)
    }
}
