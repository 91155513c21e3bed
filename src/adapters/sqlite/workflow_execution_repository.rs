//! SQLite implementation of the WorkflowExecutionRepository.
//!
//! Executions are stored as JSON snapshots with a few indexed columns for
//! lookup. Every checkpoint replaces the previous snapshot.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{ExecutionStatus, WorkflowExecution};
use crate::domain::ports::WorkflowExecutionRepository;

#[derive(Clone)]
pub struct SqliteWorkflowExecutionRepository {
    pool: SqlitePool,
}

impl SqliteWorkflowExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Executions in a given status, oldest first. Used to find runs left
    /// unfinished by a crash.
    pub async fn list_by_status(&self, status: ExecutionStatus) -> DomainResult<Vec<WorkflowExecution>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT execution_json FROM workflow_executions WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(DomainError::from))
            .collect()
    }
}

#[async_trait]
impl WorkflowExecutionRepository for SqliteWorkflowExecutionRepository {
    async fn save(&self, execution: &WorkflowExecution) -> DomainResult<()> {
        let execution_json = serde_json::to_string(execution)?;

        sqlx::query(
            "INSERT OR REPLACE INTO workflow_executions
                 (id, workflow_id, trigger_key, status, execution_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(execution.id.to_string())
        .bind(&execution.workflow_id)
        .bind(&execution.trigger)
        .bind(execution.status.as_str())
        .bind(&execution_json)
        .bind(execution.created_at.to_rfc3339())
        .bind(execution.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<WorkflowExecution>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT execution_json FROM workflow_executions WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn list_by_definition(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> DomainResult<Vec<WorkflowExecution>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT execution_json FROM workflow_executions
             WHERE workflow_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(workflow_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(DomainError::from))
            .collect()
    }
}
