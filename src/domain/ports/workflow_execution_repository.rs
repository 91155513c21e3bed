use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::WorkflowExecution;

/// Repository port for workflow execution checkpoints.
#[async_trait]
pub trait WorkflowExecutionRepository: Send + Sync {
    /// Insert or replace an execution snapshot.
    async fn save(&self, execution: &WorkflowExecution) -> DomainResult<()>;

    /// Get an execution by id.
    async fn get(&self, id: Uuid) -> DomainResult<Option<WorkflowExecution>>;

    /// List executions of a workflow definition, newest first.
    async fn list_by_definition(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> DomainResult<Vec<WorkflowExecution>>;
}
