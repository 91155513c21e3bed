use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{TaskState, TransitionRecord};

/// Repository port for task lifecycle persistence.
///
/// Rows are keyed by `(agent_name, task_id)`. Updates are optimistic: the
/// caller passes the transition count it last read, and the write fails with
/// `DomainError::ConcurrencyConflict` if another writer got there first.
#[async_trait]
pub trait TaskStateRepository: Send + Sync {
    /// Load a task state by agent and task id.
    async fn load(&self, agent_name: &str, task_id: Uuid) -> DomainResult<Option<TaskState>>;

    /// Insert a fresh task state.
    async fn insert(&self, state: &TaskState) -> DomainResult<()>;

    /// Update a task state previously read at `expected_version`.
    async fn update(&self, state: &TaskState, expected_version: u64) -> DomainResult<()>;

    /// Append an audit record.
    async fn append_transition(&self, record: &TransitionRecord) -> DomainResult<()>;

    /// Persist a transition: the new state plus its audit record.
    ///
    /// The default runs `update` then `append_transition`; adapters that can
    /// do both atomically should override it.
    async fn commit_transition(
        &self,
        state: &TaskState,
        expected_version: u64,
        record: &TransitionRecord,
    ) -> DomainResult<()> {
        self.update(state, expected_version).await?;
        self.append_transition(record).await
    }

    /// List audit records for a task, oldest first.
    async fn list_transitions(
        &self,
        agent_name: &str,
        task_id: Uuid,
    ) -> DomainResult<Vec<TransitionRecord>>;
}
