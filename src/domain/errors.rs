//! Domain errors for the taskloom orchestration engine.

use thiserror::Error;
use uuid::Uuid;

/// Format a cycle path as a human-readable string: `A -> B -> C -> A`.
fn format_cycle_path(path: &[String]) -> String {
    path.join(" -> ")
}

/// Domain-level errors that can occur in the orchestration engine.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The state machine rejected an event in a state that doesn't permit it.
    #[error("Invalid transition from {from} on {event}: {reason}")]
    InvalidTransition {
        from: String,
        event: String,
        reason: String,
    },

    #[error("Step {step_id} timed out after {timeout_ms}ms")]
    StepTimeout { step_id: String, timeout_ms: u64 },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Action {action_id} failed: {message}")]
    ActionFailed { action_id: String, message: String },

    #[error("Dependency cycle detected: {}", format_cycle_path(.0))]
    CycleDetected(Vec<String>),

    #[error("No handler registered for action: {0}")]
    NoHandler(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Task state not found: {agent}/{task_id}")]
    TaskStateNotFound { agent: String, task_id: Uuid },

    #[error("Concurrency conflict: {entity} {id} was modified")]
    ConcurrencyConflict { entity: String, id: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DomainError {
    /// Whether a step failing with this error may be attempted again.
    ///
    /// Validation failures, missing handlers and configuration errors are
    /// surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StepTimeout { .. } | Self::ActionFailed { .. } | Self::ExecutionFailed(_)
        )
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}
