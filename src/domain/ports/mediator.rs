use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::DomainResult;
use crate::domain::models::Conflict;

/// Value picked by an external mediator.
#[derive(Debug, Clone, PartialEq)]
pub struct MediatedValue {
    pub value: Value,
    pub confidence: f64,
    pub contributing_sources: Vec<String>,
    pub reasoning: String,
}

/// External judge for `ai_mediated` conflict resolution.
#[async_trait]
pub trait ConflictMediator: Send + Sync {
    async fn mediate(&self, conflict: &Conflict) -> DomainResult<MediatedValue>;
}
