use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::DomainResult;

/// A workflow step capability.
///
/// Handlers run under at-least-once semantics: a step may be retried after a
/// timeout while an earlier attempt is still running in the background.
/// Handlers that cannot tolerate that return `false` from [`retryable`].
///
/// [`retryable`]: ActionHandler::retryable
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn invoke(&self, input: Value) -> DomainResult<Value>;

    fn retryable(&self) -> bool {
        true
    }
}
