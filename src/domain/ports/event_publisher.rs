use async_trait::async_trait;
use serde_json::Value;

/// Fire-and-forget notification sink.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event_type: &str, payload: Value);
}
