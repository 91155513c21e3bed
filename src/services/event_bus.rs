//! In-process event bus.
//!
//! Broadcast-based fan-out with sequence numbering. Implements [`EventPublisher`] so the executor, iteration controller
//! and orchestrator can publish through it.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::ports::EventPublisher;

/// Event envelope delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    pub id: Uuid,
    /// Monotonically increasing, assigned at publish time.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub payload: Value,
}

/// Configuration for the EventBus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Channel capacity for the broadcast channel.
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Central event bus for broadcasting events to multiple consumers.
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish an event and return the envelope that was broadcast.
    pub async fn emit(&self, event_type: &str, payload: Value) -> OrchestratorEvent {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);

        let event = OrchestratorEvent {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            payload,
        };

        tracing::debug!(event_type, sequence, "publishing event");
        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    /// Sequence number the next event will get.
    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, event_type: &str, payload: Value) {
        self.emit(event_type, payload).await;
    }
}
