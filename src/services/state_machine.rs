//! Persistent agent lifecycle state machine.
//!
//! Wraps the pure transition logic of [`TaskState`] with persistence, an
//! audit trail and event publication. A transition is computed on a copy,
//! persisted, and only then committed in memory, so a rejected event or a
//! failed write leaves the machine exactly as it was.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{AgentState, EventType, StateEvent, TaskState, TransitionRecord};
use crate::domain::ports::{EventPublisher, TaskStateRepository};

pub struct AgentStateMachine {
    state: TaskState,
    repo: Option<Arc<dyn TaskStateRepository>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    /// Transitions applied by this instance, used when there is no repository.
    local_history: Vec<TransitionRecord>,
}

impl AgentStateMachine {
    /// Load the persisted state for `(agent_name, task_id)`, or create a
    /// fresh idle row. Re-initializing after a crash resumes exactly where
    /// the task left off.
    pub async fn initialize(
        repo: Arc<dyn TaskStateRepository>,
        agent_name: &str,
        task_id: Uuid,
    ) -> DomainResult<Self> {
        let state = match repo.load(agent_name, task_id).await? {
            Some(existing) => {
                tracing::info!(
                    agent = agent_name,
                    %task_id,
                    state = %existing.current_state,
                    "restored task state"
                );
                existing
            }
            None => {
                let fresh = TaskState::new(agent_name, task_id);
                repo.insert(&fresh).await?;
                tracing::debug!(agent = agent_name, %task_id, "created task state");
                fresh
            }
        };

        Ok(Self {
            state,
            repo: Some(repo),
            publisher: None,
            local_history: Vec::new(),
        })
    }

    /// A machine without persistence. History is kept in memory only.
    pub fn detached(agent_name: &str, task_id: Uuid) -> Self {
        Self {
            state: TaskState::new(agent_name, task_id),
            repo: None,
            publisher: None,
            local_history: Vec::new(),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Apply an event. Fails with `InvalidTransition` if the event is not
    /// accepted in the current state; the state is unchanged on any error.
    pub async fn transition(&mut self, event: StateEvent) -> DomainResult<TransitionRecord> {
        let mut next = self.state.clone();
        let record = next.apply(&event).inspect_err(|e| {
            tracing::warn!(
                agent = %self.state.agent_name,
                task_id = %self.state.task_id,
                error = %e,
                "rejected transition"
            );
        })?;

        if let Some(repo) = &self.repo {
            repo.commit_transition(&next, self.state.transition_count, &record)
                .await?;
        }

        self.state = next;
        self.local_history.push(record.clone());

        tracing::info!(
            agent = %record.agent_name,
            task_id = %record.task_id,
            from = %record.from_state,
            to = %record.to_state,
            event = %record.event_type,
            duration_ms = record.duration_ms,
            "state transition"
        );

        if let Some(publisher) = &self.publisher {
            publisher
                .publish(
                    "state.transitioned",
                    json!({
                        "agent": record.agent_name,
                        "task_id": record.task_id,
                        "from": record.from_state,
                        "to": record.to_state,
                        "event": record.event_type,
                    }),
                )
                .await;
        }

        Ok(record)
    }

    /// Shorthand for an event without payload.
    pub async fn fire(&mut self, event_type: EventType) -> DomainResult<TransitionRecord> {
        self.transition(StateEvent::new(event_type)).await
    }

    /// Re-read the persisted row, discarding the in-memory copy. Used after
    /// a `ConcurrencyConflict`.
    pub async fn reload(&mut self) -> DomainResult<()> {
        if let Some(repo) = &self.repo {
            if let Some(state) = repo.load(&self.state.agent_name, self.state.task_id).await? {
                self.state = state;
            }
        }
        Ok(())
    }

    /// Would `event` be accepted right now?
    pub fn can_accept(&self, event: &StateEvent) -> bool {
        self.state.resolve_target(event).is_ok()
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn current_state(&self) -> AgentState {
        self.state.current_state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_waiting(&self) -> bool {
        self.state.is_waiting()
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    /// Audit records for this task, oldest first.
    pub async fn history(&self) -> DomainResult<Vec<TransitionRecord>> {
        match &self.repo {
            Some(repo) => {
                repo.list_transitions(&self.state.agent_name, self.state.task_id)
                    .await
            }
            None => Ok(self.local_history.clone()),
        }
    }
}
