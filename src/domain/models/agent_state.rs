//! Agent lifecycle state machine types.
//!
//! ```text
//! Idle → Initializing → Planning → Executing ⇄ Evaluating → Succeeded
//!                          ↑          ↓  ↑         ↓
//!                          └──── Adapting ←────────┘
//! any active state → Paused → (state it was paused from)
//! any active state → Failed | Cancelled;  terminal → Idle (reset)
//! ```
//!
//! Transition logic here is pure. Persistence is layered on top by
//! `services::state_machine::AgentStateMachine`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Lifecycle state of one agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Initializing,
    Planning,
    Executing,
    Evaluating,
    Adapting,
    WaitingInput,
    WaitingAgent,
    Succeeded,
    Failed,
    Paused,
    Cancelled,
}

impl AgentState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 12] = [
        Self::Idle,
        Self::Initializing,
        Self::Planning,
        Self::Executing,
        Self::Evaluating,
        Self::Adapting,
        Self::WaitingInput,
        Self::WaitingAgent,
        Self::Succeeded,
        Self::Failed,
        Self::Paused,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Evaluating => "evaluating",
            Self::Adapting => "adapting",
            Self::WaitingInput => "waiting_input",
            Self::WaitingAgent => "waiting_agent",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Check if the task is doing (or waiting on) work.
    ///
    /// `Idle`, `Paused` and the terminal states are not active.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Initializing
                | Self::Planning
                | Self::Executing
                | Self::Evaluating
                | Self::Adapting
                | Self::WaitingInput
                | Self::WaitingAgent
        )
    }

    /// Check if the task is blocked on something external.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::WaitingInput | Self::WaitingAgent)
    }

    /// Static adjacency table: every state reachable from this one.
    pub fn valid_transitions(&self) -> &'static [AgentState] {
        use AgentState::*;
        match self {
            Idle => &[Initializing, Cancelled],
            Initializing => &[Planning, Paused, Failed, Cancelled],
            Planning => &[
                Executing,
                WaitingInput,
                WaitingAgent,
                Paused,
                Failed,
                Cancelled,
            ],
            Executing => &[
                Executing,
                Evaluating,
                Adapting,
                WaitingInput,
                WaitingAgent,
                Paused,
                Failed,
                Cancelled,
            ],
            Evaluating => &[
                Succeeded,
                Adapting,
                Planning,
                WaitingInput,
                Paused,
                Failed,
                Cancelled,
            ],
            Adapting => &[Executing, Planning, WaitingInput, Paused, Failed, Cancelled],
            WaitingInput | WaitingAgent => &[Executing, Paused, Failed, Cancelled],
            Paused => &[
                Initializing,
                Planning,
                Executing,
                Evaluating,
                Adapting,
                WaitingInput,
                WaitingAgent,
                Failed,
                Cancelled,
            ],
            Succeeded | Failed | Cancelled => &[Idle],
        }
    }

    pub fn can_transition_to(&self, to: AgentState) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::SerializationError(format!("Unknown agent state: {s}")))
    }
}

/// Event types accepted by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Start,
    Initialized,
    PlanComplete,
    StepStarted,
    StepComplete,
    StepFailed,
    ExecutionComplete,
    EvaluationPassed,
    EvaluationFailed,
    AdaptationComplete,
    Replan,
    NeedInput,
    InputReceived,
    WaitForAgent,
    AgentResponded,
    Pause,
    Resume,
    Fail,
    Cancel,
    Reset,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [Self; 20] = [
        Self::Start,
        Self::Initialized,
        Self::PlanComplete,
        Self::StepStarted,
        Self::StepComplete,
        Self::StepFailed,
        Self::ExecutionComplete,
        Self::EvaluationPassed,
        Self::EvaluationFailed,
        Self::AdaptationComplete,
        Self::Replan,
        Self::NeedInput,
        Self::InputReceived,
        Self::WaitForAgent,
        Self::AgentResponded,
        Self::Pause,
        Self::Resume,
        Self::Fail,
        Self::Cancel,
        Self::Reset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Initialized => "INITIALIZED",
            Self::PlanComplete => "PLAN_COMPLETE",
            Self::StepStarted => "STEP_STARTED",
            Self::StepComplete => "STEP_COMPLETE",
            Self::StepFailed => "STEP_FAILED",
            Self::ExecutionComplete => "EXECUTION_COMPLETE",
            Self::EvaluationPassed => "EVALUATION_PASSED",
            Self::EvaluationFailed => "EVALUATION_FAILED",
            Self::AdaptationComplete => "ADAPTATION_COMPLETE",
            Self::Replan => "REPLAN",
            Self::NeedInput => "NEED_INPUT",
            Self::InputReceived => "INPUT_RECEIVED",
            Self::WaitForAgent => "WAIT_FOR_AGENT",
            Self::AgentResponded => "AGENT_RESPONDED",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Fail => "FAIL",
            Self::Cancel => "CANCEL",
            Self::Reset => "RESET",
        }
    }

    /// Static event → state map.
    ///
    /// `Resume` has no static target; it restores the state recorded at the
    /// most recent `Pause` and always returns `None` here.
    pub fn target_state(&self, from: AgentState) -> Option<AgentState> {
        use AgentState::*;
        match (self, from) {
            (Self::Start, Idle) => Some(Initializing),
            (Self::Initialized, Initializing) => Some(Planning),
            (Self::PlanComplete, Planning) => Some(Executing),
            (Self::StepStarted | Self::StepComplete, Executing) => Some(Executing),
            (Self::StepFailed, Executing) => Some(Adapting),
            (Self::ExecutionComplete, Executing) => Some(Evaluating),
            (Self::EvaluationPassed, Evaluating) => Some(Succeeded),
            (Self::EvaluationFailed, Evaluating) => Some(Adapting),
            (Self::AdaptationComplete, Adapting) => Some(Executing),
            (Self::Replan, Adapting | Evaluating) => Some(Planning),
            (Self::NeedInput, Planning | Executing | Evaluating | Adapting) => Some(WaitingInput),
            (Self::InputReceived, WaitingInput) => Some(Executing),
            (Self::WaitForAgent, Planning | Executing) => Some(WaitingAgent),
            (Self::AgentResponded, WaitingAgent) => Some(Executing),
            (Self::Pause, state) if state.is_active() => Some(Paused),
            (Self::Fail, state) if state.is_active() || state == Paused => Some(Failed),
            (Self::Cancel, state) if state.is_active() || matches!(state, Idle | Paused) => {
                Some(Cancelled)
            }
            (Self::Reset, state) if state.is_terminal() => Some(Idle),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| DomainError::SerializationError(format!("Unknown event type: {s}")))
    }
}

/// An event delivered to the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Value,
}

impl StateEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    fn payload_str(&self, key: &str) -> Option<String> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// What a waiting task is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Input,
    Agent,
}

/// Describes an outstanding wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitDescriptor {
    pub kind: WaitKind,
    pub reason: Option<String>,
    /// Agent being waited on, for `WaitKind::Agent`.
    pub agent: Option<String>,
    pub since: DateTime<Utc>,
}

/// Last error recorded against the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub step_id: Option<String>,
    pub message: String,
}

/// Context captured at `Pause` and restored by `Resume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseSnapshot {
    pub paused_from: AgentState,
    pub context: Box<TaskContext>,
}

/// Free-form context carried alongside the task state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub wait: Option<WaitDescriptor>,
    #[serde(default)]
    pub last_error: Option<StepError>,
    #[serde(default)]
    pub pause_snapshot: Option<PauseSnapshot>,
    #[serde(default)]
    pub custom: HashMap<String, Value>,
}

/// Immutable audit row written for every applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_name: String,
    pub from_state: AgentState,
    pub to_state: AgentState,
    pub event_type: EventType,
    pub payload: Value,
    /// Milliseconds spent in `from_state`.
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of one task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: Uuid,
    pub agent_name: String,
    pub current_state: AgentState,
    pub previous_state: Option<AgentState>,
    pub context: TaskContext,
    pub state_entered_at: DateTime<Utc>,
    /// Number of applied transitions. Also used as the optimistic
    /// concurrency version when persisting.
    pub transition_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    /// Create a fresh `Idle` task state.
    pub fn new(agent_name: impl Into<String>, task_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            agent_name: agent_name.into(),
            current_state: AgentState::Idle,
            previous_state: None,
            context: TaskContext::default(),
            state_entered_at: now,
            transition_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.current_state.is_active()
    }

    pub fn is_waiting(&self) -> bool {
        self.current_state.is_waiting()
    }

    pub fn is_paused(&self) -> bool {
        self.current_state == AgentState::Paused
    }

    fn invalid(&self, event: &StateEvent, reason: impl Into<String>) -> DomainError {
        DomainError::InvalidTransition {
            from: self.current_state.to_string(),
            event: event.event_type.to_string(),
            reason: reason.into(),
        }
    }

    /// Resolve the target state for `event` without mutating anything.
    pub fn resolve_target(&self, event: &StateEvent) -> DomainResult<AgentState> {
        let from = self.current_state;
        let target = if event.event_type == EventType::Resume {
            if from != AgentState::Paused {
                return Err(self.invalid(event, "RESUME is only valid from paused"));
            }
            self.context
                .pause_snapshot
                .as_ref()
                .map(|snapshot| snapshot.paused_from)
                .ok_or_else(|| self.invalid(event, "no pause snapshot to resume from"))?
        } else {
            event
                .event_type
                .target_state(from)
                .ok_or_else(|| self.invalid(event, "event not accepted in this state"))?
        };

        if !from.can_transition_to(target) {
            return Err(self.invalid(
                event,
                format!("{from} -> {target} is not in the adjacency table"),
            ));
        }
        Ok(target)
    }

    /// Apply `event`, returning the audit record.
    ///
    /// On error the state is left untouched.
    pub fn apply(&mut self, event: &StateEvent) -> DomainResult<TransitionRecord> {
        let target = self.resolve_target(event)?;
        let from = self.current_state;
        let now = Utc::now();
        let duration_ms = u64::try_from((now - self.state_entered_at).num_milliseconds()).unwrap_or(0);

        self.patch_context(event, from, now);
        self.previous_state = Some(from);
        self.current_state = target;
        self.state_entered_at = now;
        self.transition_count += 1;
        self.updated_at = now;

        Ok(TransitionRecord {
            id: Uuid::new_v4(),
            task_id: self.task_id,
            agent_name: self.agent_name.clone(),
            from_state: from,
            to_state: target,
            event_type: event.event_type,
            payload: event.payload.clone(),
            duration_ms,
            created_at: now,
        })
    }

    fn patch_context(&mut self, event: &StateEvent, from: AgentState, now: DateTime<Utc>) {
        let ctx = &mut self.context;
        match event.event_type {
            EventType::Start => {
                ctx.last_error = None;
            }
            EventType::PlanComplete => {
                ctx.plan_id = event.payload_str("plan_id");
                ctx.current_step_id = None;
            }
            EventType::AdaptationComplete => {
                if let Some(plan_id) = event.payload_str("plan_id") {
                    ctx.plan_id = Some(plan_id);
                }
                ctx.current_step_id = None;
                ctx.iteration += 1;
            }
            EventType::StepStarted | EventType::StepComplete => {
                ctx.current_step_id = event.payload_str("step_id");
            }
            EventType::StepFailed => {
                let step_id = event.payload_str("step_id").or_else(|| ctx.current_step_id.clone());
                ctx.last_error = Some(StepError {
                    step_id,
                    message: event
                        .payload_str("error")
                        .unwrap_or_else(|| "step failed".to_string()),
                });
            }
            EventType::ExecutionComplete => {
                ctx.current_step_id = None;
            }
            EventType::EvaluationFailed => {
                ctx.iteration += 1;
            }
            EventType::NeedInput | EventType::WaitForAgent => {
                let kind = if event.event_type == EventType::NeedInput {
                    WaitKind::Input
                } else {
                    WaitKind::Agent
                };
                ctx.wait = Some(WaitDescriptor {
                    kind,
                    reason: event.payload_str("reason"),
                    agent: event.payload_str("agent"),
                    since: now,
                });
            }
            EventType::InputReceived | EventType::AgentResponded => {
                ctx.wait = None;
                if !event.payload.is_null() {
                    let key = if event.event_type == EventType::InputReceived {
                        "last_input"
                    } else {
                        "last_agent_response"
                    };
                    ctx.custom.insert(key.to_string(), event.payload.clone());
                }
            }
            EventType::Pause => {
                let mut snapshot = ctx.clone();
                snapshot.pause_snapshot = None;
                ctx.pause_snapshot = Some(PauseSnapshot {
                    paused_from: from,
                    context: Box::new(snapshot),
                });
            }
            EventType::Resume => {
                if let Some(snapshot) = ctx.pause_snapshot.take() {
                    *ctx = *snapshot.context;
                }
            }
            EventType::Fail => {
                ctx.pause_snapshot = None;
                ctx.last_error = Some(StepError {
                    step_id: event.payload_str("step_id").or_else(|| ctx.current_step_id.clone()),
                    message: event
                        .payload_str("error")
                        .unwrap_or_else(|| format!("failed while {from}")),
                });
            }
            EventType::Cancel => {
                ctx.pause_snapshot = None;
                ctx.wait = None;
                if let Some(reason) = event.payload_str("reason") {
                    ctx.custom
                        .insert("cancel_reason".to_string(), Value::String(reason));
                }
            }
            EventType::Reset => {
                *ctx = TaskContext::default();
            }
            EventType::Initialized | EventType::EvaluationPassed | EventType::Replan => {}
        }
    }
}
