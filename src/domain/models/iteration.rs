//! Iteration loop domain models.
//!
//! A loop repeatedly executes a [`Plan`], scores the output into an
//! [`Assessment`] and picks an [`IterationDecision`]. The per-run
//! [`IterationState`] is discarded when the loop ends; callers keep the
//! returned [`IterationOutcome`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One abstract step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    /// Opaque capability identifier.
    pub action_id: String,
    #[serde(default)]
    pub input: Value,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, action_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action_id: action_id.into(),
            input: Value::Null,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }
}

/// Ordered list of steps meant to achieve a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub steps: Vec<PlanStep>,
    /// Revision counter, bumped by every adaptation.
    #[serde(default)]
    pub revision: u32,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            steps,
            revision: 0,
            created_at: Utc::now(),
        }
    }
}

/// Scored judgment of an output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    /// Overall quality in `[0, 1]`.
    pub overall_score: f64,
    pub meets_threshold: bool,
    #[serde(default)]
    pub per_criterion: HashMap<String, f64>,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl Assessment {
    pub fn new(overall_score: f64, meets_threshold: bool) -> Self {
        Self {
            overall_score: overall_score.clamp(0.0, 1.0),
            meets_threshold,
            per_criterion: HashMap::new(),
            feedback: None,
        }
    }

    pub fn with_criterion(mut self, name: impl Into<String>, score: f64) -> Self {
        self.per_criterion.insert(name.into(), score);
        self
    }
}

/// Feedback for one executed plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFeedback {
    pub step_id: String,
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// What a plan executor returns for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub output: Value,
    #[serde(default)]
    pub feedback: Vec<StepFeedback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationDecision {
    Continue,
    Succeed,
    Adapt,
    Terminate,
}

impl std::fmt::Display for IterationDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Succeed => write!(f, "succeed"),
            Self::Adapt => write!(f, "adapt"),
            Self::Terminate => write!(f, "terminate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Running,
    Succeeded,
    Failed,
    Terminated,
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Mutable state of one loop run.
#[derive(Debug, Clone)]
pub struct IterationState {
    pub loop_id: Uuid,
    pub iteration: u32,
    pub last_output: Option<Value>,
    pub last_assessment: Option<Assessment>,
    pub consecutive_degradations: u32,
    pub adaptations_made: u32,
    pub status: IterationStatus,
}

impl IterationState {
    pub fn new() -> Self {
        Self {
            loop_id: Uuid::new_v4(),
            iteration: 0,
            last_output: None,
            last_assessment: None,
            consecutive_degradations: 0,
            adaptations_made: 0,
            status: IterationStatus::Running,
        }
    }

    /// Score change relative to the previous iteration, if there is one.
    pub fn score_delta(&self, assessment: &Assessment) -> Option<f64> {
        self.last_assessment
            .as_ref()
            .map(|previous| assessment.overall_score - previous.overall_score)
    }

    pub fn record(&mut self, output: Value, assessment: Assessment) {
        self.last_output = Some(output);
        self.last_assessment = Some(assessment);
    }
}

impl Default for IterationState {
    fn default() -> Self {
        Self::new()
    }
}

/// History entry for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub output: Option<Value>,
    pub assessment: Option<Assessment>,
    pub decision: IterationDecision,
    pub reasoning: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Summary returned when a loop ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationOutcome {
    pub loop_id: Uuid,
    pub success: bool,
    pub status: IterationStatus,
    pub final_output: Option<Value>,
    pub final_assessment: Option<Assessment>,
    pub final_plan: Plan,
    pub total_iterations: u32,
    pub total_duration_ms: u64,
    pub adaptations_made: u32,
    pub termination_reason: String,
    /// Whether running the loop again could plausibly succeed.
    pub can_retry: bool,
    pub history: Vec<IterationRecord>,
}
