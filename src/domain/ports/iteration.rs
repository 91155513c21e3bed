//! Capabilities consumed by the iteration controller.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Assessment, Plan, PlanExecution, StepFeedback};

/// Produces and revises plans.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce an initial plan for a goal.
    async fn plan(&self, goal: &str, context: &Value) -> DomainResult<Plan>;

    /// Revise a plan from per-step feedback.
    async fn adapt(&self, plan: &Plan, feedback: &[StepFeedback]) -> DomainResult<Plan>;
}

/// Scores an output against a goal.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, goal: &str, output: &Value) -> DomainResult<Assessment>;
}

/// Executes one plan and reports output plus per-step feedback.
#[async_trait]
pub trait PlanExecutor: Send + Sync {
    async fn execute_plan(&self, plan: &Plan, context: &Value) -> DomainResult<PlanExecution>;
}
