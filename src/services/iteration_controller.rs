//! Iteration controller: "loop until satisfied".
//!
//! Each iteration executes the working plan, scores the output and picks a
//! decision, checked in this order:
//!
//! 1. `succeed` when the assessment meets its threshold;
//! 2. `terminate` when the iteration or wall-clock budget is spent;
//! 3. convergence: a drop larger than `degradation_margin` counts as a
//!    degradation. Reaching `max_degradations` consecutive degradations
//!    terminates. A degradation or a plateau (`|delta| <
//!    convergence_threshold`) adapts the plan unless the adaptation cooldown
//!    is still running;
//! 4. `continue` with the same plan.
//!
//! Execution or scoring errors end the loop with status `failed`. The
//! outcome carries the full per-iteration history.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::select;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Assessment, IterationConfig, IterationDecision, IterationOutcome, IterationRecord,
    IterationState, IterationStatus, Plan, PlanExecution,
};
use crate::domain::ports::{EventPublisher, PlanExecutor, Planner, Scorer};

/// Decision plus the reasoning recorded in history.
#[derive(Debug, Clone, PartialEq)]
struct Verdict {
    decision: IterationDecision,
    reasoning: String,
    can_retry: bool,
}

impl Verdict {
    fn new(decision: IterationDecision, reasoning: String) -> Self {
        Self {
            decision,
            reasoning,
            can_retry: true,
        }
    }
}

pub struct IterationController {
    planner: Arc<dyn Planner>,
    scorer: Arc<dyn Scorer>,
    config: IterationConfig,
    publisher: Option<Arc<dyn EventPublisher>>,
    /// When this controller last adapted a plan. Spans runs.
    last_adaptation: Mutex<Option<Instant>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl IterationController {
    pub fn new(planner: Arc<dyn Planner>, scorer: Arc<dyn Scorer>, config: IterationConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            planner,
            scorer,
            config,
            publisher: None,
            last_adaptation: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &IterationConfig {
        &self.config
    }

    /// Stop the running loop at its next suspension point. The outcome has
    /// status `terminated`. Has no effect on loops started afterwards.
    pub fn shutdown(&self) {
        info!("Triggering iteration loop shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Run the loop. Without an initial plan the planner produces one.
    ///
    /// Capability failures are reported through the outcome (`status =
    /// failed`), not as `Err`.
    pub async fn run(
        &self,
        goal: &str,
        initial_plan: Option<Plan>,
        executor: &dyn PlanExecutor,
        context: &Value,
    ) -> IterationOutcome {
        let state = IterationState::new();
        let span = tracing::info_span!("iteration_loop", loop_id = %state.loop_id, goal);
        let outcome = self
            .run_loop(state, goal, initial_plan, executor, context)
            .instrument(span)
            .await;

        if let Some(publisher) = &self.publisher {
            let event_type = if outcome.success {
                "iteration.completed"
            } else {
                "iteration.failed"
            };
            publisher
                .publish(
                    event_type,
                    json!({
                        "loop_id": outcome.loop_id,
                        "goal": goal,
                        "status": outcome.status,
                        "total_iterations": outcome.total_iterations,
                        "adaptations_made": outcome.adaptations_made,
                        "reason": outcome.termination_reason,
                        "final_score": outcome.final_assessment.as_ref().map(|a| a.overall_score),
                    }),
                )
                .await;
        }
        outcome
    }

    async fn run_loop(
        &self,
        mut state: IterationState,
        goal: &str,
        initial_plan: Option<Plan>,
        executor: &dyn PlanExecutor,
        context: &Value,
    ) -> IterationOutcome {
        let started = Instant::now();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut history: Vec<IterationRecord> = Vec::new();

        let mut plan = match initial_plan {
            Some(plan) => plan,
            None => match self.planner.plan(goal, context).await {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(error = %e, "initial planning failed");
                    state.status = IterationStatus::Failed;
                    let reason = format!("planning failed: {e}");
                    let plan = Plan::new(Vec::new());
                    return finish(state, plan, history, started, reason, e.is_retryable());
                }
            },
        };

        loop {
            state.iteration += 1;
            let iteration = state.iteration;
            let iteration_started_at = Utc::now();
            let iteration_started = Instant::now();
            debug!(iteration, plan_id = %plan.id, "starting iteration");

            let execution = select! {
                result = self.execute_once(executor, &plan, context, iteration) => Some(result),
                _ = shutdown_rx.recv() => None,
            };
            let Some(execution) = execution else {
                info!(iteration, "shutdown signal received, stopping loop");
                state.iteration -= 1;
                state.status = IterationStatus::Terminated;
                return finish(state, plan, history, started, "shutdown requested".to_string(), true);
            };

            let scored = match execution {
                Ok(execution) => self
                    .scorer
                    .score(goal, &execution.output)
                    .await
                    .map(|assessment| (execution, assessment))
                    .map_err(|e| format!("scoring failed: {e}")),
                Err(e) => Err(format!("execution failed: {e}")),
            };

            let (execution, assessment) = match scored {
                Ok(pair) => pair,
                Err(reason) => {
                    warn!(iteration, reason = %reason, "iteration failed");
                    history.push(IterationRecord {
                        iteration,
                        output: None,
                        assessment: None,
                        decision: IterationDecision::Terminate,
                        reasoning: reason.clone(),
                        started_at: iteration_started_at,
                        duration_ms: elapsed_ms(iteration_started),
                    });
                    state.status = IterationStatus::Failed;
                    return finish(state, plan, history, started, reason, true);
                }
            };

            let delta = state.score_delta(&assessment);
            let verdict = self
                .decide(&mut state, &assessment, delta, started.elapsed())
                .await;
            state.record(execution.output.clone(), assessment.clone());

            info!(
                iteration,
                score = assessment.overall_score,
                delta = delta.unwrap_or_default(),
                decision = %verdict.decision,
                "iteration decided"
            );

            history.push(IterationRecord {
                iteration,
                output: Some(execution.output),
                assessment: Some(assessment),
                decision: verdict.decision,
                reasoning: verdict.reasoning.clone(),
                started_at: iteration_started_at,
                duration_ms: elapsed_ms(iteration_started),
            });

            match verdict.decision {
                IterationDecision::Succeed => {
                    state.status = IterationStatus::Succeeded;
                    return finish(state, plan, history, started, verdict.reasoning, false);
                }
                IterationDecision::Terminate => {
                    state.status = IterationStatus::Terminated;
                    return finish(state, plan, history, started, verdict.reasoning, verdict.can_retry);
                }
                IterationDecision::Adapt => {
                    match self.planner.adapt(&plan, &execution.feedback).await {
                        Ok(mut adapted) => {
                            adapted.revision = adapted.revision.max(plan.revision + 1);
                            debug!(old_plan = %plan.id, new_plan = %adapted.id, "plan adapted");
                            plan = adapted;
                            state.adaptations_made += 1;
                            *self.last_adaptation.lock().await = Some(Instant::now());
                        }
                        Err(e) => {
                            warn!(iteration, error = %e, "adaptation failed, keeping current plan");
                        }
                    }
                }
                IterationDecision::Continue => {}
            }
        }
    }

    async fn execute_once(
        &self,
        executor: &dyn PlanExecutor,
        plan: &Plan,
        context: &Value,
        iteration: u32,
    ) -> DomainResult<PlanExecution> {
        match self.config.iteration_timeout() {
            Some(limit) => timeout(limit, executor.execute_plan(plan, context))
                .await
                .map_err(|_| DomainError::StepTimeout {
                    step_id: format!("iteration-{iteration}"),
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })?,
            None => executor.execute_plan(plan, context).await,
        }
    }

    async fn cooldown_elapsed(&self) -> bool {
        match *self.last_adaptation.lock().await {
            Some(at) => at.elapsed() >= self.config.adaptation_cooldown(),
            None => true,
        }
    }

    async fn decide(
        &self,
        state: &mut IterationState,
        assessment: &Assessment,
        delta: Option<f64>,
        elapsed: Duration,
    ) -> Verdict {
        let score = assessment.overall_score;

        if assessment.meets_threshold {
            return Verdict::new(
                IterationDecision::Succeed,
                format!("score {score:.3} meets the success threshold"),
            );
        }

        if state.iteration >= self.config.max_iterations {
            return Verdict::new(
                IterationDecision::Terminate,
                format!(
                    "reached max iterations ({}) with score {score:.3}",
                    self.config.max_iterations
                ),
            );
        }

        if elapsed >= self.config.max_duration() {
            return Verdict::new(
                IterationDecision::Terminate,
                format!(
                    "exceeded max duration of {}s with score {score:.3}",
                    self.config.max_duration_secs
                ),
            );
        }

        let Some(delta) = delta else {
            return Verdict::new(
                IterationDecision::Continue,
                format!("first iteration scored {score:.3}"),
            );
        };

        if delta < -self.config.degradation_margin {
            state.consecutive_degradations += 1;
            if state.consecutive_degradations >= self.config.max_degradations {
                return Verdict {
                    decision: IterationDecision::Terminate,
                    reasoning: format!(
                        "score degraded for {} consecutive iterations (last delta {delta:.3})",
                        state.consecutive_degradations
                    ),
                    can_retry: false,
                };
            }
            if self.cooldown_elapsed().await {
                return Verdict::new(
                    IterationDecision::Adapt,
                    format!("score degraded by {:.3}, adapting plan", -delta),
                );
            }
            return Verdict::new(
                IterationDecision::Continue,
                format!("score degraded by {:.3}, adaptation cooling down", -delta),
            );
        }

        state.consecutive_degradations = 0;

        if delta.abs() < self.config.convergence_threshold && self.cooldown_elapsed().await {
            return Verdict::new(
                IterationDecision::Adapt,
                format!("score plateaued at {score:.3} (delta {delta:.3}), adapting plan"),
            );
        }

        Verdict::new(
            IterationDecision::Continue,
            format!("score {score:.3} (delta {delta:+.3}), continuing"),
        )
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn finish(
    state: IterationState,
    plan: Plan,
    history: Vec<IterationRecord>,
    started: Instant,
    termination_reason: String,
    can_retry: bool,
) -> IterationOutcome {
    let success = state.status == IterationStatus::Succeeded;
    info!(
        status = %state.status,
        iterations = state.iteration,
        adaptations = state.adaptations_made,
        reason = %termination_reason,
        "iteration loop finished"
    );
    IterationOutcome {
        loop_id: state.loop_id,
        success,
        status: state.status,
        final_output: state.last_output,
        final_assessment: state.last_assessment,
        final_plan: plan,
        total_iterations: state.iteration,
        total_duration_ms: elapsed_ms(started),
        adaptations_made: state.adaptations_made,
        termination_reason,
        can_retry: !success && can_retry,
        history,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{PlanStep, StepFeedback};
    use async_trait::async_trait;

    struct FixedPlanner;

    #[async_trait]
    impl Planner for FixedPlanner {
        async fn plan(&self, _goal: &str, _context: &Value) -> DomainResult<Plan> {
            Ok(Plan::new(vec![PlanStep::new("draft", "write")]))
        }

        async fn adapt(&self, plan: &Plan, _feedback: &[StepFeedback]) -> DomainResult<Plan> {
            Ok(Plan::new(plan.steps.clone()))
        }
    }

    struct ConstScorer(f64);

    #[async_trait]
    impl Scorer for ConstScorer {
        async fn score(&self, _goal: &str, _output: &Value) -> DomainResult<Assessment> {
            Ok(Assessment::new(self.0, false))
        }
    }

    struct EchoExecutor;

    #[async_trait]
    impl PlanExecutor for EchoExecutor {
        async fn execute_plan(&self, plan: &Plan, _context: &Value) -> DomainResult<PlanExecution> {
            Ok(PlanExecution {
                output: json!({"plan": plan.id}),
                feedback: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_plateau_adapts_then_hits_iteration_cap() {
        let config = IterationConfig {
            max_iterations: 3,
            ..Default::default()
        };
        let controller = IterationController::new(Arc::new(FixedPlanner), Arc::new(ConstScorer(0.4)), config);

        let outcome = controller.run("goal", None, &EchoExecutor, &Value::Null).await;

        assert!(!outcome.success);
        assert_eq!(outcome.status, IterationStatus::Terminated);
        assert_eq!(outcome.total_iterations, 3);
        assert!(outcome.can_retry);
        let decisions: Vec<_> = outcome.history.iter().map(|r| r.decision).collect();
        assert_eq!(
            decisions,
            vec![
                IterationDecision::Continue,
                IterationDecision::Adapt,
                IterationDecision::Terminate
            ]
        );
        assert_eq!(outcome.adaptations_made, 1);
        assert_eq!(outcome.final_plan.revision, 1);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_second_adaptation() {
        let config = IterationConfig {
            max_iterations: 4,
            adaptation_cooldown_ms: 60_000,
            ..Default::default()
        };
        let controller = IterationController::new(Arc::new(FixedPlanner), Arc::new(ConstScorer(0.4)), config);

        let outcome = controller.run("goal", None, &EchoExecutor, &Value::Null).await;
        assert_eq!(outcome.adaptations_made, 1);
        assert_eq!(outcome.history[2].decision, IterationDecision::Continue);
    }
}
