//! Integration tests for the iteration controller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use taskloom::domain::errors::{DomainError, DomainResult};
use taskloom::domain::models::{
    Assessment, IterationConfig, IterationDecision, IterationStatus, Plan, PlanExecution, PlanStep,
    StepFeedback,
};
use taskloom::domain::ports::{PlanExecutor, Planner, Scorer};
use taskloom::services::{EventBus, IterationController};

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Default)]
struct CountingPlanner {
    adaptations: AtomicU32,
    fail_planning: bool,
}

#[async_trait]
impl Planner for CountingPlanner {
    async fn plan(&self, goal: &str, _context: &Value) -> DomainResult<Plan> {
        if self.fail_planning {
            return Err(DomainError::ValidationFailed(format!("cannot plan '{goal}'")));
        }
        Ok(Plan::new(vec![PlanStep::new("draft", "write").with_input(json!({"goal": goal}))]))
    }

    async fn adapt(&self, plan: &Plan, _feedback: &[StepFeedback]) -> DomainResult<Plan> {
        self.adaptations.fetch_add(1, Ordering::SeqCst);
        let mut steps = plan.steps.clone();
        steps.push(PlanStep::new(format!("revise-{}", steps.len()), "revise"));
        Ok(Plan::new(steps))
    }
}

/// Returns scripted scores; the last one repeats.
struct ScriptedScorer {
    scores: Mutex<VecDeque<f64>>,
    threshold: f64,
}

impl ScriptedScorer {
    fn new(scores: &[f64], threshold: f64) -> Self {
        Self {
            scores: Mutex::new(scores.iter().copied().collect()),
            threshold,
        }
    }
}

#[async_trait]
impl Scorer for ScriptedScorer {
    async fn score(&self, _goal: &str, _output: &Value) -> DomainResult<Assessment> {
        let mut scores = self.scores.lock().await;
        let score = if scores.len() > 1 {
            scores.pop_front().unwrap_or_default()
        } else {
            scores.front().copied().unwrap_or_default()
        };
        Ok(Assessment::new(score, score >= self.threshold).with_criterion("quality", score))
    }
}

struct EchoExecutor {
    delay: Duration,
    fail: bool,
}

impl EchoExecutor {
    fn instant() -> Self {
        Self {
            delay: Duration::ZERO,
            fail: false,
        }
    }
}

#[async_trait]
impl PlanExecutor for EchoExecutor {
    async fn execute_plan(&self, plan: &Plan, _context: &Value) -> DomainResult<PlanExecution> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(DomainError::ExecutionFailed("tool crashed".to_string()));
        }
        Ok(PlanExecution {
            output: json!({"steps": plan.steps.len(), "revision": plan.revision}),
            feedback: plan
                .steps
                .iter()
                .map(|s| StepFeedback {
                    step_id: s.id.clone(),
                    success: true,
                    output: Value::Null,
                    error: None,
                })
                .collect(),
        })
    }
}

fn controller(scores: &[f64], config: IterationConfig) -> (IterationController, Arc<CountingPlanner>) {
    let planner = Arc::new(CountingPlanner::default());
    let scorer = Arc::new(ScriptedScorer::new(scores, 0.9));
    (IterationController::new(planner.clone(), scorer, config), planner)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_success_on_first_iteration() {
    let (controller, planner) = controller(&[0.95], IterationConfig::default());

    let outcome = controller
        .run("write a summary", None, &EchoExecutor::instant(), &Value::Null)
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.status, IterationStatus::Succeeded);
    assert_eq!(outcome.total_iterations, 1);
    assert_eq!(outcome.adaptations_made, 0);
    assert!(!outcome.can_retry);
    assert_eq!(outcome.history.len(), 1);
    assert_eq!(outcome.history[0].decision, IterationDecision::Succeed);
    assert_eq!(outcome.final_output, Some(json!({"steps": 1, "revision": 0})));
    assert_eq!(planner.adaptations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_total_duration_covers_every_iteration() {
    let (controller, _) = controller(&[0.3, 0.6, 0.92], IterationConfig::default());
    let executor = EchoExecutor {
        delay: Duration::from_millis(30),
        fail: false,
    };

    let outcome = controller.run("write a summary", None, &executor, &Value::Null).await;

    assert_eq!(outcome.total_iterations, 3);
    let per_iteration: u64 = outcome.history.iter().map(|r| r.duration_ms).sum();
    assert!(outcome.history.iter().all(|r| r.duration_ms >= 30));
    assert!(outcome.total_duration_ms >= per_iteration);
    assert!(outcome.total_duration_ms >= 90);
}

#[tokio::test]
async fn test_improvement_continues_until_success() {
    let (controller, _) = controller(&[0.3, 0.6, 0.92], IterationConfig::default());

    let outcome = controller
        .run("goal", None, &EchoExecutor::instant(), &Value::Null)
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.total_iterations, 3);
    let decisions: Vec<IterationDecision> = outcome.history.iter().map(|r| r.decision).collect();
    assert_eq!(
        decisions,
        vec![
            IterationDecision::Continue,
            IterationDecision::Continue,
            IterationDecision::Succeed
        ]
    );
}

#[tokio::test]
async fn test_consecutive_degradation_terminates() {
    let config = IterationConfig {
        max_iterations: 10,
        max_degradations: 2,
        degradation_margin: 0.05,
        ..IterationConfig::default()
    };
    let (controller, planner) = controller(&[0.6, 0.5, 0.4], config);

    let outcome = controller
        .run("goal", None, &EchoExecutor::instant(), &Value::Null)
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.status, IterationStatus::Terminated);
    assert_eq!(outcome.total_iterations, 3);
    assert!(outcome.termination_reason.contains("degraded"));
    assert!(!outcome.can_retry);

    let decisions: Vec<IterationDecision> = outcome.history.iter().map(|r| r.decision).collect();
    assert_eq!(
        decisions,
        vec![
            IterationDecision::Continue,
            IterationDecision::Adapt,
            IterationDecision::Terminate
        ]
    );
    assert_eq!(outcome.adaptations_made, 1);
    assert_eq!(planner.adaptations.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.final_plan.revision, 1);
    assert_eq!(outcome.final_plan.steps.len(), 2);
}

#[tokio::test]
async fn test_max_iterations_terminates_with_retry() {
    let config = IterationConfig {
        max_iterations: 3,
        ..IterationConfig::default()
    };
    let (controller, _) = controller(&[0.1, 0.3, 0.5, 0.7], config);

    let outcome = controller
        .run("goal", None, &EchoExecutor::instant(), &Value::Null)
        .await;

    assert_eq!(outcome.status, IterationStatus::Terminated);
    assert_eq!(outcome.total_iterations, 3);
    assert!(outcome.termination_reason.contains("max iterations"));
    assert!(outcome.can_retry);
    let final_score = outcome.final_assessment.map(|a| a.overall_score).unwrap();
    assert!((final_score - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_initial_plan_skips_planner() {
    let planner = Arc::new(CountingPlanner {
        fail_planning: true,
        ..CountingPlanner::default()
    });
    let scorer = Arc::new(ScriptedScorer::new(&[0.99], 0.9));
    let controller = IterationController::new(planner, scorer, IterationConfig::default());

    let plan = Plan::new(vec![PlanStep::new("a", "x"), PlanStep::new("b", "y")]);
    let outcome = controller
        .run("goal", Some(plan.clone()), &EchoExecutor::instant(), &Value::Null)
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.final_plan.id, plan.id);
}

#[tokio::test]
async fn test_planning_failure_is_reported() {
    let planner = Arc::new(CountingPlanner {
        fail_planning: true,
        ..CountingPlanner::default()
    });
    let scorer = Arc::new(ScriptedScorer::new(&[0.99], 0.9));
    let controller = IterationController::new(planner, scorer, IterationConfig::default());

    let outcome = controller
        .run("impossible", None, &EchoExecutor::instant(), &Value::Null)
        .await;

    assert_eq!(outcome.status, IterationStatus::Failed);
    assert_eq!(outcome.total_iterations, 0);
    assert!(outcome.history.is_empty());
    assert!(outcome.termination_reason.contains("planning failed"));
}

#[tokio::test]
async fn test_execution_failure_is_reported() {
    let (controller, _) = controller(&[0.5], IterationConfig::default());
    let executor = EchoExecutor {
        delay: Duration::ZERO,
        fail: true,
    };

    let outcome = controller.run("goal", None, &executor, &Value::Null).await;

    assert_eq!(outcome.status, IterationStatus::Failed);
    assert_eq!(outcome.total_iterations, 1);
    assert_eq!(outcome.history.len(), 1);
    assert_eq!(outcome.history[0].decision, IterationDecision::Terminate);
    assert!(outcome.termination_reason.contains("tool crashed"));
    assert!(outcome.can_retry);
}

#[tokio::test]
async fn test_iteration_timeout() {
    let config = IterationConfig {
        iteration_timeout_secs: 1,
        ..IterationConfig::default()
    };
    let (controller, _) = controller(&[0.5], config);
    let executor = EchoExecutor {
        delay: Duration::from_secs(5),
        fail: false,
    };

    let outcome = controller.run("goal", None, &executor, &Value::Null).await;

    assert_eq!(outcome.status, IterationStatus::Failed);
    assert!(outcome.termination_reason.contains("timed out"));
}

#[tokio::test]
async fn test_shutdown_interrupts_running_loop() {
    let (controller, _) = controller(&[0.5], IterationConfig::default());
    let controller = Arc::new(controller);

    let runner = {
        let controller = controller.clone();
        tokio::spawn(async move {
            let executor = EchoExecutor {
                delay: Duration::from_secs(10),
                fail: false,
            };
            controller.run("goal", None, &executor, &Value::Null).await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.shutdown();

    let outcome = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("loop did not stop after shutdown")
        .unwrap();
    assert_eq!(outcome.status, IterationStatus::Terminated);
    assert_eq!(outcome.total_iterations, 0);
    assert!(outcome.can_retry);
    assert!(outcome.termination_reason.contains("shutdown"));
}

#[tokio::test]
async fn test_outcome_is_published() {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let (controller, _) = controller(&[0.95], IterationConfig::default());
    let controller = controller.with_publisher(bus.clone());

    let outcome = controller
        .run("goal", None, &EchoExecutor::instant(), &Value::Null)
        .await;

    let event = rx.recv().await.unwrap();
    assert_eq!(event.event_type, "iteration.completed");
    assert_eq!(event.payload["loop_id"], json!(outcome.loop_id));
    assert_eq!(event.payload["total_iterations"], json!(1));
    assert_eq!(event.payload["status"], json!("succeeded"));
}
