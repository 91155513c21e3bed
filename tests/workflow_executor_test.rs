//! Integration tests for the workflow executor: ordering, guards, retries,
//! timeouts, parallel groups, cancellation and resume.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use taskloom::adapters::sqlite::{create_migrated_test_pool, SqliteWorkflowExecutionRepository};
use taskloom::domain::errors::DomainError;
use taskloom::domain::models::{
    Aggregation, Condition, ExecutionStatus, InputSource, ParallelGroup, StepStatus, WorkflowConfig,
    WorkflowDefinition, WorkflowExecution, WorkflowStep,
};
use taskloom::domain::ports::WorkflowExecutionRepository;
use taskloom::services::{ActionRegistry, WorkflowExecutor};

fn fast_config() -> WorkflowConfig {
    WorkflowConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        ..WorkflowConfig::default()
    }
}

/// Registers `id` as a handler that counts calls and echoes its input.
fn counting(registry: &mut ActionRegistry, id: &str) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    registry.register_fn(id, move |input| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(input)
        }
    });
    calls
}

fn failing(registry: &mut ActionRegistry, id: &str) {
    let action_id = id.to_string();
    registry.register_fn(id, move |_| {
        let action_id = action_id.clone();
        async move {
            Err(DomainError::ActionFailed {
                action_id,
                message: "boom".to_string(),
            })
        }
    });
}

fn executor(registry: ActionRegistry) -> WorkflowExecutor {
    WorkflowExecutor::new(Arc::new(registry), fast_config())
}

#[tokio::test]
async fn test_false_guard_skips_step_and_dependents() {
    let mut registry = ActionRegistry::new();
    let a_calls = counting(&mut registry, "a");
    let b_calls = counting(&mut registry, "b");
    let c_calls = counting(&mut registry, "c");

    let def = WorkflowDefinition::new("guarded", "Guarded", "evt")
        .with_step(WorkflowStep::new("a", "a"))
        .with_step(
            WorkflowStep::new("b", "b")
                .depends_on("a")
                .with_condition(Condition::equals("trigger.mode", json!("full"))),
        )
        .with_step(WorkflowStep::new("c", "c").depends_on("b"));

    let exec = executor(registry)
        .execute(&def, json!({"mode": "lite"}))
        .await
        .unwrap();

    assert_eq!(exec.execution_order, vec!["a", "b", "c"]);
    assert_eq!(exec.result("a").unwrap().status, StepStatus::Completed);
    assert_eq!(exec.result("b").unwrap().status, StepStatus::Skipped);
    assert_eq!(exec.result("c").unwrap().status, StepStatus::Skipped);
    assert!(exec.result("c").unwrap().error.as_deref().unwrap().contains("'b'"));
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    assert_eq!(exec.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_outputs_flow_through_input_mappings() {
    let mut registry = ActionRegistry::new();
    registry.register_fn("fetch", |input: Value| async move {
        Ok(json!({"items": [input["id"].clone(), 2, 3]}))
    });
    registry.register_fn("count", |input: Value| async move {
        let n = input["items"].as_array().map_or(0, Vec::len);
        Ok(json!({"count": n, "first": input["first"].clone()}))
    });

    let def = WorkflowDefinition::new("flow", "Flow", "evt")
        .with_step(WorkflowStep::new("fetch", "fetch"))
        .with_step(
            WorkflowStep::new("count", "count")
                .depends_on("fetch")
                .with_input("items", InputSource::step("fetch", Some("items")))
                .with_input("first", InputSource::step("fetch", Some("items.0"))),
        );

    let exec = executor(registry).execute(&def, json!({"id": 7})).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.data["count"], json!({"count": 3, "first": 7}));
    assert_eq!(exec.data["trigger"], json!({"id": 7}));
}

#[tokio::test]
async fn test_step_timeout_fails_execution() {
    let mut registry = ActionRegistry::new();
    registry.register_fn("slow", |_| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    });
    let after_calls = counting(&mut registry, "after");

    let def = WorkflowDefinition::new("timeouts", "Timeouts", "evt")
        .with_step(WorkflowStep::new("slow", "slow").with_timeout_ms(50))
        .with_step(WorkflowStep::new("after", "after").depends_on("slow"));

    let exec = executor(registry).execute(&def, Value::Null).await.unwrap();

    let slow = exec.result("slow").unwrap();
    assert_eq!(slow.status, StepStatus::Failed);
    assert_eq!(slow.attempts, 1);
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(exec.result("after").unwrap().status, StepStatus::Skipped);
    assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.reason.as_deref().unwrap().contains("slow"));
}

#[tokio::test]
async fn test_retries_until_success() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut registry = ActionRegistry::new();
    registry.register_fn("flaky", move |_| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DomainError::ActionFailed {
                    action_id: "flaky".to_string(),
                    message: "transient".to_string(),
                })
            } else {
                Ok(json!("ok"))
            }
        }
    });

    let def = WorkflowDefinition::new("retry", "Retry", "evt")
        .with_step(WorkflowStep::new("flaky", "flaky").with_retries(2));

    let exec = executor(registry).execute(&def, Value::Null).await.unwrap();

    let result = exec.result("flaky").unwrap();
    assert_eq!(result.status, StepStatus::Completed);
    assert_eq!(result.attempts, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(exec.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let mut registry = ActionRegistry::new();
    failing(&mut registry, "broken");

    let def = WorkflowDefinition::new("retry", "Retry", "evt")
        .with_step(WorkflowStep::new("broken", "broken").with_retries(1));

    let exec = executor(registry).execute(&def, Value::Null).await.unwrap();
    assert_eq!(exec.result("broken").unwrap().attempts, 2);
    assert_eq!(exec.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_non_retryable_errors_fail_immediately() {
    let mut registry = ActionRegistry::new();
    registry.register_fn("invalid", |_| async {
        Err(DomainError::ValidationFailed("bad input".to_string()))
    });

    let def = WorkflowDefinition::new("retry", "Retry", "evt")
        .with_step(WorkflowStep::new("invalid", "invalid").with_retries(3));

    let exec = executor(registry).execute(&def, Value::Null).await.unwrap();
    assert_eq!(exec.result("invalid").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_tolerated_failure_gives_partial_success() {
    let mut registry = ActionRegistry::new();
    counting(&mut registry, "ok");
    failing(&mut registry, "optional");
    let downstream = counting(&mut registry, "report");

    let def = WorkflowDefinition::new("partial", "Partial", "evt")
        .with_step(WorkflowStep::new("ok", "ok"))
        .with_step(WorkflowStep::new("optional", "optional").allow_failure())
        .with_step(WorkflowStep::new("report", "report").depends_on("optional"))
        .allow_partial_success();

    let exec = executor(registry).execute(&def, Value::Null).await.unwrap();

    assert_eq!(exec.result("optional").unwrap().status, StepStatus::Failed);
    assert_eq!(exec.result("report").unwrap().status, StepStatus::Completed);
    assert_eq!(downstream.load(Ordering::SeqCst), 1);
    assert_eq!(exec.status, ExecutionStatus::PartialSuccess);
    assert!(exec.reason.as_deref().unwrap().contains("optional"));
}

#[tokio::test]
async fn test_parallel_group_aggregation() {
    let mut registry = ActionRegistry::new();
    counting(&mut registry, "ok");
    failing(&mut registry, "bad");
    let merge_calls = counting(&mut registry, "merge");

    let def = WorkflowDefinition::new("fanout", "Fan-out", "evt")
        .with_step(WorkflowStep::new("left", "ok"))
        .with_step(WorkflowStep::new("middle", "ok"))
        .with_step(WorkflowStep::new("right", "bad").allow_failure())
        .with_step(
            WorkflowStep::new("merge", "merge")
                .depends_on("left")
                .depends_on("middle")
                .depends_on("right"),
        )
        .with_group(ParallelGroup::new(
            "sources",
            &["left", "middle", "right"],
            Aggregation::Majority,
        ))
        .allow_partial_success();

    let exec = executor(registry).execute(&def, Value::Null).await.unwrap();

    assert_eq!(exec.group_outcomes.len(), 1);
    let outcome = &exec.group_outcomes[0];
    assert_eq!(outcome.group_id, "sources");
    assert_eq!(outcome.succeeded, 2);
    assert_eq!(outcome.failed, 1);
    assert!(outcome.satisfied);
    assert_eq!(merge_calls.load(Ordering::SeqCst), 1);
    assert_eq!(exec.execution_order.last().map(String::as_str), Some("merge"));
    assert_eq!(exec.status, ExecutionStatus::PartialSuccess);
}

#[tokio::test]
async fn test_group_members_run_concurrently() {
    let mut registry = ActionRegistry::new();
    registry.register_fn("sleep", |_| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Value::Null)
    });

    let def = WorkflowDefinition::new("par", "Parallel", "evt")
        .with_step(WorkflowStep::new("one", "sleep"))
        .with_step(WorkflowStep::new("two", "sleep"))
        .with_step(WorkflowStep::new("three", "sleep"))
        .with_group(ParallelGroup::new("all", &["one", "two", "three"], Aggregation::All));

    let start = std::time::Instant::now();
    let exec = executor(registry).execute(&def, Value::Null).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert!(start.elapsed() < Duration::from_millis(550));
}

#[tokio::test]
async fn test_missing_handler_fails_step() {
    let def = WorkflowDefinition::new("nohandler", "No handler", "evt")
        .with_step(WorkflowStep::new("a", "unregistered"));

    let exec = executor(ActionRegistry::new())
        .execute(&def, Value::Null)
        .await
        .unwrap();

    let result = exec.result("a").unwrap();
    assert_eq!(result.status, StepStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("unregistered"));
    assert_eq!(exec.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_cyclic_definition_is_rejected() {
    let def = WorkflowDefinition::new("cyclic", "Cyclic", "evt")
        .with_step(WorkflowStep::new("a", "noop").depends_on("b"))
        .with_step(WorkflowStep::new("b", "noop").depends_on("a"));

    let err = executor(ActionRegistry::new())
        .execute(&def, Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::CycleDetected(_)));
}

#[tokio::test]
async fn test_cancel_marks_remaining_steps_skipped() {
    let mut registry = ActionRegistry::new();
    registry.register_fn("slow", |_| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(Value::Null)
    });
    let after_calls = counting(&mut registry, "after");

    let def = WorkflowDefinition::new("cancel", "Cancel", "evt")
        .with_step(WorkflowStep::new("slow", "slow"))
        .with_step(WorkflowStep::new("after", "after").depends_on("slow"));

    let executor = Arc::new(executor(registry));
    let execution = WorkflowExecution::new(&def, Value::Null);
    let execution_id = execution.id;

    let runner = {
        let executor = executor.clone();
        let def = def.clone();
        tokio::spawn(async move { executor.run(&def, execution).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(executor.active_executions().await.contains(&execution_id));
    assert!(executor.cancel(execution_id).await);

    let exec = runner.await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(exec.result("slow").unwrap().status, StepStatus::Skipped);
    assert_eq!(exec.result("after").unwrap().status, StepStatus::Skipped);
    assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    assert!(executor.active_executions().await.is_empty());
    assert!(!executor.cancel(execution_id).await);
}

#[tokio::test]
async fn test_cancel_during_backoff_stops_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = ActionRegistry::new();
    registry.register_fn("flaky", move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(DomainError::ActionFailed {
                action_id: "flaky".to_string(),
                message: "upstream unavailable".to_string(),
            })
        }
    });

    let def = WorkflowDefinition::new("backoff", "Backoff", "evt")
        .with_step(WorkflowStep::new("call", "flaky").with_retries(3));
    let config = WorkflowConfig {
        initial_backoff_ms: 300,
        max_backoff_ms: 1_000,
        ..WorkflowConfig::default()
    };
    let executor = Arc::new(WorkflowExecutor::new(Arc::new(registry), config));
    let execution = WorkflowExecution::new(&def, Value::Null);
    let execution_id = execution.id;

    let started = std::time::Instant::now();
    let runner = {
        let executor = executor.clone();
        let def = def.clone();
        tokio::spawn(async move { executor.run(&def, execution).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(executor.cancel(execution_id).await);

    let exec = runner.await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(exec.result("call").unwrap().status, StepStatus::Skipped);
    assert!(started.elapsed() < Duration::from_millis(280), "backoff sleep was not interrupted");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "handler invoked again after cancellation");
}

#[tokio::test]
async fn test_resume_reruns_only_unfinished_steps() {
    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();
    let mut registry = ActionRegistry::new();
    let first_calls = counting(&mut registry, "first");
    registry.register_fn("second", move |_| {
        let flag = flag.clone();
        async move {
            if flag.load(Ordering::SeqCst) {
                Ok(json!("done"))
            } else {
                Err(DomainError::ValidationFailed("not yet".to_string()))
            }
        }
    });

    let def = WorkflowDefinition::new("resume", "Resume", "evt")
        .with_step(WorkflowStep::new("first", "first"))
        .with_step(WorkflowStep::new("second", "second").depends_on("first"));

    let pool = create_migrated_test_pool().await.unwrap();
    let repo = Arc::new(SqliteWorkflowExecutionRepository::new(pool));
    let executor = executor(registry).with_repository(repo.clone());

    let failed = executor.execute(&def, json!({"n": 1})).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);

    let stored = repo.get(failed.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failed);

    healthy.store(true, Ordering::SeqCst);
    let resumed = executor.resume(&def, stored).await.unwrap();

    assert_eq!(resumed.id, failed.id);
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(resumed.data["second"], json!("done"));
    assert_eq!(
        repo.get(failed.id).await.unwrap().unwrap().status,
        ExecutionStatus::Completed
    );
}

#[tokio::test]
async fn test_resume_keeps_outcome_of_completed_group() {
    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();
    let mut registry = ActionRegistry::new();
    let source_calls = counting(&mut registry, "source");
    registry.register_fn("merge", move |_| {
        let flag = flag.clone();
        async move {
            if flag.load(Ordering::SeqCst) {
                Ok(json!("merged"))
            } else {
                Err(DomainError::ValidationFailed("not yet".to_string()))
            }
        }
    });

    let def = WorkflowDefinition::new("grouped", "Grouped", "evt")
        .with_step(WorkflowStep::new("left", "source"))
        .with_step(WorkflowStep::new("right", "source"))
        .with_step(WorkflowStep::new("merge", "merge").depends_on("left").depends_on("right"))
        .with_group(ParallelGroup::new("sources", &["left", "right"], Aggregation::All));

    let executor = executor(registry);
    let failed = executor.execute(&def, Value::Null).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.group_outcomes.len(), 1);

    healthy.store(true, Ordering::SeqCst);
    let resumed = executor.resume(&def, failed).await.unwrap();

    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(source_calls.load(Ordering::SeqCst), 2);
    assert_eq!(resumed.group_outcomes.len(), 1);
    let outcome = &resumed.group_outcomes[0];
    assert_eq!(outcome.group_id, "sources");
    assert_eq!(outcome.succeeded, 2);
    assert!(outcome.satisfied);
}

#[tokio::test]
async fn test_resume_rejects_foreign_execution() {
    let def = WorkflowDefinition::new("one", "One", "evt").with_step(WorkflowStep::new("a", "noop"));
    let other = WorkflowDefinition::new("two", "Two", "evt").with_step(WorkflowStep::new("a", "noop"));

    let execution = WorkflowExecution::new(&other, Value::Null);
    let err = executor(ActionRegistry::new())
        .resume(&def, execution)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::ValidationFailed(_)));
}
