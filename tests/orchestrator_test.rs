//! End-to-end tests for the orchestrator facade.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_test::assert_ok;
use uuid::Uuid;

use taskloom::adapters::sqlite::{
    create_migrated_test_pool, SqliteTaskStateRepository, SqliteWorkflowExecutionRepository,
};
use taskloom::domain::errors::DomainError;
use taskloom::domain::models::{
    AgentState, Config, ConflictItem, EventType, ExecutionStatus, ResolutionStrategy, WorkflowConfig,
    WorkflowDefinition, WorkflowStep,
};
use taskloom::services::{EventBus, Orchestrator};

fn order_workflow(id: &str) -> WorkflowDefinition {
    WorkflowDefinition::new(id, "Order intake", "order.created")
        .with_step(WorkflowStep::new("validate", "echo"))
        .with_step(WorkflowStep::new("notify", "echo").depends_on("validate"))
        .with_hooks(Some("order.processed"), Some("order.rejected"))
}

fn orchestrator() -> Orchestrator {
    Orchestrator::builder()
        .action_fn("echo", |input| async move { Ok(input) })
        .action_fn("sleep", |_| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(Value::Null)
        })
        .build()
}

#[tokio::test]
async fn test_cyclic_workflow_is_rejected_at_registration() {
    let orchestrator = orchestrator();
    let def = WorkflowDefinition::new("cyclic", "Cyclic", "evt")
        .with_step(WorkflowStep::new("a", "echo").depends_on("c"))
        .with_step(WorkflowStep::new("b", "echo").depends_on("a"))
        .with_step(WorkflowStep::new("c", "echo").depends_on("b"));

    let err = orchestrator.register_workflow(def).await.unwrap_err();
    assert!(matches!(err, DomainError::CycleDetected(_)));
    assert!(orchestrator.workflows().await.is_empty());
}

#[tokio::test]
async fn test_unknown_action_is_rejected_at_registration() {
    let orchestrator = orchestrator();
    let def = WorkflowDefinition::new("bad", "Bad", "evt")
        .with_step(WorkflowStep::new("a", "does.not.exist"));

    let err = orchestrator.register_workflow(def).await.unwrap_err();
    assert!(matches!(err, DomainError::NoHandler(ref id) if id == "does.not.exist"));
}

#[tokio::test]
async fn test_handle_event_runs_bound_workflows() {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let orchestrator = Orchestrator::builder()
        .event_bus(bus.clone())
        .action_fn("echo", |input| async move { Ok(input) })
        .action_fn("count", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .build();

    assert_ok!(orchestrator.register_workflow(order_workflow("orders-a")).await);
    assert_ok!(orchestrator.register_workflow(order_workflow("orders-b")).await);
    assert_ok!(
        orchestrator
            .register_workflow(
                WorkflowDefinition::new("audit", "Audit", "user.deleted")
                    .with_step(WorkflowStep::new("log", "count"))
            )
            .await
    );

    let executions = orchestrator
        .handle_event("order.created", json!({"order_id": 42}))
        .await
        .unwrap();

    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].workflow_id, "orders-a");
    assert_eq!(executions[1].workflow_id, "orders-b");
    assert!(executions.iter().all(|e| e.status == ExecutionStatus::Completed));
    assert_eq!(executions[0].data["notify"], json!({"order_id": 42}));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.history().await.len(), 2);

    let mut hooks = 0;
    while let Ok(event) = rx.try_recv() {
        if event.event_type == "order.processed" {
            hooks += 1;
            assert_eq!(event.payload["status"], json!("completed"));
        }
    }
    assert_eq!(hooks, 2);

    let none = orchestrator.handle_event("nothing.bound", Value::Null).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_execute_unknown_workflow() {
    let err = orchestrator()
        .execute_workflow("missing", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::WorkflowNotFound(_)));
}

#[tokio::test]
async fn test_history_is_bounded() {
    let config = Config {
        workflow: WorkflowConfig {
            history_limit: 2,
            ..WorkflowConfig::default()
        },
        ..Config::default()
    };
    let orchestrator = Orchestrator::builder()
        .config(config)
        .action_fn("echo", |input| async move { Ok(input) })
        .build();
    orchestrator.register_workflow(order_workflow("orders")).await.unwrap();

    let mut ids = Vec::new();
    for n in 0..3 {
        let exec = orchestrator
            .execute_workflow("orders", json!({"n": n}))
            .await
            .unwrap();
        ids.push(exec.id);
    }

    let history = orchestrator.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, ids[1]);
    assert_eq!(history[1].id, ids[2]);
    assert!(orchestrator.load_execution(ids[0]).await.unwrap().is_none());
    assert!(orchestrator.load_execution(ids[2]).await.unwrap().is_some());
}

#[tokio::test]
async fn test_spawn_and_cancel() {
    let orchestrator = Arc::new(orchestrator());
    orchestrator
        .register_workflow(
            WorkflowDefinition::new("slow", "Slow", "evt")
                .with_step(WorkflowStep::new("wait", "sleep"))
                .with_step(WorkflowStep::new("after", "echo").depends_on("wait")),
        )
        .await
        .unwrap();

    let (execution_id, handle) = orchestrator.spawn_workflow("slow", Value::Null).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(orchestrator.cancel_execution(execution_id).await);

    let execution = handle.await.unwrap().unwrap();
    assert_eq!(execution.id, execution_id);
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(
        orchestrator.load_execution(execution_id).await.unwrap().map(|e| e.status),
        Some(ExecutionStatus::Cancelled)
    );
}

#[tokio::test]
async fn test_resume_from_repository() {
    let pool = create_migrated_test_pool().await.unwrap();
    let executions = Arc::new(SqliteWorkflowExecutionRepository::new(pool));
    let orchestrator = Orchestrator::builder()
        .execution_repository(executions.clone())
        .action_fn("echo", |input| async move { Ok(input) })
        .build();
    orchestrator.register_workflow(order_workflow("orders")).await.unwrap();

    let first = orchestrator
        .execute_workflow("orders", json!({"order_id": 1}))
        .await
        .unwrap();
    let resumed = orchestrator.resume_execution(first.id).await.unwrap();
    assert_eq!(resumed.id, first.id);
    assert_eq!(resumed.status, ExecutionStatus::Completed);

    let err = orchestrator.resume_execution(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, DomainError::ExecutionNotFound(_)));
}

#[tokio::test]
async fn test_state_machines_share_repository_and_bus() {
    let pool = create_migrated_test_pool().await.unwrap();
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let orchestrator = Orchestrator::builder()
        .event_bus(bus)
        .task_state_repository(Arc::new(SqliteTaskStateRepository::new(pool)))
        .build();
    let task_id = Uuid::new_v4();

    let mut machine = orchestrator.state_machine("researcher", task_id).await.unwrap();
    machine.fire(EventType::Start).await.unwrap();
    drop(machine);

    let restored = orchestrator.state_machine("researcher", task_id).await.unwrap();
    assert_eq!(restored.current_state(), AgentState::Initializing);

    let event = rx.recv().await.unwrap();
    assert_eq!(event.event_type, "state.transitioned");
    assert_eq!(event.payload["agent"], json!("researcher"));
}

#[tokio::test]
async fn test_shared_conflict_resolver() {
    let orchestrator = orchestrator();
    let resolver = orchestrator.resolver();

    let resolution = resolver
        .reconcile(
            "headcount",
            vec![
                ConflictItem::new("hr", json!(120), 0.7),
                ConflictItem::new("finance", json!(80), 0.6),
            ],
            Some(ResolutionStrategy::HighestConfidence),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolution.value, json!(120));
    assert_eq!(orchestrator.resolver().history().await.len(), 1);
}
