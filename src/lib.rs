//! Taskloom - agent orchestration engine
//!
//! Taskloom coordinates autonomous agents: it tracks each task's lifecycle
//! with a persisted state machine, drives plan/execute/score loops toward a
//! goal, executes event-triggered DAG workflows and reconciles conflicting
//! outputs from multiple sources.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors and ports
//! - **Service Layer** (`services`): state machine, iteration controller,
//!   workflow executor, conflict resolver and the orchestrator facade
//! - **Adapters** (`adapters`): SQLite persistence for task states and
//!   workflow executions
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line inspection tools
//!
//! # Example
//!
//! ```ignore
//! use taskloom::services::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::builder()
//!         .action_fn("echo", |input| async move { Ok(input) })
//!         .build();
//!     orchestrator.register_workflow(definition).await?;
//!     let executions = orchestrator.handle_event("order.created", payload).await;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::models::{
    AgentState, Config, Conflict, ConflictItem, EventType, ExecutionStatus, IterationOutcome,
    Plan, Resolution, ResolutionStrategy, StateEvent, TaskState, WorkflowDefinition,
    WorkflowExecution,
};
pub use domain::ports::{
    ActionHandler, ConflictMediator, EventPublisher, PlanExecutor, Planner, Scorer,
    TaskStateRepository, WorkflowExecutionRepository,
};
pub use domain::{DomainError, DomainResult};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    AgentStateMachine, ConflictResolver, DependencyResolver, IterationController, Orchestrator,
    WorkflowExecutor,
};
