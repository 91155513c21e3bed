//! Port trait definitions (Hexagonal Architecture)
//!
//! Async interfaces the engine consumes. Adapters implement the repository
//! ports; callers supply planners, scorers, action handlers and mediators.

pub mod action;
pub mod event_publisher;
pub mod iteration;
pub mod mediator;
pub mod task_state_repository;
pub mod workflow_execution_repository;

pub use action::ActionHandler;
pub use event_publisher::EventPublisher;
pub use iteration::{PlanExecutor, Planner, Scorer};
pub use mediator::{ConflictMediator, MediatedValue};
pub use task_state_repository::TaskStateRepository;
pub use workflow_execution_repository::WorkflowExecutionRepository;
