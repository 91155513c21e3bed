//! Engine services.

pub mod action_registry;
pub mod conflict_resolver;
pub mod dependency_resolver;
pub mod event_bus;
pub mod iteration_controller;
pub mod orchestrator;
pub mod state_machine;
pub mod workflow_executor;

pub use action_registry::{ActionRegistry, FnAction};
pub use conflict_resolver::{
    ConflictResolver, HighConfidenceSingleSource, ResolutionRule, Selection, TrustedSource,
};
pub use dependency_resolver::{DependencyResolver, ExecutionUnit};
pub use event_bus::{EventBus, EventBusConfig, OrchestratorEvent};
pub use iteration_controller::IterationController;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use state_machine::AgentStateMachine;
pub use workflow_executor::WorkflowExecutor;
