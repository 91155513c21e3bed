pub mod agent_state;
pub mod config;
pub mod conflict;
pub mod iteration;
pub mod workflow;

pub use agent_state::{
    AgentState, EventType, PauseSnapshot, StateEvent, StepError, TaskContext, TaskState,
    TransitionRecord, WaitDescriptor, WaitKind,
};
pub use config::{
    Config, ConflictConfig, DatabaseConfig, IterationConfig, LogFormat, LoggingConfig,
    RotationPolicy, WorkflowConfig,
};
pub use conflict::{Conflict, ConflictItem, Resolution, ResolutionStrategy};
pub use iteration::{
    Assessment, IterationDecision, IterationOutcome, IterationRecord, IterationState,
    IterationStatus, Plan, PlanExecution, PlanStep, StepFeedback,
};
pub use workflow::{
    Aggregation, Condition, ConditionOperator, ExecutionStatus, GroupOutcome, InputSource,
    ParallelGroup, StepConfig, StepResult, StepStatus, WorkflowDefinition, WorkflowExecution,
    WorkflowHooks, WorkflowStep,
};
