//! Orchestrator facade.
//!
//! Owns one action registry, one workflow executor and one conflict
//! resolver, and hands out state machines and iteration controllers wired
//! to the same event bus and repositories.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Config, WorkflowDefinition, WorkflowExecution};
use crate::domain::ports::{
    ActionHandler, ConflictMediator, EventPublisher, Planner, Scorer, TaskStateRepository,
    WorkflowExecutionRepository,
};
use crate::services::action_registry::ActionRegistry;
use crate::services::conflict_resolver::{ConflictResolver, ResolutionRule};
use crate::services::dependency_resolver::DependencyResolver;
use crate::services::event_bus::EventBus;
use crate::services::iteration_controller::IterationController;
use crate::services::state_machine::AgentStateMachine;
use crate::services::workflow_executor::WorkflowExecutor;

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Config,
    registry: ActionRegistry,
    task_states: Option<Arc<dyn TaskStateRepository>>,
    executions: Option<Arc<dyn WorkflowExecutionRepository>>,
    rules: Vec<Arc<dyn ResolutionRule>>,
    mediator: Option<Arc<dyn ConflictMediator>>,
    event_bus: Option<Arc<EventBus>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn action(mut self, action_id: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.registry.register(action_id, handler);
        self
    }

    pub fn action_fn<F, Fut>(mut self, action_id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DomainResult<Value>> + Send + 'static,
    {
        self.registry.register_fn(action_id, f);
        self
    }

    pub fn task_state_repository(mut self, repository: Arc<dyn TaskStateRepository>) -> Self {
        self.task_states = Some(repository);
        self
    }

    pub fn execution_repository(mut self, repository: Arc<dyn WorkflowExecutionRepository>) -> Self {
        self.executions = Some(repository);
        self
    }

    pub fn rule(mut self, rule: Arc<dyn ResolutionRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn mediator(mut self, mediator: Arc<dyn ConflictMediator>) -> Self {
        self.mediator = Some(mediator);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn build(self) -> Orchestrator {
        let event_bus = self.event_bus.unwrap_or_default();
        let publisher: Arc<dyn EventPublisher> = event_bus.clone();

        let mut executor = WorkflowExecutor::new(Arc::new(self.registry), self.config.workflow.clone())
            .with_publisher(publisher);
        if let Some(repository) = &self.executions {
            executor = executor.with_repository(repository.clone());
        }

        let mut resolver = ConflictResolver::new(self.config.conflict.clone());
        for rule in self.rules {
            resolver = resolver.with_rule(rule);
        }
        if let Some(mediator) = self.mediator {
            resolver = resolver.with_mediator(mediator);
        }

        Orchestrator {
            config: self.config,
            executor: Arc::new(executor),
            dependency_resolver: DependencyResolver::new(),
            workflows: RwLock::new(HashMap::new()),
            resolver: Arc::new(resolver),
            event_bus,
            task_states: self.task_states,
            executions: self.executions,
            history: RwLock::new(VecDeque::new()),
        }
    }
}

pub struct Orchestrator {
    config: Config,
    executor: Arc<WorkflowExecutor>,
    dependency_resolver: DependencyResolver,
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
    resolver: Arc<ConflictResolver>,
    event_bus: Arc<EventBus>,
    task_states: Option<Arc<dyn TaskStateRepository>>,
    executions: Option<Arc<dyn WorkflowExecutionRepository>>,
    /// Finished executions, newest last.
    history: RwLock<VecDeque<WorkflowExecution>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ========================================================================
    // Workflow registry
    // ========================================================================

    /// Validate and register a workflow. Cycles, malformed groups and
    /// unknown action ids are rejected here, before any execution.
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> DomainResult<()> {
        self.dependency_resolver.validate(&definition)?;
        self.executor
            .registry()
            .ensure_registered(definition.action_ids())?;

        info!(
            workflow = %definition.id,
            trigger = %definition.trigger,
            steps = definition.steps.len(),
            "workflow registered"
        );
        let payload = json!({"workflow_id": definition.id, "trigger": definition.trigger});
        if self
            .workflows
            .write()
            .await
            .insert(definition.id.clone(), definition)
            .is_some()
        {
            warn!(payload = %payload, "replaced existing workflow definition");
        }
        self.event_bus.emit("workflow.registered", payload).await;
        Ok(())
    }

    pub async fn unregister_workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        let removed = self.workflows.write().await.remove(workflow_id);
        if removed.is_some() {
            info!(workflow = workflow_id, "workflow unregistered");
        }
        removed
    }

    /// Registered workflows, sorted by id.
    pub async fn workflows(&self) -> Vec<WorkflowDefinition> {
        let mut workflows: Vec<WorkflowDefinition> =
            self.workflows.read().await.values().cloned().collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    pub async fn workflow(&self, workflow_id: &str) -> DomainResult<WorkflowDefinition> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| DomainError::WorkflowNotFound(workflow_id.to_string()))
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run every workflow bound to `trigger`, concurrently. Results are in
    /// workflow id order.
    pub async fn handle_event(&self, trigger: &str, payload: Value) -> DomainResult<Vec<WorkflowExecution>> {
        let bound: Vec<WorkflowDefinition> = self
            .workflows()
            .await
            .into_iter()
            .filter(|w| w.trigger == trigger)
            .collect();
        if bound.is_empty() {
            info!(trigger, "no workflow bound to trigger");
            return Ok(Vec::new());
        }

        let runs = bound
            .iter()
            .map(|definition| self.executor.execute(definition, payload.clone()));
        let mut executions = Vec::with_capacity(bound.len());
        for result in join_all(runs).await {
            let execution = result?;
            self.remember(execution.clone()).await;
            executions.push(execution);
        }
        Ok(executions)
    }

    pub async fn execute_workflow(&self, workflow_id: &str, payload: Value) -> DomainResult<WorkflowExecution> {
        let definition = self.workflow(workflow_id).await?;
        let execution = self.executor.execute(&definition, payload).await?;
        self.remember(execution.clone()).await;
        Ok(execution)
    }

    /// Start an execution in the background. The returned id can be passed
    /// to [`cancel_execution`](Self::cancel_execution) right away.
    pub async fn spawn_workflow(
        self: &Arc<Self>,
        workflow_id: &str,
        payload: Value,
    ) -> DomainResult<(Uuid, JoinHandle<DomainResult<WorkflowExecution>>)> {
        let definition = self.workflow(workflow_id).await?;
        let execution = WorkflowExecution::new(&definition, payload);
        let execution_id = execution.id;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let finished = this.executor.run(&definition, execution).await?;
            this.remember(finished.clone()).await;
            Ok(finished)
        });
        Ok((execution_id, handle))
    }

    /// Re-run every unfinished step of a persisted execution.
    pub async fn resume_execution(&self, execution_id: Uuid) -> DomainResult<WorkflowExecution> {
        let execution = self
            .load_execution(execution_id)
            .await?
            .ok_or(DomainError::ExecutionNotFound(execution_id))?;
        let definition = self.workflow(&execution.workflow_id).await?;
        let resumed = self.executor.resume(&definition, execution).await?;
        self.remember(resumed.clone()).await;
        Ok(resumed)
    }

    pub async fn cancel_execution(&self, execution_id: Uuid) -> bool {
        self.executor.cancel(execution_id).await
    }

    /// Load an execution from the repository, falling back to in-memory
    /// history.
    pub async fn load_execution(&self, execution_id: Uuid) -> DomainResult<Option<WorkflowExecution>> {
        if let Some(repository) = &self.executions {
            if let Some(execution) = repository.get(execution_id).await? {
                return Ok(Some(execution));
            }
        }
        Ok(self
            .history
            .read()
            .await
            .iter()
            .rev()
            .find(|e| e.id == execution_id)
            .cloned())
    }

    /// Recently finished executions, newest last.
    pub async fn history(&self) -> Vec<WorkflowExecution> {
        self.history.read().await.iter().cloned().collect()
    }

    async fn remember(&self, execution: WorkflowExecution) {
        let limit = self.config.workflow.history_limit;
        let mut history = self.history.write().await;
        history.push_back(execution);
        while history.len() > limit {
            history.pop_front();
        }
    }

    // ========================================================================
    // Components
    // ========================================================================

    /// State machine for one task, restored from the repository when one
    /// is configured.
    pub async fn state_machine(&self, agent_name: &str, task_id: Uuid) -> DomainResult<AgentStateMachine> {
        let publisher: Arc<dyn EventPublisher> = self.event_bus.clone();
        let machine = match &self.task_states {
            Some(repository) => AgentStateMachine::initialize(repository.clone(), agent_name, task_id).await?,
            None => AgentStateMachine::detached(agent_name, task_id),
        };
        Ok(machine.with_publisher(publisher))
    }

    pub fn iteration_controller(&self, planner: Arc<dyn Planner>, scorer: Arc<dyn Scorer>) -> IterationController {
        IterationController::new(planner, scorer, self.config.iteration.clone())
            .with_publisher(self.event_bus.clone())
    }

    pub fn resolver(&self) -> Arc<ConflictResolver> {
        self.resolver.clone()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn executor(&self) -> Arc<WorkflowExecutor> {
        self.executor.clone()
    }
}
