//! Workflow executor: runs a validated step graph in dependency order.
//!
//! Execution proceeds in rounds. Every round launches each ready unit (a
//! single step or a whole parallel group) concurrently, bounded by a
//! semaphore, and waits for all of them before the next round. A unit is
//! ready once every dependency outside it has a terminal result.
//!
//! Each attempt runs the handler in a spawned task raced against the step
//! deadline. On expiry the attempt is recorded as a `StepTimeout` failure and
//! the task is detached, so handlers see at-least-once semantics.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Aggregation, ExecutionStatus, GroupOutcome, StepResult, StepStatus, WorkflowConfig, WorkflowDefinition,
    WorkflowExecution, WorkflowStep,
};
use crate::domain::ports::{ActionHandler, EventPublisher, WorkflowExecutionRepository};
use crate::services::action_registry::ActionRegistry;
use crate::services::dependency_resolver::{DependencyResolver, ExecutionUnit};

const CANCELLED_REASON: &str = "execution cancelled";

/// Cooperative cancellation flag for one execution. Waiters are woken when
/// the flag is raised.
#[derive(Debug, Default)]
struct CancelSignal {
    raised: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn cancel(&self) {
        self.raised.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is raised.
    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Retry and deadline settings for one step.
#[derive(Debug, Clone)]
struct AttemptPolicy {
    timeout: Duration,
    retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
}

impl AttemptPolicy {
    fn for_step(step: &WorkflowStep, config: &WorkflowConfig) -> Self {
        Self {
            timeout: Duration::from_millis(step.config.timeout_ms.unwrap_or(config.default_timeout_ms)),
            retries: step.config.retry_count,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier.max(1.0),
        }
    }
}

pub struct WorkflowExecutor {
    registry: Arc<ActionRegistry>,
    resolver: DependencyResolver,
    config: WorkflowConfig,
    publisher: Option<Arc<dyn EventPublisher>>,
    repository: Option<Arc<dyn WorkflowExecutionRepository>>,
    /// Cancellation signals of in-flight executions.
    active: RwLock<HashMap<Uuid, Arc<CancelSignal>>>,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<ActionRegistry>, config: WorkflowConfig) -> Self {
        Self {
            registry,
            resolver: DependencyResolver::new(),
            config,
            publisher: None,
            repository: None,
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Persist a checkpoint of the execution after every round.
    pub fn with_repository(mut self, repository: Arc<dyn WorkflowExecutionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Run `definition` against a trigger payload.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        payload: Value,
    ) -> DomainResult<WorkflowExecution> {
        self.run(definition, WorkflowExecution::new(definition, payload))
            .await
    }

    /// Continue an interrupted execution. Every step that has not completed
    /// runs again.
    pub async fn resume(
        &self,
        definition: &WorkflowDefinition,
        mut execution: WorkflowExecution,
    ) -> DomainResult<WorkflowExecution> {
        if execution.workflow_id != definition.id {
            return Err(DomainError::ValidationFailed(format!(
                "execution {} belongs to workflow {}, not {}",
                execution.id, execution.workflow_id, definition.id
            )));
        }
        for step in &definition.steps {
            execution
                .step_results
                .entry(step.id.clone())
                .or_insert_with(|| StepResult::pending(&step.id));
        }
        execution.reset_unfinished();
        info!(
            execution_id = %execution.id,
            workflow = %definition.id,
            completed = execution.completed_count(),
            "resuming workflow execution"
        );
        self.run(definition, execution).await
    }

    /// Run a prepared execution to completion. Use this instead of
    /// [`execute`](Self::execute) when the id is needed up front, e.g. to
    /// cancel from another task.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        execution: WorkflowExecution,
    ) -> DomainResult<WorkflowExecution> {
        let units = self.resolver.validate(definition)?;
        let span = tracing::info_span!(
            "workflow_execution",
            execution_id = %execution.id,
            workflow = %definition.id
        );

        let cancelled = Arc::new(CancelSignal::default());
        self.active
            .write()
            .await
            .insert(execution.id, cancelled.clone());

        let execution_id = execution.id;
        let result = self
            .run_units(definition, units, execution, cancelled)
            .instrument(span)
            .await;

        self.active.write().await.remove(&execution_id);
        result
    }

    /// Request cooperative cancellation. No new steps are scheduled and
    /// results of in-flight steps are discarded. Returns `false` if the
    /// execution is not running in this executor.
    pub async fn cancel(&self, execution_id: Uuid) -> bool {
        match self.active.read().await.get(&execution_id) {
            Some(signal) => {
                signal.cancel();
                info!(%execution_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Ids of executions currently running.
    pub async fn active_executions(&self) -> Vec<Uuid> {
        self.active.read().await.keys().copied().collect()
    }

    async fn run_units(
        &self,
        definition: &WorkflowDefinition,
        units: Vec<ExecutionUnit>,
        mut execution: WorkflowExecution,
        cancelled: Arc<CancelSignal>,
    ) -> DomainResult<WorkflowExecution> {
        let start = Instant::now();
        execution.execution_order = units
            .iter()
            .flat_map(|u| u.steps().into_iter().map(str::to_string))
            .collect();
        execution.status = ExecutionStatus::Running;
        execution.started_at.get_or_insert_with(Utc::now);
        execution.updated_at = Utc::now();
        self.checkpoint(&execution).await;

        info!(
            steps = definition.steps.len(),
            units = units.len(),
            "workflow execution started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut pending: Vec<ExecutionUnit> = units
            .into_iter()
            .filter(|unit| {
                unit.steps()
                    .iter()
                    .any(|id| !is_completed(&execution, id))
            })
            .collect();
        let mut round = 0usize;

        while !pending.is_empty() {
            if cancelled.is_cancelled() {
                break;
            }
            round += 1;

            let (ready, waiting): (Vec<ExecutionUnit>, Vec<ExecutionUnit>) = pending
                .into_iter()
                .partition(|unit| unit_ready(definition, &execution, unit));
            pending = waiting;

            if ready.is_empty() {
                // Only reachable with a result map that disagrees with the graph.
                for unit in &pending {
                    for step_id in unit.steps() {
                        mark_skipped(&mut execution, step_id, "dependencies never resolved");
                    }
                }
                pending.clear();
                break;
            }

            debug!(round, units = ready.len(), "starting round");
            let mut handles: Vec<(String, JoinHandle<StepResult>)> = Vec::new();

            for unit in &ready {
                for step_id in unit.steps() {
                    if is_completed(&execution, step_id) {
                        continue;
                    }
                    let Some(step) = definition.step(step_id) else { continue };
                    if let Some(reason) = self.precheck(definition, &execution, step) {
                        debug!(step = step_id, reason = %reason, "skipping step");
                        mark_skipped(&mut execution, step_id, reason);
                        continue;
                    }

                    let handler = match self.registry.resolve(&step.action_id) {
                        Ok(handler) => handler,
                        Err(e) => {
                            warn!(step = step_id, error = %e, "no handler for step");
                            execution
                                .step_results
                                .insert(step_id.to_string(), failed_result(step_id, &e, 0, Instant::now()));
                            continue;
                        }
                    };

                    let input = step.resolve_input(&execution.data);
                    let policy = AttemptPolicy::for_step(step, &self.config);
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| DomainError::ExecutionFailed("step semaphore closed".to_string()))?;
                    if let Some(result) = execution.step_results.get_mut(step_id) {
                        result.status = StepStatus::Running;
                        result.started_at = Some(Utc::now());
                    }

                    let step_id_owned = step_id.to_string();
                    let action_id = step.action_id.clone();
                    let cancelled = cancelled.clone();
                    let handle = tokio::spawn(
                        async move {
                            let _permit = permit;
                            run_step(step_id_owned, action_id, handler, input, policy, cancelled).await
                        }
                        .in_current_span(),
                    );
                    handles.push((step_id.to_string(), handle));
                }
            }

            for (step_id, handle) in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        let error = DomainError::ExecutionFailed(format!("step task aborted: {e}"));
                        failed_result(&step_id, &error, 1, Instant::now())
                    }
                };
                self.record(&mut execution, result, &cancelled);
            }

            for unit in &ready {
                if let ExecutionUnit::Group { id, steps, aggregation } = unit {
                    let outcome = group_outcome(&execution, id, steps, *aggregation);
                    if !outcome.satisfied {
                        warn!(
                            group = %id,
                            aggregation = %aggregation,
                            succeeded = outcome.succeeded,
                            total = outcome.total,
                            "parallel group aggregation not satisfied"
                        );
                    }
                    execution.group_outcomes.retain(|g| g.group_id != *id);
                    execution.group_outcomes.push(outcome);
                }
            }

            execution.updated_at = Utc::now();
            self.checkpoint(&execution).await;
        }

        self.finish(definition, &mut execution, cancelled.is_cancelled());
        info!(
            status = %execution.status,
            completed = execution.completed_count(),
            failed = execution.failed_count(),
            skipped = execution.skipped_count(),
            duration_ms = elapsed_ms(start),
            "workflow execution finished"
        );
        self.checkpoint(&execution).await;
        self.publish_hooks(definition, &execution).await;
        Ok(execution)
    }

    /// Dependency and guard checks. Returns a skip reason when the step must
    /// not run.
    fn precheck(
        &self,
        definition: &WorkflowDefinition,
        execution: &WorkflowExecution,
        step: &WorkflowStep,
    ) -> Option<String> {
        for dep in &step.depends_on {
            let tolerated = definition
                .step(dep)
                .is_some_and(|d| d.config.allow_failure);
            match execution.result(dep).map(|r| r.status) {
                Some(StepStatus::Completed) => {}
                Some(StepStatus::Failed | StepStatus::Skipped) if tolerated => {}
                Some(StepStatus::Failed) => return Some(format!("dependency '{dep}' failed")),
                Some(StepStatus::Skipped) => return Some(format!("dependency '{dep}' was skipped")),
                Some(StepStatus::Pending | StepStatus::Running) => {
                    return Some(format!("dependency '{dep}' has not finished"))
                }
                None => return Some(format!("dependency '{dep}' has no result")),
            }
        }

        match &step.condition {
            Some(condition) if !condition.evaluate(&execution.data) => {
                Some("guard condition evaluated to false".to_string())
            }
            _ => None,
        }
    }

    fn record(&self, execution: &mut WorkflowExecution, result: StepResult, cancelled: &CancelSignal) {
        if cancelled.is_cancelled() {
            // Late results of a cancelled execution are discarded.
            mark_skipped(execution, &result.step_id, CANCELLED_REASON);
            return;
        }
        match result.status {
            StepStatus::Completed => {
                debug!(step = %result.step_id, attempts = result.attempts, "step completed");
                if let Some(output) = &result.output {
                    execution.record_output(&result.step_id, output.clone());
                }
            }
            StepStatus::Failed => {
                warn!(
                    step = %result.step_id,
                    attempts = result.attempts,
                    error = result.error.as_deref().unwrap_or_default(),
                    "step failed"
                );
            }
            _ => {}
        }
        execution.step_results.insert(result.step_id.clone(), result);
    }

    fn finish(&self, definition: &WorkflowDefinition, execution: &mut WorkflowExecution, cancelled: bool) {
        let now = Utc::now();
        let unfinished: Vec<String> = execution
            .step_results
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.step_id.clone())
            .collect();

        if cancelled {
            for step_id in &unfinished {
                mark_skipped(execution, step_id, CANCELLED_REASON);
            }
            execution.status = ExecutionStatus::Cancelled;
            execution.reason = Some(format!(
                "cancelled after {} of {} steps completed",
                execution.completed_count(),
                execution.step_results.len()
            ));
        } else {
            let (status, reason) = decide_status(definition, execution);
            execution.status = status;
            execution.reason = Some(reason);
        }

        execution.completed_at = Some(now);
        execution.updated_at = now;
    }

    async fn checkpoint(&self, execution: &WorkflowExecution) {
        if let Some(repository) = &self.repository {
            if let Err(e) = repository.save(execution).await {
                warn!(execution_id = %execution.id, error = %e, "failed to checkpoint execution");
            }
        }
    }

    async fn publish_hooks(&self, definition: &WorkflowDefinition, execution: &WorkflowExecution) {
        let Some(publisher) = &self.publisher else { return };
        let hook = if execution.status.is_success() {
            definition.hooks.on_success.as_deref()
        } else {
            definition.hooks.on_failure.as_deref()
        };
        let Some(event_type) = hook else { return };

        publisher
            .publish(
                event_type,
                json!({
                    "execution_id": execution.id,
                    "workflow_id": execution.workflow_id,
                    "status": execution.status,
                    "reason": execution.reason,
                    "results": execution.step_results,
                }),
            )
            .await;
    }
}

/// Outcome of a finished, non-cancelled execution.
///
/// Partial success needs every failed step to tolerate failure, the
/// workflow to allow it, and at least one completed step.
pub fn decide_status(
    definition: &WorkflowDefinition,
    execution: &WorkflowExecution,
) -> (ExecutionStatus, String) {
    let failed = execution.failed_steps();
    let completed = execution.completed_count();
    let skipped = execution.skipped_count();

    if failed.is_empty() {
        return (
            ExecutionStatus::Completed,
            format!("{completed} steps completed, {skipped} skipped"),
        );
    }

    let all_tolerated = failed
        .iter()
        .all(|id| definition.step(id).is_some_and(|s| s.config.allow_failure));

    if all_tolerated && definition.allow_partial_success && completed > 0 {
        (
            ExecutionStatus::PartialSuccess,
            format!(
                "{completed} steps completed; tolerated failures: {}",
                failed.join(", ")
            ),
        )
    } else if all_tolerated && definition.allow_partial_success {
        (
            ExecutionStatus::Failed,
            format!("no step completed; failed steps: {}", failed.join(", ")),
        )
    } else {
        (
            ExecutionStatus::Failed,
            format!("failed steps: {}", failed.join(", ")),
        )
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn is_completed(execution: &WorkflowExecution, step_id: &str) -> bool {
    execution
        .result(step_id)
        .is_some_and(|r| r.status == StepStatus::Completed)
}

fn unit_ready(definition: &WorkflowDefinition, execution: &WorkflowExecution, unit: &ExecutionUnit) -> bool {
    let members: HashSet<&str> = unit.steps().into_iter().collect();
    members.iter().all(|id| {
        definition.step(id).is_none_or(|step| {
            step.depends_on
                .iter()
                .filter(|dep| !members.contains(dep.as_str()))
                .all(|dep| execution.result(dep).is_some_and(|r| r.status.is_terminal()))
        })
    })
}

fn mark_skipped(execution: &mut WorkflowExecution, step_id: &str, reason: impl Into<String>) {
    execution
        .step_results
        .insert(step_id.to_string(), StepResult::skipped(step_id, reason));
}

fn failed_result(step_id: &str, error: &DomainError, attempts: u32, started: Instant) -> StepResult {
    let now = Utc::now();
    StepResult {
        status: StepStatus::Failed,
        error: Some(error.to_string()),
        attempts,
        started_at: Some(now),
        completed_at: Some(now),
        duration_ms: elapsed_ms(started),
        ..StepResult::pending(step_id)
    }
}

fn group_outcome(
    execution: &WorkflowExecution,
    group_id: &str,
    steps: &[String],
    aggregation: Aggregation,
) -> GroupOutcome {
    let count = |status: StepStatus| {
        steps
            .iter()
            .filter(|id| execution.result(id).is_some_and(|r| r.status == status))
            .count()
    };
    let succeeded = count(StepStatus::Completed);
    GroupOutcome {
        group_id: group_id.to_string(),
        aggregation,
        succeeded,
        failed: count(StepStatus::Failed),
        skipped: count(StepStatus::Skipped),
        total: steps.len(),
        satisfied: aggregation.is_satisfied(succeeded, steps.len()),
    }
}

/// One attempt: invoke the handler in its own task and wait up to the
/// deadline. On expiry the task keeps running detached and its result is
/// dropped.
async fn invoke_with_deadline(
    step_id: &str,
    handler: Arc<dyn ActionHandler>,
    input: Value,
    limit: Duration,
) -> DomainResult<Value> {
    let handle = tokio::spawn(async move { handler.invoke(input).await });
    match timeout(limit, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(DomainError::ExecutionFailed(format!(
            "handler task for step {step_id} aborted: {join_error}"
        ))),
        Err(_) => Err(DomainError::StepTimeout {
            step_id: step_id.to_string(),
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Run a step with its retry policy.
async fn run_step(
    step_id: String,
    action_id: String,
    handler: Arc<dyn ActionHandler>,
    input: Value,
    policy: AttemptPolicy,
    cancelled: Arc<CancelSignal>,
) -> StepResult {
    let started_at = Utc::now();
    let start = Instant::now();
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_backoff)
        .with_randomization_factor(0.0)
        .with_multiplier(policy.multiplier)
        .with_max_interval(policy.max_backoff)
        .with_max_elapsed_time(None)
        .build();
    let retryable = handler.retryable();
    let mut attempts = 0u32;

    let outcome = loop {
        if cancelled.is_cancelled() {
            break Err(DomainError::ExecutionFailed(CANCELLED_REASON.to_string()));
        }
        attempts += 1;
        let error = match invoke_with_deadline(&step_id, handler.clone(), input.clone(), policy.timeout).await {
            Ok(output) => break Ok(output),
            Err(e) if e.is_retryable() => e,
            Err(e) => break Err(e),
        };

        let exhausted = attempts > policy.retries;
        if exhausted || !retryable {
            break Err(error);
        }

        let delay = backoff.next_backoff().unwrap_or(policy.max_backoff);
        warn!(
            step = %step_id,
            action = %action_id,
            attempt = attempts,
            max_attempts = policy.retries + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "step attempt failed, retrying"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancelled.cancelled() => {
                debug!(step = %step_id, attempt = attempts, "retry abandoned after cancellation");
            }
        }
    };

    let completed_at = Utc::now();
    let duration_ms = elapsed_ms(start);
    match outcome {
        Ok(output) => StepResult {
            step_id,
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            attempts,
            started_at: Some(started_at),
            completed_at: Some(completed_at),
            duration_ms,
        },
        Err(e) => StepResult {
            step_id,
            status: StepStatus::Failed,
            output: None,
            error: Some(e.to_string()),
            attempts,
            started_at: Some(started_at),
            completed_at: Some(completed_at),
            duration_ms,
        },
    }
}
