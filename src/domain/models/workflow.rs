//! Workflow domain models.
//!
//! A [`WorkflowDefinition`] is a static graph of [`WorkflowStep`]s bound to a
//! trigger key. Each run of a definition is a [`WorkflowExecution`] holding
//! one [`StepResult`] per step and the accumulated workflow data:
//!
//! ```json
//! { "trigger": <payload>, "<step_id>": <step output>, ... }
//! ```
//!
//! Guard conditions and input mappings read from that data with dot paths
//! such as `trigger.user.id` or `fetch.items.0`.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Key under which the trigger payload is stored in workflow data.
pub const TRIGGER_KEY: &str = "trigger";

/// Resolve a dot path (`a.b.0.c`) inside a JSON value.
pub fn lookup_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(data);
    }
    path.split('.').try_fold(data, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

// ============================================================================
// Conditions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Exists,
    NotExists,
}

/// Guard condition evaluated against workflow data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Compare {
        field: String,
        operator: ConditionOperator,
        #[serde(default)]
        value: Value,
    },
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    pub fn compare(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self::Compare {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Self::compare(field, ConditionOperator::Equals, value)
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::compare(field, ConditionOperator::Exists, Value::Null)
    }

    /// Evaluate against workflow data. Missing fields never compare equal,
    /// greater or less.
    pub fn evaluate(&self, data: &Value) -> bool {
        match self {
            Self::All(conditions) => conditions.iter().all(|c| c.evaluate(data)),
            Self::Any(conditions) => conditions.iter().any(|c| c.evaluate(data)),
            Self::Compare {
                field,
                operator,
                value,
            } => {
                let actual = lookup_path(data, field).filter(|v| !v.is_null());
                match operator {
                    ConditionOperator::Exists => actual.is_some(),
                    ConditionOperator::NotExists => actual.is_none(),
                    ConditionOperator::Equals => actual.is_some_and(|a| values_equal(a, value)),
                    ConditionOperator::NotEquals => !actual.is_some_and(|a| values_equal(a, value)),
                    ConditionOperator::GreaterThan => {
                        compare_values(actual, value).is_some_and(std::cmp::Ordering::is_gt)
                    }
                    ConditionOperator::LessThan => {
                        compare_values(actual, value).is_some_and(std::cmp::Ordering::is_lt)
                    }
                }
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

fn compare_values(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => actual.as_f64()?.partial_cmp(&expected.as_f64()?),
    }
}

// ============================================================================
// Steps
// ============================================================================

/// Where a step input value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum InputSource {
    /// The trigger payload, optionally narrowed by a dot path.
    Trigger {
        #[serde(default)]
        path: Option<String>,
    },
    /// Output of an upstream step, optionally narrowed by a dot path.
    Step {
        step_id: String,
        #[serde(default)]
        path: Option<String>,
    },
    Literal { value: Value },
}

impl InputSource {
    pub fn trigger(path: impl Into<String>) -> Self {
        Self::Trigger {
            path: Some(path.into()),
        }
    }

    pub fn step(step_id: impl Into<String>, path: Option<&str>) -> Self {
        Self::Step {
            step_id: step_id.into(),
            path: path.map(str::to_string),
        }
    }

    /// Resolve against workflow data; unresolved sources yield `null`.
    pub fn resolve(&self, data: &Value) -> Value {
        let (root, path) = match self {
            Self::Literal { value } => return value.clone(),
            Self::Trigger { path } => (TRIGGER_KEY, path.as_deref()),
            Self::Step { step_id, path } => (step_id.as_str(), path.as_deref()),
        };
        data.get(root)
            .and_then(|v| lookup_path(v, path.unwrap_or_default()))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Per-step execution settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Deadline for one attempt. Executor default when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub retry_count: u32,
    /// Whether dependents and the workflow outcome tolerate this step failing.
    #[serde(default)]
    pub allow_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub action_id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSource>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub config: StepConfig,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, action_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action_id: action_id.into(),
            depends_on: Vec::new(),
            inputs: BTreeMap::new(),
            condition: None,
            config: StepConfig::default(),
        }
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, source: InputSource) -> Self {
        self.inputs.insert(key.into(), source);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.config.retry_count = retry_count;
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.config.allow_failure = true;
        self
    }

    /// Build the handler input. Without a mapping the handler receives the
    /// trigger payload.
    pub fn resolve_input(&self, data: &Value) -> Value {
        if self.inputs.is_empty() {
            return data.get(TRIGGER_KEY).cloned().unwrap_or(Value::Null);
        }
        let map: Map<String, Value> = self
            .inputs
            .iter()
            .map(|(key, source)| (key.clone(), source.resolve(data)))
            .collect();
        Value::Object(map)
    }
}

// ============================================================================
// Parallel groups
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    All,
    Any,
    Majority,
}

impl Aggregation {
    pub fn is_satisfied(&self, succeeded: usize, total: usize) -> bool {
        match self {
            Self::All => succeeded == total,
            Self::Any => succeeded > 0,
            Self::Majority => succeeded * 2 > total,
        }
    }
}

impl std::fmt::Display for Aggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Any => write!(f, "any"),
            Self::Majority => write!(f, "majority"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub id: String,
    pub steps: Vec<String>,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl ParallelGroup {
    pub fn new(id: impl Into<String>, steps: &[&str], aggregation: Aggregation) -> Self {
        Self {
            id: id.into(),
            steps: steps.iter().map(|s| (*s).to_string()).collect(),
            aggregation,
        }
    }
}

/// Event types published when an execution finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowHooks {
    #[serde(default)]
    pub on_success: Option<String>,
    #[serde(default)]
    pub on_failure: Option<String>,
}

// ============================================================================
// Definitions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub trigger: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub parallel_groups: Vec<ParallelGroup>,
    #[serde(default)]
    pub allow_partial_success: bool,
    #[serde(default)]
    pub hooks: WorkflowHooks,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            trigger: trigger.into(),
            steps: Vec::new(),
            parallel_groups: Vec::new(),
            allow_partial_success: false,
            hooks: WorkflowHooks::default(),
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_group(mut self, group: ParallelGroup) -> Self {
        self.parallel_groups.push(group);
        self
    }

    pub fn allow_partial_success(mut self) -> Self {
        self.allow_partial_success = true;
        self
    }

    pub fn with_hooks(mut self, on_success: Option<&str>, on_failure: Option<&str>) -> Self {
        self.hooks = WorkflowHooks {
            on_success: on_success.map(str::to_string),
            on_failure: on_failure.map(str::to_string),
        };
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn group(&self, group_id: &str) -> Option<&ParallelGroup> {
        self.parallel_groups.iter().find(|g| g.id == group_id)
    }

    /// The parallel group a step belongs to, if any.
    pub fn group_of(&self, step_id: &str) -> Option<&ParallelGroup> {
        self.parallel_groups
            .iter()
            .find(|g| g.steps.iter().any(|s| s == step_id))
    }

    /// Distinct action ids referenced by the steps, in declaration order.
    pub fn action_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .map(|s| s.action_id.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Structural checks that do not need graph traversal: ids, references
    /// and group membership. Cycle detection lives in the dependency resolver.
    pub fn validate_structure(&self) -> DomainResult<()> {
        let fail = |msg: String| Err(DomainError::ValidationFailed(msg));

        if self.id.trim().is_empty() {
            return fail("workflow id cannot be empty".to_string());
        }
        if self.steps.is_empty() {
            return fail(format!("workflow {} has no steps", self.id));
        }

        let mut step_ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return fail("step id cannot be empty".to_string());
            }
            if step.id == TRIGGER_KEY {
                return fail(format!("step id '{TRIGGER_KEY}' is reserved"));
            }
            if !step_ids.insert(step.id.as_str()) {
                return fail(format!("duplicate step id: {}", step.id));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !step_ids.contains(dep.as_str()) {
                    return fail(format!("step {} depends on unknown step {dep}", step.id));
                }
            }
            for source in step.inputs.values() {
                if let InputSource::Step { step_id, .. } = source {
                    if !step_ids.contains(step_id.as_str()) {
                        return fail(format!(
                            "step {} maps input from unknown step {step_id}",
                            step.id
                        ));
                    }
                }
            }
        }

        let mut group_ids = HashSet::new();
        let mut grouped: HashMap<&str, &str> = HashMap::new();
        for group in &self.parallel_groups {
            if !group_ids.insert(group.id.as_str()) {
                return fail(format!("duplicate parallel group id: {}", group.id));
            }
            if group.steps.is_empty() {
                return fail(format!("parallel group {} has no steps", group.id));
            }
            for member in &group.steps {
                if !step_ids.contains(member.as_str()) {
                    return fail(format!("parallel group {} references unknown step {member}", group.id));
                }
                if let Some(other) = grouped.insert(member.as_str(), group.id.as_str()) {
                    return fail(format!(
                        "step {member} belongs to parallel groups {other} and {}",
                        group.id
                    ));
                }
            }
            for member in &group.steps {
                let Some(step) = self.step(member) else { continue };
                if let Some(dep) = step.depends_on.iter().find(|d| group.steps.contains(d)) {
                    return fail(format!(
                        "parallel group {}: step {member} depends on group member {dep}",
                        group.id
                    ));
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// Executions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<Value>,
    /// Failure message, or the reason a step was skipped.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl StepResult {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
            duration_ms: 0,
        }
    }

    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            status: StepStatus::Skipped,
            error: Some(reason.into()),
            started_at: Some(now),
            completed_at: Some(now),
            ..Self::pending(step_id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartialSuccess | Self::Failed | Self::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::PartialSuccess)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partial_success" => Ok(Self::PartialSuccess),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DomainError::SerializationError(format!(
                "Unknown execution status: {other}"
            ))),
        }
    }
}

/// Aggregation diagnostic for one parallel group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOutcome {
    pub group_id: String,
    pub aggregation: Aggregation,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
    pub satisfied: bool,
}

/// One run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: String,
    pub trigger: String,
    pub trigger_payload: Value,
    pub status: ExecutionStatus,
    pub execution_order: Vec<String>,
    pub step_results: HashMap<String, StepResult>,
    /// `trigger` plus one entry per completed step.
    pub data: Value,
    #[serde(default)]
    pub group_outcomes: Vec<GroupOutcome>,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(definition: &WorkflowDefinition, payload: Value) -> Self {
        let now = Utc::now();
        let mut data = Map::new();
        data.insert(TRIGGER_KEY.to_string(), payload.clone());
        Self {
            id: Uuid::new_v4(),
            workflow_id: definition.id.clone(),
            trigger: definition.trigger.clone(),
            trigger_payload: payload,
            status: ExecutionStatus::Pending,
            execution_order: Vec::new(),
            step_results: definition
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepResult::pending(&s.id)))
                .collect(),
            data: Value::Object(data),
            group_outcomes: Vec::new(),
            reason: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    fn count(&self, status: StepStatus) -> usize {
        self.step_results.values().filter(|r| r.status == status).count()
    }

    pub fn completed_count(&self) -> usize {
        self.count(StepStatus::Completed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(StepStatus::Failed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    /// Failed step ids, sorted.
    pub fn failed_steps(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .step_results
            .values()
            .filter(|r| r.status == StepStatus::Failed)
            .map(|r| r.step_id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Store a completed step's output in workflow data.
    pub fn record_output(&mut self, step_id: &str, output: Value) {
        if let Value::Object(map) = &mut self.data {
            map.insert(step_id.to_string(), output);
        }
    }

    /// Reset every non-completed step back to pending so it runs again.
    pub fn reset_unfinished(&mut self) {
        for result in self.step_results.values_mut() {
            if result.status != StepStatus::Completed {
                *result = StepResult::pending(&result.step_id);
            }
        }
        if let Value::Object(map) = &mut self.data {
            let completed: HashSet<String> = self
                .step_results
                .values()
                .filter(|r| r.status == StepStatus::Completed)
                .map(|r| r.step_id.clone())
                .collect();
            map.retain(|key, _| key == TRIGGER_KEY || completed.contains(key));
        }
        // Groups with every member completed will not run again.
        self.group_outcomes.retain(|g| g.succeeded == g.total);
        self.reason = None;
        self.completed_at = None;
        self.status = ExecutionStatus::Pending;
    }
}
