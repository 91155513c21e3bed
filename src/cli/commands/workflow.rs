//! Workflow definition CLI commands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::output::{list_table, output, CommandOutput};
use crate::domain::models::WorkflowDefinition;
use crate::services::dependency_resolver::{DependencyResolver, ExecutionUnit};

#[derive(Args, Debug)]
pub struct WorkflowArgs {
    #[command(subcommand)]
    pub command: WorkflowCommands,
}

#[derive(Subcommand, Debug)]
pub enum WorkflowCommands {
    /// Check a definition for structural errors and dependency cycles
    Validate {
        /// Path to a YAML workflow definition
        file: PathBuf,
    },
    /// Print the execution order of a definition
    Order {
        /// Path to a YAML workflow definition
        file: PathBuf,
    },
}

// ── Output structs ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ValidateOutput {
    workflow_id: String,
    trigger: String,
    valid: bool,
    steps: usize,
    parallel_groups: usize,
    error: Option<String>,
}

impl CommandOutput for ValidateOutput {
    fn to_human(&self) -> String {
        if self.valid {
            format!(
                "Workflow '{}' (trigger: {}) is valid: {} steps, {} parallel groups",
                self.workflow_id, self.trigger, self.steps, self.parallel_groups
            )
        } else {
            format!(
                "Workflow '{}' is invalid: {}",
                self.workflow_id,
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

#[derive(Debug, Serialize)]
struct OrderedStep {
    position: usize,
    step_id: String,
    action_id: String,
    depth: u32,
    group: Option<String>,
    depends_on: Vec<String>,
}

#[derive(Debug, Serialize)]
struct OrderOutput {
    workflow_id: String,
    steps: Vec<OrderedStep>,
}

impl CommandOutput for OrderOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["#", "step", "action", "depth", "group", "depends on"]);
        for step in &self.steps {
            table.add_row(vec![
                step.position.to_string(),
                step.step_id.clone(),
                step.action_id.clone(),
                step.depth.to_string(),
                step.group.clone().unwrap_or_else(|| "-".to_string()),
                step.depends_on.join(", "),
            ]);
        }
        format!("Execution order for '{}':\n{table}", self.workflow_id)
    }
}

// ── Command execution ───────────────────────────────────────────────────

pub async fn execute(args: WorkflowArgs, json_mode: bool) -> Result<()> {
    match args.command {
        WorkflowCommands::Validate { file } => validate_workflow(&file, json_mode),
        WorkflowCommands::Order { file } => order_workflow(&file, json_mode),
    }
}

pub fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse workflow file {}", path.display()))
}

fn validate_workflow(path: &Path, json_mode: bool) -> Result<()> {
    let definition = load_definition(path)?;
    let result = DependencyResolver::new().validate(&definition);

    let out = ValidateOutput {
        workflow_id: definition.id.clone(),
        trigger: definition.trigger.clone(),
        valid: result.is_ok(),
        steps: definition.steps.len(),
        parallel_groups: definition.parallel_groups.len(),
        error: result.err().map(|e| e.to_string()),
    };
    output(&out, json_mode);

    if out.valid {
        Ok(())
    } else {
        anyhow::bail!("workflow '{}' failed validation", out.workflow_id)
    }
}

fn order_workflow(path: &Path, json_mode: bool) -> Result<()> {
    let definition = load_definition(path)?;
    let resolver = DependencyResolver::new();
    let units = resolver
        .validate(&definition)
        .context("Cannot order an invalid workflow")?;
    let depths = resolver.depths(&definition)?;

    let mut steps = Vec::with_capacity(definition.steps.len());
    for unit in &units {
        let group = match unit {
            ExecutionUnit::Group { id, .. } => Some(id.clone()),
            ExecutionUnit::Step(_) => None,
        };
        for step_id in unit.steps() {
            let Some(step) = definition.step(step_id) else { continue };
            steps.push(OrderedStep {
                position: steps.len() + 1,
                step_id: step.id.clone(),
                action_id: step.action_id.clone(),
                depth: depths.get(step_id).copied().unwrap_or_default(),
                group: group.clone(),
                depends_on: step.depends_on.clone(),
            });
        }
    }

    output(
        &OrderOutput {
            workflow_id: definition.id,
            steps,
        },
        json_mode,
    );
    Ok(())
}
