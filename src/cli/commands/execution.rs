//! Workflow execution CLI commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use crate::adapters::sqlite::SqliteWorkflowExecutionRepository;
use crate::cli::open_database;
use crate::cli::output::{format_time, list_table, output, truncate, CommandOutput};
use crate::domain::models::{Config, WorkflowExecution};
use crate::domain::ports::WorkflowExecutionRepository;

#[derive(Args, Debug)]
pub struct ExecutionArgs {
    #[command(subcommand)]
    pub command: ExecutionCommands,
}

#[derive(Subcommand, Debug)]
pub enum ExecutionCommands {
    /// Show one execution with its step results
    Show { id: Uuid },
    /// List recent executions of a workflow
    List {
        workflow_id: String,
        /// Maximum number of executions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Debug, Serialize)]
struct ExecutionDetailOutput(WorkflowExecution);

impl CommandOutput for ExecutionDetailOutput {
    fn to_human(&self) -> String {
        let exec = &self.0;
        let mut lines = vec![
            format!("Execution {}", exec.id),
            format!("  Workflow: {} (trigger: {})", exec.workflow_id, exec.trigger),
            format!("  Status: {}", exec.status),
            format!("  Created: {}", format_time(&exec.created_at)),
        ];
        if let Some(completed) = &exec.completed_at {
            lines.push(format!("  Completed: {}", format_time(completed)));
        }
        if let Some(reason) = &exec.reason {
            lines.push(format!("  Reason: {reason}"));
        }

        let mut table = list_table(&["step", "status", "attempts", "duration (ms)", "error"]);
        for step_id in &exec.execution_order {
            let Some(result) = exec.step_results.get(step_id) else { continue };
            table.add_row(vec![
                result.step_id.clone(),
                result.status.to_string(),
                result.attempts.to_string(),
                result.duration_ms.to_string(),
                result.error.as_deref().map(|e| truncate(e, 50)).unwrap_or_default(),
            ]);
        }
        lines.push(String::new());
        lines.push(table.to_string());

        for group in &exec.group_outcomes {
            lines.push(format!(
                "  Group {} ({}): {}/{} succeeded, {} failed, {} skipped{}",
                group.group_id,
                group.aggregation,
                group.succeeded,
                group.total,
                group.failed,
                group.skipped,
                if group.satisfied { "" } else { " [unsatisfied]" }
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct ExecutionListOutput {
    executions: Vec<WorkflowExecution>,
}

impl CommandOutput for ExecutionListOutput {
    fn to_human(&self) -> String {
        if self.executions.is_empty() {
            return "No executions found.".to_string();
        }
        let mut table = list_table(&["id", "status", "steps", "created", "reason"]);
        for exec in &self.executions {
            table.add_row(vec![
                exec.id.to_string(),
                exec.status.to_string(),
                exec.step_results.len().to_string(),
                format_time(&exec.created_at),
                exec.reason.as_deref().map(|r| truncate(r, 40)).unwrap_or_default(),
            ]);
        }
        table.to_string()
    }
}

pub async fn execute(args: ExecutionArgs, config: &Config, json_mode: bool) -> Result<()> {
    let pool = open_database(config).await?;
    let repository = SqliteWorkflowExecutionRepository::new(pool);

    match args.command {
        ExecutionCommands::Show { id } => {
            let execution = repository
                .get(id)
                .await
                .context("Failed to load execution")?
                .ok_or_else(|| anyhow::anyhow!("Execution {id} not found"))?;
            output(&ExecutionDetailOutput(execution), json_mode);
        }
        ExecutionCommands::List { workflow_id, limit } => {
            let executions = repository
                .list_by_definition(&workflow_id, limit)
                .await
                .context("Failed to list executions")?;
            output(&ExecutionListOutput { executions }, json_mode);
        }
    }
    Ok(())
}
