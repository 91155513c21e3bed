//! Task state CLI commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use crate::adapters::sqlite::SqliteTaskStateRepository;
use crate::cli::open_database;
use crate::cli::output::{format_time, list_table, output, truncate, CommandOutput};
use crate::domain::models::{Config, TaskState, TransitionRecord};
use crate::domain::ports::TaskStateRepository;

#[derive(Args, Debug)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommands,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Show the current lifecycle state of a task
    Show { agent: String, task_id: Uuid },
    /// Show the transition audit trail of a task
    History { agent: String, task_id: Uuid },
    /// List task states owned by an agent
    List { agent: String },
}

#[derive(Debug, Serialize)]
struct TaskStateOutput(TaskState);

impl CommandOutput for TaskStateOutput {
    fn to_human(&self) -> String {
        let state = &self.0;
        let mut lines = vec![
            format!("Task {} ({})", state.task_id, state.agent_name),
            format!("  State: {}", state.current_state),
        ];
        if let Some(previous) = state.previous_state {
            lines.push(format!("  Previous: {previous}"));
        }
        lines.push(format!("  Transitions: {}", state.transition_count));
        lines.push(format!("  Entered at: {}", format_time(&state.state_entered_at)));
        if let Some(plan_id) = &state.context.plan_id {
            lines.push(format!("  Plan: {plan_id}"));
        }
        if let Some(step_id) = &state.context.current_step_id {
            lines.push(format!("  Current step: {step_id}"));
        }
        if state.context.iteration > 0 {
            lines.push(format!("  Iteration: {}", state.context.iteration));
        }
        if let Some(wait) = &state.context.wait {
            lines.push(format!("  Waiting: {:?} {}", wait.kind, wait.reason.as_deref().unwrap_or("")));
        }
        if let Some(error) = &state.context.last_error {
            lines.push(format!("  Last error: {}", error.message));
        }
        if let Some(snapshot) = &state.context.pause_snapshot {
            lines.push(format!("  Paused from: {}", snapshot.paused_from));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct HistoryOutput {
    transitions: Vec<TransitionRecord>,
}

impl CommandOutput for HistoryOutput {
    fn to_human(&self) -> String {
        if self.transitions.is_empty() {
            return "No transitions recorded.".to_string();
        }
        let mut table = list_table(&["at", "event", "from", "to", "in state (ms)"]);
        for record in &self.transitions {
            table.add_row(vec![
                format_time(&record.created_at),
                record.event_type.to_string(),
                record.from_state.to_string(),
                record.to_state.to_string(),
                record.duration_ms.to_string(),
            ]);
        }
        format!("{} transitions:\n{table}", self.transitions.len())
    }
}

#[derive(Debug, Serialize)]
struct ListOutput {
    tasks: Vec<TaskState>,
}

impl CommandOutput for ListOutput {
    fn to_human(&self) -> String {
        if self.tasks.is_empty() {
            return "No tasks found.".to_string();
        }
        let mut table = list_table(&["task", "state", "transitions", "updated", "last error"]);
        for task in &self.tasks {
            table.add_row(vec![
                task.task_id.to_string(),
                task.current_state.to_string(),
                task.transition_count.to_string(),
                format_time(&task.updated_at),
                task.context
                    .last_error
                    .as_ref()
                    .map(|e| truncate(&e.message, 40))
                    .unwrap_or_default(),
            ]);
        }
        table.to_string()
    }
}

pub async fn execute(args: TaskArgs, config: &Config, json_mode: bool) -> Result<()> {
    let pool = open_database(config).await?;
    let repository = SqliteTaskStateRepository::new(pool);

    match args.command {
        TaskCommands::Show { agent, task_id } => {
            let state = repository
                .load(&agent, task_id)
                .await
                .context("Failed to load task state")?
                .ok_or_else(|| anyhow::anyhow!("No state recorded for task {task_id} of agent '{agent}'"))?;
            output(&TaskStateOutput(state), json_mode);
        }
        TaskCommands::History { agent, task_id } => {
            let transitions = repository
                .list_transitions(&agent, task_id)
                .await
                .context("Failed to load transitions")?;
            output(&HistoryOutput { transitions }, json_mode);
        }
        TaskCommands::List { agent } => {
            let tasks = repository
                .list_by_agent(&agent)
                .await
                .context("Failed to list task states")?;
            output(&ListOutput { tasks }, json_mode);
        }
    }
    Ok(())
}
