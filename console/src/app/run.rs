//! Command dispatch

use std::collections::HashMap;
use std::future::Future;

use colored::{ColoredString, Colorize};
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::app::state::AppState;
use crate::db::Store;
use crate::deploy::fsm::{DeploymentStatus, TaskStatus};
use crate::errors::ConsoleError;
use crate::models::deployment::OperationStatus;
use crate::models::task::TaskFilter;

const DEFAULT_LIST_LIMIT: u32 = 20;

/// A console command parsed from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Apply pending migrations and show the ledger
    Migrate,

    /// List catalog sequences
    Sequences,

    /// Run a sequence in the foreground
    Run {
        sequence: String,
        component: Option<String>,
    },

    /// Show component deployment states
    Status,

    /// List recent tasks
    Tasks {
        status: Option<TaskStatus>,
        component: Option<String>,
        limit: u32,
    },

    /// Show the operations log
    History { limit: u32 },
}

impl Command {
    /// Pick the command out of `--key[=value]` arguments
    ///
    /// Returns `Ok(None)` when no command flag is present.
    pub fn from_args(args: &HashMap<String, String>) -> Result<Option<Self>, ConsoleError> {
        let limit = match args.get("limit") {
            Some(value) => value
                .parse::<u32>()
                .map_err(|_| ConsoleError::InvalidValue(format!("limit '{}'", value)))?,
            None => DEFAULT_LIST_LIMIT,
        };
        let component = args.get("component").filter(|c| !c.is_empty()).cloned();

        let command = if args.contains_key("migrate") {
            Command::Migrate
        } else if args.contains_key("sequences") {
            Command::Sequences
        } else if let Some(sequence) = args.get("run") {
            if sequence.is_empty() || sequence == "true" {
                return Err(ConsoleError::ConfigError(
                    "--run requires a sequence name: --run=<sequence>".to_string(),
                ));
            }
            Command::Run {
                sequence: sequence.clone(),
                component,
            }
        } else if args.contains_key("status") {
            Command::Status
        } else if args.contains_key("tasks") {
            let status = match args.get("task-status") {
                Some(value) => Some(value.parse::<TaskStatus>()?),
                None => None,
            };
            Command::Tasks {
                status,
                component,
                limit,
            }
        } else if args.contains_key("history") {
            Command::History { limit }
        } else {
            return Ok(None);
        };

        Ok(Some(command))
    }
}

/// Run a command against the configured database
///
/// `shutdown_signal` only matters for `Command::Run`: when it fires the
/// running task is cancelled.
pub async fn run(
    command: Command,
    options: &AppOptions,
    shutdown_signal: impl Future<Output = ()>,
) -> Result<(), ConsoleError> {
    let state = AppState::init(options)?;

    match command {
        Command::Migrate => show_migrations(&state),
        Command::Sequences => show_sequences(&state),
        Command::Run {
            sequence,
            component,
        } => run_sequence(&state, options, &sequence, component, shutdown_signal).await,
        Command::Status => show_status(state.db.as_ref()),
        Command::Tasks {
            status,
            component,
            limit,
        } => {
            let mut filter = TaskFilter::new().with_limit(limit);
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            if let Some(component) = component {
                filter = filter.with_component(component);
            }
            show_tasks(state.db.as_ref(), &filter)
        }
        Command::History { limit } => show_history(state.db.as_ref(), limit),
    }
}

async fn run_sequence(
    state: &AppState,
    options: &AppOptions,
    sequence_name: &str,
    component: Option<String>,
    shutdown_signal: impl Future<Output = ()>,
) -> Result<(), ConsoleError> {
    let sequence = state.catalog.get(sequence_name)?;
    let component = component.or_else(|| sequence.component.clone());

    let manager = &state.manager;
    let task_id = manager.start_sequence(sequence_name, component.as_deref())?;
    println!(
        "{} {} {}",
        "▶".blue(),
        sequence_name.bold(),
        format!("(task {})", task_id).dimmed()
    );

    let wait = manager.wait(&task_id, options.wait_poll_interval);
    tokio::pin!(wait);

    let task = tokio::select! {
        task = &mut wait => task?,
        _ = shutdown_signal => {
            info!(task_id = %task_id, "Shutdown requested, cancelling task");
            if let Err(e) = manager.cancel_task(&task_id) {
                warn!(task_id = %task_id, "Failed to cancel task: {}", e);
            }
            wait.await?
        }
    };

    if !task.output.is_empty() {
        println!("{}", task.output.trim_end().dimmed());
    }

    match task.status {
        TaskStatus::Completed => {
            println!("{} {} completed", "✓".green(), sequence_name);
            Ok(())
        }
        status => {
            let error = task.error.unwrap_or_default();
            eprintln!("{} {} {}: {}", "✗".red(), sequence_name, status, error);
            Err(ConsoleError::StepError(format!(
                "sequence '{}' ended {}",
                sequence_name, status
            )))
        }
    }
}

fn show_migrations(state: &AppState) -> Result<(), ConsoleError> {
    let version = state.db.schema_version()?;
    println!("{} {}", "Schema version".bold(), version);
    for migration in state.db.applied_migrations()? {
        println!(
            "  {:>3}  {}  {}",
            migration.version,
            migration.description,
            migration.applied_at.to_rfc3339().dimmed()
        );
    }
    Ok(())
}

fn show_sequences(state: &AppState) -> Result<(), ConsoleError> {
    for sequence in state.catalog.sequences() {
        let component = sequence.component.as_deref().unwrap_or("-");
        println!(
            "{} {} {}",
            sequence.name.bold(),
            format!("[{}]", component).cyan(),
            sequence.direction().as_str().dimmed()
        );
        for (index, step) in sequence.steps.iter().enumerate() {
            println!(
                "  {} {} {}",
                format!("{}.", index + 1).dimmed(),
                step.name,
                step.playbook.dimmed()
            );
        }
    }
    Ok(())
}

fn show_status(store: &dyn Store) -> Result<(), ConsoleError> {
    let states = store.list_deployment_states()?;
    if states.is_empty() {
        println!("{}", "No components recorded".dimmed());
        return Ok(());
    }
    for state in states {
        let deployed_at = state
            .deployed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<14} {} {}",
            state.component.bold(),
            deployment_status_label(state.status),
            state.task_id.dimmed(),
            deployed_at.dimmed()
        );
    }
    Ok(())
}

fn show_tasks(store: &dyn Store, filter: &TaskFilter) -> Result<(), ConsoleError> {
    let tasks = store.list_tasks(filter)?;
    if tasks.is_empty() {
        println!("{}", "No tasks".dimmed());
        return Ok(());
    }
    for task in tasks {
        println!(
            "{} {:<14} {:<10} {:<12} {}",
            task.id.dimmed(),
            task.operation.bold(),
            task.component.as_deref().unwrap_or("-"),
            task_status_label(task.status),
            task.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn show_history(store: &dyn Store, limit: u32) -> Result<(), ConsoleError> {
    let entries = store.list_operations(Some(limit))?;
    if entries.is_empty() {
        println!("{}", "No operations recorded".dimmed());
        return Ok(());
    }
    for entry in entries {
        let status = match entry.status {
            OperationStatus::Success => entry.status.as_str().green(),
            OperationStatus::Failure => entry.status.as_str().red(),
        };
        println!(
            "{} {:<14} {:<10} {:<8} {}",
            entry.created_at.to_rfc3339().dimmed(),
            entry.operation.bold(),
            entry.component.as_deref().unwrap_or("-"),
            status,
            entry.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn task_status_label(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Pending => status.as_str().normal(),
        TaskStatus::Running => status.as_str().blue(),
        TaskStatus::Completed => status.as_str().green(),
        TaskStatus::Failed => status.as_str().red(),
        TaskStatus::Cancelled => status.as_str().yellow(),
    }
}

fn deployment_status_label(status: DeploymentStatus) -> ColoredString {
    match status {
        DeploymentStatus::NotDeployed => status.as_str().normal(),
        DeploymentStatus::Deploying | DeploymentStatus::Undeploying => status.as_str().blue(),
        DeploymentStatus::Deployed => status.as_str().green(),
        DeploymentStatus::Failed => status.as_str().red(),
    }
}
