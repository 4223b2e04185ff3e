//! Stepflow CLI: load workflow bundles, submit jobs and run workers.
//!
//! Every command opens the same SQLite database, so a `stepflow worker`
//! process picks up jobs queued by `stepflow job submit` from another shell.

use clap::{Parser, Subcommand};
use stepflow_cli::commands;

/// Stepflow: sequential agent and WebAssembly workflows
#[derive(Parser)]
#[command(name = "stepflow", version, about = "Stepflow: sequential agent and WebAssembly workflows")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "STEPFLOW_DB_PATH")]
    db: Option<String>,

    /// Path to the engine config YAML
    #[arg(long, env = "STEPFLOW_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until Ctrl+C
    Worker {
        /// Number of concurrent workers (defaults to the config value)
        #[arg(long, env = "STEPFLOW_WORKERS")]
        workers: Option<usize>,
    },

    /// Submit and manage jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Load and inspect workflow bundles
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Engine-wide settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a job for a workflow (by id or name)
    Submit {
        /// Workflow id or name
        workflow: String,
        /// Job input as a JSON object
        #[arg(long)]
        input: Option<String>,
        /// Working directory for the job's modules
        #[arg(long)]
        cwd: Option<String>,
        /// Run the job in this process instead of queueing it
        #[arg(long)]
        sync: bool,
        /// Queue the job and wait for a worker to finish it
        #[arg(long, conflicts_with = "sync")]
        wait: bool,
    },
    /// Get a job by ID
    Get {
        id: String,
    },
    /// List jobs, newest first
    List {
        /// Filter by status: queued, running, completed, failed
        #[arg(long)]
        status: Option<String>,
    },
    /// List the step records of a job
    Steps {
        id: String,
    },
    /// Delete a job and its step records
    Delete {
        id: String,
    },
    /// Fail a job that has not started yet
    Cancel {
        id: String,
    },
    /// Wait until a job is completed or failed
    Wait {
        id: String,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Load bundles from a file, a directory or a glob pattern
    Load {
        path: String,
    },
    /// List stored agents, modules and workflows
    List,
    /// Validate a bundle file without loading it
    Validate {
        file: String,
    },
    /// Delete a workflow definition
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Set a value (e.g. `timeout_job_seconds 600`)
    Set {
        key: String,
        value: String,
    },
    /// Get a value
    Get {
        key: String,
    },
    /// List all settings
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepflow_core=info,stepflow_cli=info".into()),
        )
        .init();

    let result = match cli.command {
        Some(command) => run(command, cli.db, cli.config).await,
        None => {
            // No subcommand: show help
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, db: Option<String>, config: Option<String>) -> Result<(), String> {
    if let Commands::Workflow {
        action: WorkflowAction::Validate { file },
    } = &command
    {
        return commands::workflow::validate(file);
    }

    let db = db.unwrap_or_else(commands::default_db_path);
    let state = commands::init_state(&db, config.as_deref()).await?;

    match command {
        Commands::Worker { workers } => commands::worker::run(&state, workers).await,

        Commands::Job { action } => match action {
            JobAction::Submit {
                workflow,
                input,
                cwd,
                sync,
                wait,
            } => commands::job::submit(&state, &workflow, input.as_deref(), cwd, sync, wait).await,
            JobAction::Get { id } => commands::job::get(&state, &id).await,
            JobAction::List { status } => commands::job::list(&state, status.as_deref()).await,
            JobAction::Steps { id } => commands::job::steps(&state, &id).await,
            JobAction::Delete { id } => commands::job::delete(&state, &id).await,
            JobAction::Cancel { id } => commands::job::cancel(&state, &id).await,
            JobAction::Wait { id, timeout } => commands::job::wait(&state, &id, timeout).await,
        },

        Commands::Workflow { action } => match action {
            WorkflowAction::Load { path } => commands::workflow::load(&state, &path).await,
            WorkflowAction::List => commands::workflow::list(&state).await,
            WorkflowAction::Validate { file } => commands::workflow::validate(&file),
            WorkflowAction::Delete { id } => commands::workflow::delete(&state, &id).await,
        },

        Commands::Settings { action } => match action {
            SettingsAction::Set { key, value } => commands::settings::set(&state, &key, &value).await,
            SettingsAction::Get { key } => commands::settings::get(&state, &key).await,
            SettingsAction::List => commands::settings::list(&state).await,
        },
    }
}
