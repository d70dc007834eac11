//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// task-runner: an orchestrated multi-agent task runner.
///
/// Given a goal, plans (or reuses a prior plan for) a sequence of sub-agent
/// steps, executes them with bounded retries, and learns from the outcome.
#[derive(Parser, Debug)]
#[command(name = "task-runner")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the SQLite memory-store database file.
    ///
    /// Defaults to `task_runner.db` in the current directory.
    #[arg(long, env = "TASK_RUNNER_DB_PATH", global = true)]
    pub db_path: Option<PathBuf>,

    /// Output format for command results.
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output rendering for CLI commands.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable plain text.
    Text,
    /// Machine-readable JSON.
    Json,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs one orchestrated task to completion.
    ///
    /// Prints the final report to stdout. Exits 0 on success (including a
    /// partial report if the overall deadline elapsed mid-run), 2 on an
    /// uncaught runner error, 3 if the deadline elapsed before any partial
    /// result could be produced.
    #[command(after_help = r#"Examples:
  task-runner task session-1 "Summarize the ten most recent papers on agent memory"
  task-runner task session-2 "What were Q3 bookings?" --m3
  task-runner --format json task session-3 "audit the staging database" --deadline-secs 120
"#)]
    Task(TaskArgs),

    /// Memory-store inspection commands.
    #[command(subcommand)]
    Store(StoreCommands),

    /// Initializes the memory-store schema.
    ///
    /// Creates the database file and schema if they don't exist.
    Init,

    /// Clears all memory-store data, leaving the schema in place.
    Reset {
        /// Skip confirmation prompt.
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

/// Arguments for the `task` command.
#[derive(Args, Debug)]
pub struct TaskArgs {
    /// Session identifier; also used to name the run directory.
    pub session_id: String,

    /// The natural-language goal to accomplish.
    pub goal: String,

    /// Base directory run artifacts are written under.
    #[arg(long, env = "RUNS_BASE_DIR")]
    pub runs_dir: Option<PathBuf>,

    /// Enables the reuse gate, learning, and reflection (off by default).
    #[arg(long, env = "M3_ENABLED")]
    pub m3: bool,

    /// Overall wall-clock deadline for this task, in seconds.
    #[arg(long, env = "OVERALL_DEADLINE_SECS")]
    pub deadline_secs: Option<u64>,
}

/// Memory-store inspection subcommands.
#[derive(Subcommand, Debug)]
pub enum StoreCommands {
    /// Shows aggregate counts of persisted workflows and lessons.
    Status,
    /// Lists stored procedural workflows, newest first.
    Workflows,
    /// Lists stored lessons, newest first.
    Lessons,
}
