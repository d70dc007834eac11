//! CLI command implementations.
//!
//! Contains the business logic for each CLI command: building the runtime
//! collaborators (provider, embedder, memory store, sub-agent registry) from
//! configuration and driving one orchestrated task, or inspecting/managing
//! the memory store directly.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::embedding::{create_default_embedder, Embedder};
use crate::error::{CommandError, RunnerError};
use crate::llm::{create_provider, LlmProvider};
use crate::model::Goal;
use crate::runner_orchestrator::{Orchestrator, RunOutcome};
use crate::storage::SqliteStorage;
use crate::subagents::{
    DatabaseQueryAgent, GeneralWebSource, LlmRagCollaborator, RagCollaborator, ReportSynthesisAgent,
    RetrievalQaAgent, ScholarlySource, ShellToolAgent, SubAgentRegistry, WebSearchAgent,
};

use super::parser::{Cli, Commands, OutputFormat, StoreCommands, TaskArgs};

/// Result of running one CLI command: its rendered output and intended
/// process exit code.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Text to print to stdout.
    pub output: String,
    /// Process exit code (0 success, 2 uncaught runner error, 3 deadline
    /// exceeded with no partial result).
    pub exit_code: i32,
}

impl CommandOutcome {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: 0,
        }
    }
}

fn resolve_db_path(cli: &Cli) -> PathBuf {
    cli.db_path.clone().unwrap_or_else(|| PathBuf::from("task_runner.db"))
}

/// Executes the parsed CLI command.
///
/// # Errors
///
/// Returns a [`CommandError`] for failures other than the task command's own
/// contractual exit codes (which are carried in the returned
/// [`CommandOutcome::exit_code`] instead of an `Err`).
pub async fn execute(cli: &Cli) -> Result<CommandOutcome, CommandError> {
    let db_path = resolve_db_path(cli);
    match &cli.command {
        Commands::Init => cmd_init(&db_path),
        Commands::Reset { yes } => cmd_reset(&db_path, *yes),
        Commands::Store(sub) => cmd_store(&db_path, sub, cli.format),
        Commands::Task(args) => cmd_task(args, &db_path, cli.format).await,
    }
}

fn cmd_init(db_path: &Path) -> Result<CommandOutcome, CommandError> {
    let mut storage = SqliteStorage::open(db_path).map_err(CommandError::Storage)?;
    storage.init().map_err(CommandError::Storage)?;
    Ok(CommandOutcome::ok(format!("initialized {}", db_path.display())))
}

fn cmd_reset(db_path: &Path, yes: bool) -> Result<CommandOutcome, CommandError> {
    if !yes {
        return Err(CommandError::ExecutionFailed(
            "reset requires --yes to confirm (this deletes all workflows and lessons)".to_string(),
        ));
    }
    let mut storage = SqliteStorage::open(db_path).map_err(CommandError::Storage)?;
    storage.reset().map_err(CommandError::Storage)?;
    Ok(CommandOutcome::ok("memory store cleared"))
}

fn cmd_store(db_path: &Path, sub: &StoreCommands, format: OutputFormat) -> Result<CommandOutcome, CommandError> {
    let storage = SqliteStorage::open(db_path).map_err(CommandError::Storage)?;
    if !storage.is_initialized().map_err(CommandError::Storage)? {
        return Err(CommandError::ExecutionFailed(format!(
            "{} is not initialized; run `task-runner init` first",
            db_path.display()
        )));
    }
    let output = match sub {
        StoreCommands::Status => {
            let stats = storage.stats().map_err(CommandError::Storage)?;
            match format {
                OutputFormat::Json => serde_json::to_string_pretty(&stats).unwrap_or_default(),
                OutputFormat::Text => {
                    format!("workflows: {}\nlessons: {}", stats.workflow_count, stats.lesson_count)
                }
            }
        }
        StoreCommands::Workflows => {
            let workflows = storage.procedural_list().map_err(CommandError::Storage)?;
            render_workflows(&workflows, format)
        }
        StoreCommands::Lessons => {
            let lessons = storage.lesson_list().map_err(CommandError::Storage)?;
            render_lessons(&lessons, format)
        }
    };
    Ok(CommandOutcome::ok(output))
}

fn render_workflows(workflows: &[(crate::model::ProceduralWorkflow, String)], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(
            &workflows
                .iter()
                .map(|(w, updated_at)| serde_json::json!({"workflow": w, "updated_at": updated_at}))
                .collect::<Vec<_>>(),
        )
        .unwrap_or_default(),
        OutputFormat::Text => {
            if workflows.is_empty() {
                return "no stored workflows".to_string();
            }
            workflows
                .iter()
                .map(|(w, updated_at)| {
                    format!(
                        "{} ({} steps, used {}x, updated {})",
                        w.workflow_id,
                        w.plan.len(),
                        w.usage_count,
                        updated_at
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

fn render_lessons(lessons: &[(crate::model::Lesson, String)], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(
            &lessons
                .iter()
                .map(|(l, created_at)| serde_json::json!({"lesson": l, "created_at": created_at}))
                .collect::<Vec<_>>(),
        )
        .unwrap_or_default(),
        OutputFormat::Text => {
            if lessons.is_empty() {
                return "no stored lessons".to_string();
            }
            lessons
                .iter()
                .map(|(l, created_at)| {
                    format!(
                        "[{:?}] {} ({}, {})",
                        l.status, l.agent_name, l.lesson_id, created_at
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

fn build_registry(
    provider: &Arc<dyn LlmProvider>,
    config: &OrchestratorConfig,
    storage: &Arc<Mutex<SqliteStorage>>,
    rag_collaborator: &Arc<dyn RagCollaborator>,
) -> SubAgentRegistry {
    let mut registry = SubAgentRegistry::new();
    registry.register(Box::new(DatabaseQueryAgent::new(
        Arc::clone(provider),
        config.proposer_model.clone(),
        Arc::clone(storage),
    )));
    registry.register(Box::new(ReportSynthesisAgent::new(
        Arc::clone(provider),
        config.proposer_model.clone(),
    )));
    registry.register(Box::new(RetrievalQaAgent::new(Arc::clone(rag_collaborator))));
    registry.register(Box::new(ShellToolAgent));
    registry.register(Box::new(WebSearchAgent::new(vec![
        Box::new(GeneralWebSource::new(reqwest::Client::new())),
        Box::new(ScholarlySource::new(reqwest::Client::new())),
    ])));
    registry
}

fn render_task_output(outcome: &RunOutcome, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => outcome.report.clone(),
        OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
            "report": outcome.report,
            "partial": outcome.partial,
            "run_dir": outcome.run_dir.display().to_string(),
        }))
        .unwrap_or_else(|_| outcome.report.clone()),
    }
}

async fn cmd_task(args: &TaskArgs, db_path: &Path, format: OutputFormat) -> Result<CommandOutcome, CommandError> {
    let mut builder = OrchestratorConfig::builder().from_env().db_path(db_path.to_path_buf());
    if let Some(dir) = &args.runs_dir {
        builder = builder.runs_base_dir(dir.clone());
    }
    if args.m3 {
        builder = builder.m3_enabled(true);
    }
    if let Some(secs) = args.deadline_secs {
        builder = builder.overall_deadline(Duration::from_secs(secs));
    }
    let config = builder.build().map_err(CommandError::Runner)?;

    let provider: Arc<dyn LlmProvider> =
        Arc::from(create_provider(&config).map_err(CommandError::Runner)?);
    let embedder: Arc<dyn Embedder> = Arc::from(create_default_embedder());

    let mut storage = SqliteStorage::open(&config.db_path).map_err(CommandError::Storage)?;
    if !storage.is_initialized().map_err(CommandError::Storage)? {
        storage.init().map_err(CommandError::Storage)?;
    }
    let storage = Arc::new(Mutex::new(storage));

    let rag_collaborator: Arc<dyn RagCollaborator> = Arc::new(LlmRagCollaborator::new(
        Arc::clone(&provider),
        config.proposer_model.clone(),
    ));
    let registry = Arc::new(build_registry(&provider, &config, &storage, &rag_collaborator));

    let orchestrator = Orchestrator::new(config, registry, provider, embedder, storage, rag_collaborator);

    let goal = Goal {
        session_id: args.session_id.clone(),
        text: args.goal.clone(),
    };

    match orchestrator.handle_request(goal).await {
        Ok(outcome) => Ok(CommandOutcome {
            output: render_task_output(&outcome, format),
            exit_code: 0,
        }),
        Err(RunnerError::DeadlineExceeded { elapsed_secs }) => Ok(CommandOutcome {
            output: format!("deadline exceeded after {elapsed_secs:.1}s with no partial result"),
            exit_code: 3,
        }),
        Err(other) => Err(CommandError::Runner(other)),
    }
}
