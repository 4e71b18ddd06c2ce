//! Foreman CLI entry point.
//!
//! One-shot subcommands (`create`, `status`, `sessions`, `delete`,
//! `resume`, `reap`) operate directly against the store. Long-running
//! subcommands (`init`, `code`) build the full composition root, follow
//! the project's live event stream on stdout, and translate Ctrl-C into a
//! cooperative stop first and a hard cancel second.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use foreman::config::{load_default_config, runtime_paths, Config, RuntimePaths};
use foreman::gate::EpicTestingMode;
use foreman::orchestrator::{
    CreateProjectRequest, InitializeOptions, Orchestrator, StartCodingOptions,
};
use foreman::runner::process::ProcessRunner;
use foreman::store::{SandboxType, Store};

/// Foreman: session orchestrator for autonomous code-generation projects.
#[derive(Parser)]
#[command(name = "foreman", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Create a project from a spec file.
    Create {
        /// Project name (`[a-z0-9_-]+`).
        name: String,
        /// Path to the specification file.
        spec: PathBuf,
        /// Epic-test gating mode: strict or autonomous.
        #[arg(long, default_value = "strict")]
        mode: String,
        /// Sandbox for sessions: docker or local.
        #[arg(long, default_value = "docker")]
        sandbox: String,
        /// Model override for initializer sessions.
        #[arg(long)]
        initializer_model: Option<String>,
        /// Model override for coding sessions.
        #[arg(long)]
        coding_model: Option<String>,
    },
    /// Run the initializer session and follow its events.
    Init {
        /// Project name.
        name: String,
        /// Model override for this session.
        #[arg(long)]
        model: Option<String>,
    },
    /// Run the coding loop and follow its events.
    Code {
        /// Project name.
        name: String,
        /// Sessions to run; 0 means until the roadmap is exhausted.
        #[arg(long, default_value_t = 0)]
        max_iterations: u64,
        /// Model override for this loop.
        #[arg(long)]
        model: Option<String>,
    },
    /// Print project status as JSON.
    Status {
        /// Project name.
        name: String,
    },
    /// List a project's sessions as JSON.
    Sessions {
        /// Project name.
        name: String,
    },
    /// Delete a project and everything it owns.
    Delete {
        /// Project name.
        name: String,
    },
    /// Resolve a blocked epic's interventions so coding can resume.
    Resume {
        /// Project name.
        name: String,
        /// The blocked epic's id.
        epic_id: Uuid,
    },
    /// Run one stale-session sweep and exit.
    Reap,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Create {
            name,
            spec,
            mode,
            sandbox,
            initializer_model,
            coding_model,
        } => {
            foreman::logging::init_cli();
            let (orch, _paths) = build_orchestrator().await?;
            let spec_text = std::fs::read_to_string(&spec)
                .with_context(|| format!("failed to read spec at {}", spec.display()))?;
            let project = orch
                .create_project(CreateProjectRequest {
                    name,
                    spec: spec_text,
                    epic_testing_mode: Some(parse_mode(&mode)?),
                    sandbox_type: Some(parse_sandbox(&sandbox)?),
                    initializer_model,
                    coding_model,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&project)?);
            Ok(())
        }
        Command::Init { name, model } => {
            let (orch, paths) = build_orchestrator().await?;
            let _logging_guard = foreman::logging::init_daemon(&paths.logs_dir)?;
            let project = project_by_name(&orch, &name).await?;

            let mut subscription = orch.subscribe(project.id).await?;
            let session = orch
                .initialize(project.id, InitializeOptions { model })
                .await?;
            info!(session_id = %session.id, "initializer session started");

            follow_events(&orch, project.id, &mut subscription, true).await;
            Ok(())
        }
        Command::Code {
            name,
            max_iterations,
            model,
        } => {
            let (orch, paths) = build_orchestrator().await?;
            let _logging_guard = foreman::logging::init_daemon(&paths.logs_dir)?;
            let project = project_by_name(&orch, &name).await?;

            let shutdown = watch_shutdown();
            let _reaper = orch.spawn_reaper(shutdown);

            let mut subscription = orch.subscribe(project.id).await?;
            orch.start_coding(
                project.id,
                StartCodingOptions {
                    max_iterations,
                    model,
                },
            )
            .await?;

            follow_events(&orch, project.id, &mut subscription, false).await;
            Ok(())
        }
        Command::Status { name } => {
            foreman::logging::init_cli();
            let (orch, _paths) = build_orchestrator().await?;
            let project = project_by_name(&orch, &name).await?;
            let status = orch.status(project.id).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "project": status.project,
                    "progress": status.progress,
                    "active_session": status.active_session,
                    "open_interventions": status.open_interventions,
                }))?
            );
            Ok(())
        }
        Command::Sessions { name } => {
            foreman::logging::init_cli();
            let (orch, _paths) = build_orchestrator().await?;
            let project = project_by_name(&orch, &name).await?;
            let sessions = orch.list_sessions(project.id).await?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
            Ok(())
        }
        Command::Delete { name } => {
            foreman::logging::init_cli();
            let (orch, _paths) = build_orchestrator().await?;
            let project = project_by_name(&orch, &name).await?;
            let counts = orch.delete_project(project.id).await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        Command::Resume { name, epic_id } => {
            foreman::logging::init_cli();
            let (orch, _paths) = build_orchestrator().await?;
            let project = project_by_name(&orch, &name).await?;
            let resolved = orch.resolve_intervention(project.id, epic_id).await?;
            println!("{}", serde_json::json!({ "resolved": resolved }));
            Ok(())
        }
        Command::Reap => {
            foreman::logging::init_cli();
            let (orch, _paths) = build_orchestrator().await?;
            let reaped = orch.reap_stale_sessions().await?;
            println!("{}", serde_json::json!({ "reaped": reaped }));
            Ok(())
        }
    }
}

/// Build the composition root: config, store, runner, orchestrator.
async fn build_orchestrator() -> anyhow::Result<(Orchestrator, RuntimePaths)> {
    let paths = runtime_paths()?;
    let config: Config = load_default_config()?;

    let store = Store::open(
        &paths.database,
        config.database.clone(),
        config.gate.clone(),
    )
    .await
    .with_context(|| format!("failed to open store at {}", paths.database.display()))?;

    let runner = Arc::new(ProcessRunner::new(config.runner.clone()));
    let orch = Orchestrator::new(Arc::new(store), runner, config);
    Ok((orch, paths))
}

/// Resolve a project by name.
async fn project_by_name(
    orch: &Orchestrator,
    name: &str,
) -> anyhow::Result<foreman::store::Project> {
    orch.store()
        .project_by_name(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no such project: {name}"))
}

/// Print the event stream as JSON lines until the work finishes.
///
/// `single_session` follows exactly one session (init); otherwise the loop
/// ends when the project's session slot is released. The first Ctrl-C
/// requests a cooperative stop, the second cancels the running session.
async fn follow_events(
    orch: &Orchestrator,
    project_id: Uuid,
    subscription: &mut foreman::events::Subscription,
    single_session: bool,
) {
    let mut interrupts: u32 = 0;
    let mut poll = tokio::time::interval(std::time::Duration::from_millis(500));

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
                let terminal = matches!(
                    event,
                    foreman::events::ProjectEvent::SessionComplete { .. }
                        | foreman::events::ProjectEvent::SessionError { .. }
                );
                if terminal && single_session {
                    break;
                }
            }
            _ = poll.tick() => {
                if !orch.is_busy(project_id).await {
                    break;
                }
            }
            result = tokio::signal::ctrl_c() => {
                if result.is_err() {
                    break;
                }
                interrupts = interrupts.saturating_add(1);
                if interrupts == 1 && !single_session {
                    eprintln!("stop requested; finishing the current session (Ctrl-C again to cancel)");
                    let _ = orch.stop_coding(project_id).await;
                } else {
                    eprintln!("cancelling the running session");
                    let _ = orch.cancel_session(project_id).await;
                }
            }
        }
    }
}

/// A shutdown channel that flips on the first Ctrl-C.
fn watch_shutdown() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });
    rx
}

/// Parse an epic-testing mode argument.
fn parse_mode(value: &str) -> anyhow::Result<EpicTestingMode> {
    EpicTestingMode::parse(value).map_err(|e| anyhow::anyhow!("{e} (expected strict|autonomous)"))
}

/// Parse a sandbox argument.
fn parse_sandbox(value: &str) -> anyhow::Result<SandboxType> {
    SandboxType::parse(value).map_err(|_| anyhow::anyhow!("invalid sandbox: {value:?} (expected docker|local)"))
}
