use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use cadence_core::{LockInterface, LockMode, SessionLock};
use cadence_orchestrator::{build_runtime, RuntimeOptions, WorkflowContext};
use cadence_server::{serve, AppState, HubConfig};
use cadence_types::{ScaleLevel, WorkflowRunStatus};

mod collaborators;

use collaborators::{process_agent_executor, KeywordAnalysis, TranscriptCeremonyRunner};

#[derive(Parser, Debug)]
#[command(name = "cadence-engine")]
#[command(about = "Headless Cadence development orchestrator")]
struct Cli {
    /// Project root; defaults to the current directory.
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the observability server (read lock; never mutates).
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 4114)]
        port: u16,
    },
    /// Plan and execute a development request end to end.
    Run {
        prompt: String,
        /// Override the assessed scale level (0-4).
        #[arg(long)]
        scale_level: Option<i64>,
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
    },
    /// Inspect or force-remove the session lock.
    Unlock {
        /// Remove the lock file (refused while the holder is alive).
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let project_root = match &cli.project_root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };

    match cli.command {
        Command::Serve { hostname, port } => {
            let runtime = build_runtime(
                &project_root,
                runtime_options(&project_root, LockInterface::Web, LockMode::Read, 3)?,
            )
            .await?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let state = AppState::new(
                project_root,
                runtime.session_lock.clone(),
                runtime.event_bus.clone(),
                HubConfig {
                    max_connections: runtime.config.max_connections(),
                    ..HubConfig::default()
                },
            );
            info!("starting cadence-engine on http://{addr}");
            let served = serve(addr, state).await;
            runtime.shutdown();
            served?;
        }
        Command::Run {
            prompt,
            scale_level,
            max_retries,
        } => {
            let force_scale = match scale_level {
                Some(value) => Some(
                    ScaleLevel::from_value(value)
                        .with_context(|| format!("invalid scale level: {value}"))?,
                ),
                None => None,
            };
            let runtime = build_runtime(
                &project_root,
                runtime_options(&project_root, LockInterface::Cli, LockMode::Write, max_retries)?,
            )
            .await?;

            let sequence = runtime.planner.assess_and_select(&prompt, force_scale).await;
            if sequence.needs_clarification() {
                println!("The request needs clarification before planning:");
                for question in &sequence.clarifying_questions {
                    println!("  - {question}");
                }
                runtime.shutdown();
                return Ok(());
            }
            info!(
                scale_level = sequence.scale_level.value(),
                workflows = sequence.workflows.len(),
                rationale = sequence.routing_rationale,
                "sequence planned"
            );

            let mut context = WorkflowContext {
                initial_prompt: prompt,
                project_root: project_root.clone(),
                scale_level: Some(sequence.scale_level),
                project_type: Some(sequence.project_type),
                ..WorkflowContext::default()
            };
            let result = runtime.coordinator.execute_sequence(&sequence, &mut context).await;
            runtime.shutdown();

            println!(
                "{}: {} steps, {} artifacts",
                result.status.as_str(),
                result.step_results.len(),
                result.total_artifacts,
            );
            if result.status != WorkflowRunStatus::Completed {
                anyhow::bail!(
                    "sequence {}: {}",
                    result.status.as_str(),
                    result.error_message.unwrap_or_default()
                );
            }
        }
        Command::Unlock { force } => {
            let lock = SessionLock::new(&project_root);
            if !lock.lock_file_path().exists() {
                println!("No session lock found.");
                return Ok(());
            }
            let state = lock.get_lock_state();
            if let Some(holder) = state.holder {
                println!("Session locked by: {}", holder.as_str());
                if let Some(timestamp) = &state.timestamp {
                    println!("Lock timestamp: {timestamp}");
                }
            }
            if !force {
                println!("Use --force to remove the lock file");
                return Ok(());
            }
            lock.force_unlock().context("force unlock failed")?;
            println!("Lock removed successfully.");
        }
    }

    Ok(())
}

fn runtime_options(
    project_root: &std::path::Path,
    interface: LockInterface,
    lock_mode: LockMode,
    max_retries: u32,
) -> anyhow::Result<RuntimeOptions> {
    let config = cadence_core::ConfigStore::load(project_root)?;
    let agent_command = config
        .agent_command()
        .map(str::to_string)
        .unwrap_or_else(|| "cat".to_string());
    Ok(RuntimeOptions {
        interface,
        lock_mode,
        agent_executor: process_agent_executor(project_root.to_path_buf(), agent_command),
        analysis: Arc::new(KeywordAnalysis),
        ceremony_runner: Arc::new(TranscriptCeremonyRunner),
        max_retries,
    })
}
