//! Foreman CLI - task orchestration and agent supervision
//!
//! Usage:
//!   foreman init                  Write a default .foreman/config.toml
//!   foreman run                   Run the orchestration loop
//!   foreman submit ...            Submit a task into the inbox
//!   foreman status                Show task and agent status
//!   foreman agents                List registered agents
//!   foreman reset-agent <name>    Clear a critical agent

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

use foreman_bus::NotificationBus;
use foreman_core::{ForemanConfig, Notification};
use foreman_orchestrator::{
    Orchestrator, OrchestratorConfig, StatusReport, SubmissionIntake, TaskSubmission,
    CONTROL_MAILBOX,
};
use foreman_store::StateStore;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(author, version, about = "Task orchestration and agent supervision")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Root directory holding the .foreman state directory
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .foreman/config.toml
    Init,

    /// Run the orchestration loop until interrupted
    Run,

    /// Submit a task into the inbox
    Submit {
        /// Capability tag the task needs (e.g. build, docs)
        #[arg(long = "type")]
        task_type: String,

        /// What the task should accomplish
        #[arg(long)]
        description: String,

        /// Priority 0-4; lower is more urgent
        #[arg(long, default_value = "2")]
        priority: i32,

        /// Task ids that must complete first (repeatable)
        #[arg(long = "depends-on")]
        dependencies: Vec<String>,

        /// Explicit task id (generated if omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Show task and agent status
    Status,

    /// List registered agents and their records
    Agents,

    /// Clear a critical agent so supervision resumes
    ResetAgent {
        /// Agent name (aliases resolve to the canonical record)
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let data_dir = cli.root.join(".foreman");

    match cli.command {
        Commands::Init => {
            ForemanConfig::write_default(&cli.root).context("Failed to write config")?;
            println!("Wrote {}", cli.root.join(".foreman/config.toml").display());
        }

        Commands::Run => {
            let config =
                ForemanConfig::load_or_default(&cli.root).context("Failed to load config")?;
            if config.agents.is_empty() {
                println!("Note: no agents configured; run `foreman init` and edit .foreman/config.toml");
            }

            let mut orchestrator =
                Orchestrator::new(OrchestratorConfig::new(&data_dir).with_config(config))
                    .await
                    .context("Failed to start orchestrator")?;

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(true);
            });

            orchestrator.run(shutdown_rx).await?;
        }

        Commands::Submit {
            task_type,
            description,
            priority,
            dependencies,
            id,
        } => {
            let submission = TaskSubmission {
                id,
                task_type,
                description,
                priority,
                dependencies,
            };
            let intake = SubmissionIntake::new(&data_dir);
            let path = intake
                .submit(&submission)
                .await
                .context("Failed to write submission")?;
            println!("Submitted: {}", path.display());
        }

        Commands::Status => {
            let store = StateStore::open(data_dir.join("state"))
                .await
                .context("Failed to open state store")?;
            let tasks = store.tasks().all().await?;
            let agents = store.agents().all().await?;
            print!("{}", StatusReport::collect(&tasks, agents));
        }

        Commands::Agents => {
            let config = ForemanConfig::load_or_default(&cli.root)?;
            let store = StateStore::open(data_dir.join("state"))
                .await
                .context("Failed to open state store")?;

            for def in &config.agents {
                let record = store.agents().get(&def.name).await?;
                let status = record
                    .map(|r| r.status.to_string())
                    .unwrap_or_else(|| "unregistered".to_string());
                println!(
                    "{}  [{}]  capabilities: {}  priority: {}",
                    def.name,
                    status,
                    def.capabilities.join(", "),
                    def.static_priority
                );
            }
            if config.agents.is_empty() {
                println!("No agents configured.");
            }
        }

        Commands::ResetAgent { name } => {
            let bus = NotificationBus::new(data_dir.join("mailboxes"));
            bus.notify(
                CONTROL_MAILBOX,
                &Notification::status_change(format!("reset_agent:{}", name)),
            )
            .await
            .context("Failed to queue reset")?;
            println!(
                "Reset queued for {}; the running orchestrator applies it on its next cycle",
                name
            );
        }
    }

    Ok(())
}
