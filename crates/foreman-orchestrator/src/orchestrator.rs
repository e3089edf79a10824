//! The orchestration control loop.

use chrono::Duration as ChronoDuration;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use foreman_bus::{MailboxConsumer, NotificationBus};
use foreman_core::admission::{best_effort, AdmissionGate, ResourceBudget};
use foreman_core::{AgentRegistry, ForemanConfig, Result};
use foreman_health::{ProcessProbe, SystemProbe};
use foreman_scheduler::Scheduler;
use foreman_store::StateStore;
use foreman_supervisor::{AgentLauncher, AlertHistory, ProcessLauncher, Supervisor};

use crate::ingest::SubmissionIntake;
use crate::report::{ReportWriter, StatusReport};

/// Mailbox the orchestrator itself drains for operator control commands
/// (`reset_agent:<name>`, `stop_agent:<name>`).
pub const CONTROL_MAILBOX: &str = "foreman";

/// Configuration for an orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding state, mailboxes, logs, and the inbox
    pub data_dir: PathBuf,
    /// Runtime configuration
    pub config: ForemanConfig,
}

impl OrchestratorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            config: ForemanConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ForemanConfig) -> Self {
        self.config = config;
        self
    }
}

/// The top-level driver tying scheduler, health monitor, and supervisor into
/// one periodic control loop.
pub struct Orchestrator<L: AgentLauncher, P: ProcessProbe> {
    store: StateStore,
    bus: NotificationBus,
    scheduler: Scheduler,
    supervisor: Supervisor<L, P>,
    intake: SubmissionIntake,
    report: ReportWriter,
    control: MailboxConsumer,
    gate: AdmissionGate,
    config: ForemanConfig,
    cycles: u64,
}

impl Orchestrator<ProcessLauncher, SystemProbe> {
    /// Create an orchestrator backed by real processes.
    pub async fn new(config: OrchestratorConfig) -> Result<Self> {
        let launcher = ProcessLauncher::new(config.data_dir.join("logs"));
        Self::with_components(config, launcher, SystemProbe).await
    }
}

impl<L: AgentLauncher, P: ProcessProbe> Orchestrator<L, P> {
    /// Create an orchestrator with custom launcher and probe implementations.
    pub async fn with_components(
        orchestrator_config: OrchestratorConfig,
        launcher: L,
        probe: P,
    ) -> Result<Self> {
        let OrchestratorConfig { data_dir, config } = orchestrator_config;

        let store = StateStore::open(data_dir.join("state")).await?;
        let bus = NotificationBus::new(data_dir.join("mailboxes"));
        let alerts =
            AlertHistory::load(data_dir.join("alerts.json"), config.alert_window_minutes).await;

        let supervisor = Supervisor::new(
            AgentRegistry::new(config.agents.clone()),
            launcher,
            probe,
            store.clone(),
            bus.clone(),
            &config,
            data_dir.join("logs"),
            alerts,
        );
        let scheduler = Scheduler::new(
            store.clone(),
            bus.clone(),
            AgentRegistry::new(config.agents.clone()),
            &config,
        );
        let gate = AdmissionGate::new(
            ResourceBudget {
                max_load: config.load_threshold,
                max_open_files: 512,
                max_instances: config.max_concurrency,
            },
            Duration::from_secs(config.wait_when_busy_secs),
        );
        let control = MailboxConsumer::open(&data_dir.join("mailboxes"), CONTROL_MAILBOX).await;

        Ok(Self {
            store,
            bus,
            scheduler,
            supervisor,
            intake: SubmissionIntake::new(&data_dir),
            report: ReportWriter::new(&data_dir),
            control,
            gate,
            config,
            cycles: 0,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Run the control loop until the shutdown signal flips to `true`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Orchestrator starting: {} agents registered, cycle every {}s",
            self.config.agents.len(),
            self.config.loop_interval_secs
        );

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.loop_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received; stopping orchestrator");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// One orchestration cycle. Every step is fail-open: a failing step is
    /// logged and the rest of the cycle still runs.
    pub async fn cycle(&mut self) {
        self.cycles += 1;
        debug!("Orchestration cycle {}", self.cycles);

        self.handle_control_commands().await;
        self.ingest_submissions().await;

        best_effort("orchestrator::reconcile_completions", || {
            self.scheduler.reconcile_completions()
        })
        .await;
        best_effort("orchestrator::release_stale_busy", || {
            self.store.release_stale_busy()
        })
        .await;

        best_effort("orchestrator::supervision_pass", || self.supervisor.pass()).await;

        best_effort("orchestrator::distribute_tasks", || {
            self.scheduler.distribute_tasks()
        })
        .await;
        best_effort("orchestrator::requeue_stuck", || self.scheduler.requeue_stuck()).await;
        best_effort("orchestrator::requeue_failed", || {
            self.scheduler.requeue_failed_tasks()
        })
        .await;

        let retention = self.config.retention.clone();
        best_effort("orchestrator::prune_agents", || {
            self.store
                .prune_stale_agents(ChronoDuration::hours(retention.agent_stale_hours))
        })
        .await;
        best_effort("orchestrator::prune_tasks", || {
            self.store.prune_terminal_tasks(
                ChronoDuration::hours(retention.completed_hours),
                ChronoDuration::hours(retention.failed_hours),
            )
        })
        .await;

        if self.cycles % self.config.status_report_every.max(1) == 0 {
            self.emit_report().await;
        }
    }

    /// Drain the control mailbox and apply operator commands.
    async fn handle_control_commands(&mut self) {
        let commands = match self.control.poll().await {
            Ok(commands) => commands,
            Err(e) => {
                warn!("Control mailbox poll failed: {}", e);
                return;
            }
        };

        for command in commands {
            match command.payload.split_once(':') {
                Some(("reset_agent", name)) => {
                    let name = name.trim();
                    info!("Operator requested reset of agent {}", name);
                    if let Err(e) = self.supervisor.reset_agent(name).await {
                        warn!("Reset of {} failed: {}", name, e);
                    }
                }
                Some(("stop_agent", name)) => {
                    let name = name.trim();
                    info!("Operator requested stop of agent {}", name);
                    if let Err(e) = self.supervisor.stop_agent(name).await {
                        warn!("Stop of {} failed: {}", name, e);
                    }
                }
                _ => warn!("Unrecognized control command: {}", command.payload),
            }
        }
    }

    /// Ingest submissions, gated on the resource budget.
    async fn ingest_submissions(&self) {
        match self.gate.admit("ingest_submissions").await {
            Ok(_permit) => {
                best_effort("orchestrator::ingest", || self.intake.ingest(&self.store)).await;
            }
            Err(e) => warn!("Submission ingest deferred this cycle: {}", e),
        }
    }

    async fn emit_report(&self) {
        let Some(tasks) = best_effort("report::tasks", || self.store.tasks().all()).await else {
            return;
        };
        let Some(agents) = best_effort("report::agents", || self.store.agents().all()).await
        else {
            return;
        };

        let report = StatusReport::collect(&tasks, agents);
        info!("Status: {}", report.summary_line());
        best_effort("report::write", || self.report.write(&report)).await;
    }
}
