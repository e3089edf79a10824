//! Per-cycle supervision pass over the agent pool.
//!
//! The supervisor consumes health classifications and drives each agent's
//! record through the pure state machine, executing the resulting actions:
//! launching processes, persisting status, and escalating exhausted restart
//! budgets to the operator.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use foreman_bus::NotificationBus;
use foreman_core::admission::best_effort;
use foreman_core::{
    AgentDefinition, AgentRecord, AgentRegistry, AgentStatus, ForemanConfig, ForemanError,
    Notification, RestartConfig, Result,
};
use foreman_health::{read_recent_lines, HealthMonitor, HealthStatus, ProcessProbe};
use foreman_store::StateStore;

use crate::alerts::AlertHistory;
use crate::budget::{RestartBudget, RestartDecision};
use crate::state::{transition, SupervisionEvent, SupervisorAction};

/// Launches and kills agent processes.
///
/// A trait so supervision logic can be exercised without real processes.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Start the agent's process; returns the new pid.
    async fn launch(&self, def: &AgentDefinition) -> Result<u32>;

    /// Kill a previously launched process.
    async fn kill(&self, pid: u32) -> Result<()>;
}

/// Launcher backed by real OS processes.
///
/// The child's stdout/stderr are appended to `<log_dir>/<agent>.log`, which
/// is the same file the health monitor tails.
pub struct ProcessLauncher {
    log_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(&self, def: &AgentDefinition) -> Result<u32> {
        let program = def.command.first().ok_or_else(|| {
            ForemanError::Launch(format!("agent {} has no launch command", def.name))
        })?;

        std::fs::create_dir_all(&self.log_dir)?;
        let log_path = self.log_dir.join(format!("{}.log", def.name));
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let stderr = stdout.try_clone()?;

        let mut child = tokio::process::Command::new(program)
            .args(&def.command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| ForemanError::Launch(format!("{}: {}", def.name, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| ForemanError::Launch(format!("{}: no pid after spawn", def.name)))?;

        // Reap the child when it exits; liveness tracking goes via the probe
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        info!("Launched agent {} with pid {}", def.name, pid);
        Ok(pid)
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        let status = tokio::process::Command::new("kill")
            .arg(pid.to_string())
            .status()
            .await?;
        if !status.success() {
            // Already-dead processes are fine here; restart flows kill defensively
            debug!("kill {} exited with {}", pid, status);
        }
        Ok(())
    }
}

/// Scripted launcher for tests: hands out sequential pids and records calls.
#[derive(Debug)]
pub struct MockLauncher {
    next_pid: AtomicU32,
    launches: Mutex<Vec<String>>,
    kills: Mutex<Vec<u32>>,
    fail_launch: AtomicBool,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            launches: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            fail_launch: AtomicBool::new(false),
        }
    }
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> Vec<String> {
        self.launches.lock().unwrap().clone()
    }

    pub fn kills(&self) -> Vec<u32> {
        self.kills.lock().unwrap().clone()
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentLauncher for MockLauncher {
    async fn launch(&self, def: &AgentDefinition) -> Result<u32> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(ForemanError::Launch(format!("{}: scripted failure", def.name)));
        }
        self.launches.lock().unwrap().push(def.name.clone());
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        self.kills.lock().unwrap().push(pid);
        Ok(())
    }
}

/// Supervisor for the agent pool.
pub struct Supervisor<L: AgentLauncher, P: ProcessProbe> {
    registry: AgentRegistry,
    launcher: L,
    probe: P,
    monitor: HealthMonitor,
    store: StateStore,
    bus: NotificationBus,
    budgets: HashMap<String, RestartBudget>,
    alerts: AlertHistory,
    restart_config: RestartConfig,
    window_lines: usize,
    unresponsive_after: Duration,
    log_dir: PathBuf,
    escalation_mailbox: String,
    auto_start: bool,
}

impl<L: AgentLauncher, P: ProcessProbe> Supervisor<L, P> {
    pub fn new(
        registry: AgentRegistry,
        launcher: L,
        probe: P,
        store: StateStore,
        bus: NotificationBus,
        config: &ForemanConfig,
        log_dir: impl Into<PathBuf>,
        alerts: AlertHistory,
    ) -> Self {
        Self {
            registry,
            launcher,
            probe,
            monitor: HealthMonitor::new(&config.health),
            store,
            bus,
            budgets: HashMap::new(),
            alerts,
            restart_config: config.restart.clone(),
            window_lines: config.health.window_lines,
            unresponsive_after: Duration::seconds(config.health.unresponsive_after_secs),
            log_dir: log_dir.into(),
            escalation_mailbox: config.escalation_mailbox.clone(),
            auto_start: true,
        }
    }

    /// Disable automatic starting of Unknown/Stopped agents.
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// One supervision pass over every registered agent.
    ///
    /// Per-agent failures are logged and skipped; one broken agent never
    /// stops supervision of the rest of the pool.
    pub async fn pass(&mut self) -> Result<()> {
        let defs: Vec<AgentDefinition> = self.registry.definitions().cloned().collect();
        for def in defs {
            if let Err(e) = self.supervise(&def).await {
                warn!("Supervision of {} failed, continuing: {}", def.name, e);
            }
        }
        Ok(())
    }

    async fn supervise(&mut self, def: &AgentDefinition) -> Result<()> {
        let record = self.load_or_register(def).await?;

        // A reset record means the operator cleared the breaker externally;
        // drop the in-memory budget so supervision starts fresh.
        if record.status == AgentStatus::Unknown && record.restart_count == 0 {
            self.budgets.remove(&def.name);
        }

        if record.status == AgentStatus::Critical {
            debug!("Agent {} is critical; awaiting manual reset", def.name);
            return Ok(());
        }

        if matches!(record.status, AgentStatus::Unknown | AgentStatus::Stopped) {
            if self.auto_start && !def.command.is_empty() {
                return self.try_restart(def, &record, "start").await;
            }
            return Ok(());
        }

        let log_path = self.log_dir.join(format!("{}.log", def.name));
        let lines = read_recent_lines(&log_path, self.window_lines)
            .await
            .unwrap_or_default();
        let health = self.monitor.classify(&self.probe, &record, &lines);

        match health {
            HealthStatus::Critical | HealthStatus::Crashed => {
                info!("Agent {} classified {}; requesting restart", def.name, health);
                self.try_restart(def, &record, &health.to_string()).await
            }
            HealthStatus::Degraded => {
                warn!("Agent {} is degraded (elevated error rate)", def.name);
                self.check_responsiveness(def, &record).await
            }
            HealthStatus::Healthy => self.check_responsiveness(def, &record).await,
        }
    }

    /// Heartbeat bookkeeping: the agent's own `last_seen` writes are the
    /// heartbeat; the supervisor only reacts to their age.
    async fn check_responsiveness(&mut self, def: &AgentDefinition, record: &AgentRecord) -> Result<()> {
        let stale = Utc::now() - record.last_seen > self.unresponsive_after;

        match (record.status, stale) {
            (AgentStatus::Unresponsive, true) => {
                self.try_restart(def, record, "unresponsive").await
            }
            (AgentStatus::Unresponsive, false) => {
                self.apply_transition(def, record.status, SupervisionEvent::HeartbeatSeen)
                    .await
            }
            (AgentStatus::Available | AgentStatus::Busy | AgentStatus::Idle, true) => {
                warn!(
                    "Agent {} has not reported since {}; marking unresponsive",
                    def.name, record.last_seen
                );
                self.apply_transition(def, record.status, SupervisionEvent::HeartbeatMissed)
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Run one event through the state machine and persist the result.
    async fn apply_transition(
        &mut self,
        def: &AgentDefinition,
        status: AgentStatus,
        event: SupervisionEvent,
    ) -> Result<()> {
        let (next, actions) = transition(&def.name, status, event);
        if actions.contains(&SupervisorAction::PersistStatus) {
            self.store
                .agents()
                .update(&def.name, move |agent| {
                    agent.status = next;
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    async fn try_restart(
        &mut self,
        def: &AgentDefinition,
        record: &AgentRecord,
        reason: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let budget = self
            .budgets
            .entry(def.name.clone())
            .or_insert_with(|| RestartBudget::new(&self.restart_config));

        match budget.evaluate(now) {
            RestartDecision::Allow => {
                budget.record(now);
                let window_count = budget.count(now);
                let (next, actions) =
                    transition(&def.name, record.status, SupervisionEvent::RestartApproved);
                self.apply_restart(def, record, next, &actions, window_count, reason)
                    .await
            }
            RestartDecision::Throttled { retry_after } => {
                debug!(
                    "Restart of {} throttled ({}); retrying in {}s",
                    def.name,
                    reason,
                    retry_after.num_seconds()
                );
                Ok(())
            }
            RestartDecision::Exhausted => self.escalate(def, record).await,
        }
    }

    async fn apply_restart(
        &mut self,
        def: &AgentDefinition,
        record: &AgentRecord,
        restarting: AgentStatus,
        actions: &[SupervisorAction],
        window_count: u32,
        reason: &str,
    ) -> Result<()> {
        if actions.contains(&SupervisorAction::Kill) {
            if let Some(pid) = record.pid {
                if let Err(e) = self.launcher.kill(pid).await {
                    warn!("Failed to kill pid {} of {}: {}", pid, def.name, e);
                }
            }
        }

        if !actions.contains(&SupervisorAction::Launch) {
            return Ok(());
        }

        match self.launcher.launch(def).await {
            Ok(pid) => {
                let (settled, _) =
                    transition(&def.name, restarting, SupervisionEvent::Spawned { pid });
                info!(
                    "Agent {} restarted ({}; pid {}, restart {}/{} in window)",
                    def.name, reason, pid, window_count, self.restart_config.limit
                );
                self.store
                    .agents()
                    .update(&def.name, move |agent| {
                        agent.status = settled;
                        agent.pid = Some(pid);
                        agent.restart_count = window_count;
                        // Give the fresh process a full staleness window
                        agent.touch();
                        Ok(())
                    })
                    .await?;
            }
            Err(e) => {
                warn!("Launch of {} failed: {}", def.name, e);
                let (settled, _) = transition(
                    &def.name,
                    restarting,
                    SupervisionEvent::SpawnFailed {
                        reason: e.to_string(),
                    },
                );
                self.store
                    .agents()
                    .update(&def.name, move |agent| {
                        agent.status = settled;
                        agent.pid = None;
                        agent.restart_count = window_count;
                        Ok(())
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Restart budget exhausted: mark Critical, alert the operator once.
    async fn escalate(&mut self, def: &AgentDefinition, record: &AgentRecord) -> Result<()> {
        let (next, actions) =
            transition(&def.name, record.status, SupervisionEvent::BudgetExhausted);

        self.store
            .agents()
            .update(&def.name, move |agent| {
                agent.status = next;
                Ok(())
            })
            .await?;
        warn!(
            "Agent {} exceeded its restart budget ({} in {}s); marked critical, auto-restart disabled",
            def.name, self.restart_config.limit, self.restart_config.window_secs
        );

        let now = Utc::now();
        for action in actions {
            if let SupervisorAction::Alert { key, message } = action {
                if self.alerts.should_emit(&key, &message, now) {
                    self.bus
                        .notify(
                            &self.escalation_mailbox,
                            &Notification::emergency(message.as_str()),
                        )
                        .await?;
                    best_effort("alert_history::persist", || self.alerts.persist()).await;
                }
            }
        }
        Ok(())
    }

    /// Manual reset: clear the breaker so supervision starts over.
    pub async fn reset_agent(&mut self, name: &str) -> Result<()> {
        let canonical = self
            .registry
            .canonical_name(name)
            .unwrap_or(name)
            .to_string();

        if let Some(budget) = self.budgets.get_mut(&canonical) {
            budget.reset();
        }

        let (next, _) = transition(&canonical, AgentStatus::Critical, SupervisionEvent::ManualReset);
        self.store
            .agents()
            .update(&canonical, move |agent| {
                agent.status = next;
                agent.restart_count = 0;
                agent.pid = None;
                Ok(())
            })
            .await?;

        info!("Agent {} manually reset; supervision resumes", canonical);
        Ok(())
    }

    /// Orderly stop of one agent.
    pub async fn stop_agent(&mut self, name: &str) -> Result<()> {
        let canonical = self
            .registry
            .canonical_name(name)
            .unwrap_or(name)
            .to_string();

        let record = self
            .store
            .agents()
            .get(&canonical)
            .await?
            .ok_or_else(|| ForemanError::AgentNotFound(canonical.clone()))?;

        let (next, actions) =
            transition(&canonical, record.status, SupervisionEvent::StopRequested);

        if actions.contains(&SupervisorAction::Kill) {
            if let Some(pid) = record.pid {
                if let Err(e) = self.launcher.kill(pid).await {
                    warn!("Failed to kill pid {} of {}: {}", pid, canonical, e);
                }
            }
        }

        self.store
            .agents()
            .update(&canonical, move |agent| {
                agent.status = next;
                agent.pid = None;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn load_or_register(&self, def: &AgentDefinition) -> Result<AgentRecord> {
        if let Some(record) = self.store.agents().get(&def.name).await? {
            return Ok(record);
        }

        let record = AgentRecord::new(&def.name).with_capabilities(def.capabilities.clone());
        match self.store.agents().create(record.clone()).await {
            Ok(()) => Ok(record),
            // Another writer registered concurrently; take their record
            Err(_) => self
                .store
                .agents()
                .get(&def.name)
                .await?
                .ok_or_else(|| ForemanError::AgentNotFound(def.name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::{AgentStatus, NotificationKind};
    use foreman_health::MockProbe;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        store: StateStore,
        bus: NotificationBus,
        supervisor: Supervisor<MockLauncher, MockProbe>,
    }

    async fn fixture(config: ForemanConfig, probe: MockProbe) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::open(temp_dir.path().join("state")).await.unwrap();
        let bus = NotificationBus::new(temp_dir.path().join("mailboxes"));

        let registry = AgentRegistry::new(vec![AgentDefinition::new("builder")
            .with_capabilities(vec!["build".to_string()])
            .with_command(vec!["./builder".to_string()])]);

        let supervisor = Supervisor::new(
            registry,
            MockLauncher::new(),
            probe,
            store.clone(),
            bus.clone(),
            &config,
            temp_dir.path().join("logs"),
            AlertHistory::new(config.alert_window_minutes),
        );

        Fixture {
            _temp_dir: temp_dir,
            store,
            bus,
            supervisor,
        }
    }

    fn storm_config() -> ForemanConfig {
        let mut config = ForemanConfig::default();
        config.restart.limit = 5;
        config.restart.throttle_secs = 0;
        config.restart.window_secs = 600;
        config
    }

    async fn seed_available(store: &StateStore, pid: u32) {
        store
            .record_agent_status("builder", AgentStatus::Available, Some(pid))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_crashed_agent_is_restarted() {
        let mut f = fixture(storm_config(), MockProbe::new()).await;
        seed_available(&f.store, 999).await;

        f.supervisor.pass().await.unwrap();

        let agent = f.store.agents().get("builder").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        assert_eq!(agent.restart_count, 1);
        assert_ne!(agent.pid, Some(999));
        assert_eq!(f.supervisor.launcher.launches().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_storm_trips_breaker_once() {
        let mut f = fixture(storm_config(), MockProbe::new()).await;
        seed_available(&f.store, 999).await;

        // Every restarted pid is also dead, so each pass is a fresh crash.
        // Limit 5: passes 1-5 restart, pass 6 trips the breaker, 7+ are inert.
        for _ in 0..8 {
            f.supervisor.pass().await.unwrap();
        }

        let agent = f.store.agents().get("builder").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Critical);
        assert_eq!(f.supervisor.launcher.launches().len(), 5);

        // Exactly one agent_critical escalation
        let alerts = f.bus.mailbox("operator").drain().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, NotificationKind::EmergencyBroadcast);
        assert!(alerts[0].payload.contains("builder"));
    }

    #[tokio::test]
    async fn test_throttle_defers_second_restart() {
        let mut config = storm_config();
        config.restart.throttle_secs = 60;
        let mut f = fixture(config, MockProbe::new()).await;
        seed_available(&f.store, 999).await;

        f.supervisor.pass().await.unwrap();
        f.supervisor.pass().await.unwrap();

        // Second crash within the throttle interval: restart deferred
        assert_eq!(f.supervisor.launcher.launches().len(), 1);
        let agent = f.store.agents().get("builder").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
    }

    #[tokio::test]
    async fn test_healthy_agent_left_alone() {
        let probe = MockProbe::with_alive([999]);
        let mut f = fixture(storm_config(), probe).await;
        seed_available(&f.store, 999).await;

        f.supervisor.pass().await.unwrap();

        let agent = f.store.agents().get("builder").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        assert!(f.supervisor.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn test_silent_agent_marked_unresponsive_then_restarted() {
        let probe = MockProbe::with_alive([999]);
        let mut f = fixture(storm_config(), probe).await;
        seed_available(&f.store, 999).await;

        // Age the heartbeat past the threshold
        f.store
            .agents()
            .update("builder", |agent| {
                agent.last_seen = Utc::now() - Duration::seconds(600);
                Ok(())
            })
            .await
            .unwrap();

        f.supervisor.pass().await.unwrap();
        let agent = f.store.agents().get("builder").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Unresponsive);

        // Still silent next cycle: restart
        f.store
            .agents()
            .update("builder", |agent| {
                agent.last_seen = Utc::now() - Duration::seconds(600);
                Ok(())
            })
            .await
            .unwrap();
        f.supervisor.pass().await.unwrap();

        let agent = f.store.agents().get("builder").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        assert_eq!(f.supervisor.launcher.launches().len(), 1);
        assert_eq!(f.supervisor.launcher.kills(), vec![999]);
    }

    #[tokio::test]
    async fn test_unresponsive_agent_recovers_on_heartbeat() {
        let probe = MockProbe::with_alive([999]);
        let mut f = fixture(storm_config(), probe).await;
        f.store
            .record_agent_status("builder", AgentStatus::Unresponsive, Some(999))
            .await
            .unwrap();

        // record_agent_status touched last_seen, so the agent is fresh again
        f.supervisor.pass().await.unwrap();

        let agent = f.store.agents().get("builder").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        assert!(f.supervisor.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn test_auto_start_of_unregistered_agent() {
        let mut f = fixture(storm_config(), MockProbe::new()).await;

        // No record yet: first pass registers and starts the agent
        f.supervisor.pass().await.unwrap();

        let agent = f.store.agents().get("builder").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        assert!(agent.pid.is_some());
        assert_eq!(agent.capabilities, vec!["build"]);
    }

    #[tokio::test]
    async fn test_reset_agent_clears_breaker() {
        let mut f = fixture(storm_config(), MockProbe::new()).await;
        seed_available(&f.store, 999).await;

        for _ in 0..6 {
            f.supervisor.pass().await.unwrap();
        }
        assert_eq!(
            f.store.agents().get("builder").await.unwrap().unwrap().status,
            AgentStatus::Critical
        );

        f.supervisor.reset_agent("builder").await.unwrap();
        let agent = f.store.agents().get("builder").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Unknown);
        assert_eq!(agent.restart_count, 0);

        // Supervision resumes: the next pass auto-starts the agent again
        f.supervisor.pass().await.unwrap();
        assert_eq!(f.supervisor.launcher.launches().len(), 6);
    }

    #[tokio::test]
    async fn test_spawn_failure_goes_stopped() {
        let mut f = fixture(storm_config(), MockProbe::new()).await;
        seed_available(&f.store, 999).await;
        f.supervisor.launcher.set_fail_launch(true);

        f.supervisor.pass().await.unwrap();

        let agent = f.store.agents().get("builder").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Stopped);
        assert!(agent.pid.is_none());
    }

    #[tokio::test]
    async fn test_stop_agent_kills_and_persists() {
        let probe = MockProbe::with_alive([999]);
        let mut f = fixture(storm_config(), probe).await;
        seed_available(&f.store, 999).await;

        f.supervisor.stop_agent("builder").await.unwrap();

        let agent = f.store.agents().get("builder").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Stopped);
        assert_eq!(f.supervisor.launcher.kills(), vec![999]);
    }
}
