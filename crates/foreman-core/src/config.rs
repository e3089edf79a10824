//! Configuration management for Foreman
//!
//! This module provides configuration structures for the orchestrator,
//! including the control-loop cadence, restart circuit-breaker parameters,
//! retention windows, health thresholds, and the agent definition registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

use crate::{AgentDefinition, Result};

/// Top-level Foreman configuration
///
/// Loaded from `.foreman/config.toml` in the data root; every field has a
/// default so a missing file yields a runnable configuration. A small set of
/// environment variables overrides the file (see [`ForemanConfig::apply_env`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForemanConfig {
    /// Maximum simultaneous instances of one expensive operation
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// System load ceiling before admission throttles new work
    #[serde(default = "default_load_threshold")]
    pub load_threshold: f64,

    /// Base backoff in seconds when the resource budget is exceeded
    #[serde(default = "default_wait_when_busy_secs")]
    pub wait_when_busy_secs: u64,

    /// Orchestrator control-loop period in seconds
    #[serde(default = "default_loop_interval_secs")]
    pub loop_interval_secs: u64,

    /// Restart circuit-breaker parameters
    #[serde(default)]
    pub restart: RestartConfig,

    /// Retention windows for terminal tasks and stale agents
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Health classification thresholds
    #[serde(default)]
    pub health: HealthConfig,

    /// Window for deduplicating operator alerts, in minutes
    #[serde(default = "default_alert_window_minutes")]
    pub alert_window_minutes: i64,

    /// Whether failed tasks are routed back through the queue
    #[serde(default)]
    pub requeue_failed: bool,

    /// A task stuck in_progress longer than this is forcibly requeued
    #[serde(default = "default_in_progress_timeout_secs")]
    pub in_progress_timeout_secs: i64,

    /// Emit a status report every N control-loop cycles
    #[serde(default = "default_status_report_every")]
    pub status_report_every: u64,

    /// Mailbox that receives operator escalations
    #[serde(default = "default_escalation_mailbox")]
    pub escalation_mailbox: String,

    /// Agent definitions (the registry source)
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,

    /// Static task-type to agent-name routing, consulted before scoring
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
}

/// Restart circuit-breaker parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Maximum restarts inside the rolling window before an agent is Critical
    #[serde(default = "default_restart_limit")]
    pub limit: u32,

    /// Minimum seconds between consecutive restarts of one agent
    #[serde(default = "default_restart_throttle_secs")]
    pub throttle_secs: i64,

    /// Rolling window for the restart counter, in seconds
    #[serde(default = "default_restart_window_secs")]
    pub window_secs: i64,
}

/// Retention windows for pruning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Hours to keep completed tasks before pruning
    #[serde(default = "default_completed_retention_hours")]
    pub completed_hours: i64,

    /// Hours to keep failed tasks before pruning
    #[serde(default = "default_failed_retention_hours")]
    pub failed_hours: i64,

    /// Hours without a heartbeat before an agent record is pruned
    #[serde(default = "default_agent_stale_hours")]
    pub agent_stale_hours: i64,
}

/// Health classification thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Number of trailing log lines inspected per cycle
    #[serde(default = "default_health_window_lines")]
    pub window_lines: usize,

    /// Error-line count in the window that marks an agent Degraded
    #[serde(default = "default_degraded_error_threshold")]
    pub degraded_error_threshold: usize,

    /// Seconds without a heartbeat before a live agent is Unresponsive
    #[serde(default = "default_unresponsive_after_secs")]
    pub unresponsive_after_secs: i64,
}

// Default value providers
fn default_max_concurrency() -> usize {
    4
}

fn default_load_threshold() -> f64 {
    8.0
}

fn default_wait_when_busy_secs() -> u64 {
    5
}

fn default_loop_interval_secs() -> u64 {
    30
}

fn default_restart_limit() -> u32 {
    5
}

fn default_restart_throttle_secs() -> i64 {
    60
}

fn default_restart_window_secs() -> i64 {
    600
}

fn default_completed_retention_hours() -> i64 {
    24
}

fn default_failed_retention_hours() -> i64 {
    72
}

fn default_agent_stale_hours() -> i64 {
    24
}

fn default_health_window_lines() -> usize {
    40
}

fn default_degraded_error_threshold() -> usize {
    5
}

fn default_unresponsive_after_secs() -> i64 {
    120
}

fn default_alert_window_minutes() -> i64 {
    60
}

fn default_in_progress_timeout_secs() -> i64 {
    900
}

fn default_status_report_every() -> u64 {
    10
}

fn default_escalation_mailbox() -> String {
    "operator".to_string()
}

impl ForemanConfig {
    /// Load configuration from `.foreman/config.toml` or use defaults,
    /// then apply environment overrides.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".foreman/config.toml");

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content).map_err(|e| {
                crate::ForemanError::Config(format!("Failed to parse config file: {}", e))
            })?
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Write default configuration to `.foreman/config.toml`
    pub fn write_default(root: &Path) -> Result<()> {
        let config_dir = root.join(".foreman");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let config = Self::default();
        let content = toml::to_string_pretty(&config).map_err(|e| {
            crate::ForemanError::Config(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Apply recognized environment-variable overrides.
    ///
    /// Recognized: `MAX_CONCURRENCY`, `LOAD_THRESHOLD`, `WAIT_WHEN_BUSY`,
    /// `LOOP_INTERVAL`, `RESTART_LIMIT`, `RESTART_THROTTLE`. Invalid values
    /// are ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<usize>("MAX_CONCURRENCY") {
            self.max_concurrency = v;
        }
        if let Some(v) = env_parse::<f64>("LOAD_THRESHOLD") {
            self.load_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("WAIT_WHEN_BUSY") {
            self.wait_when_busy_secs = v;
        }
        if let Some(v) = env_parse::<u64>("LOOP_INTERVAL") {
            self.loop_interval_secs = v;
        }
        if let Some(v) = env_parse::<u32>("RESTART_LIMIT") {
            self.restart.limit = v;
        }
        if let Some(v) = env_parse::<i64>("RESTART_THROTTLE") {
            self.restart.throttle_secs = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid {}={}", name, raw);
            None
        }
    }
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            load_threshold: default_load_threshold(),
            wait_when_busy_secs: default_wait_when_busy_secs(),
            loop_interval_secs: default_loop_interval_secs(),
            restart: RestartConfig::default(),
            retention: RetentionConfig::default(),
            health: HealthConfig::default(),
            alert_window_minutes: default_alert_window_minutes(),
            requeue_failed: false,
            in_progress_timeout_secs: default_in_progress_timeout_secs(),
            status_report_every: default_status_report_every(),
            escalation_mailbox: default_escalation_mailbox(),
            agents: Vec::new(),
            routes: BTreeMap::new(),
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            limit: default_restart_limit(),
            throttle_secs: default_restart_throttle_secs(),
            window_secs: default_restart_window_secs(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_hours: default_completed_retention_hours(),
            failed_hours: default_failed_retention_hours(),
            agent_stale_hours: default_agent_stale_hours(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_lines: default_health_window_lines(),
            degraded_error_threshold: default_degraded_error_threshold(),
            unresponsive_after_secs: default_unresponsive_after_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ForemanConfig::default();
        assert_eq!(config.loop_interval_secs, 30);
        assert_eq!(config.restart.limit, 5);
        assert_eq!(config.restart.throttle_secs, 60);
        assert_eq!(config.restart.window_secs, 600);
        assert_eq!(config.alert_window_minutes, 60);
        assert!(!config.requeue_failed);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ForemanConfig::load_or_default(temp_dir.path()).unwrap();
        assert_eq!(config.restart.limit, 5);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_write_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        ForemanConfig::write_default(temp_dir.path()).unwrap();
        let config = ForemanConfig::load_or_default(temp_dir.path()).unwrap();
        assert_eq!(config.loop_interval_secs, 30);
    }

    #[test]
    fn test_parse_agents_section() {
        let toml_src = r#"
            loop_interval_secs = 10
            requeue_failed = true

            [routes]
            build = "builder"

            [[agents]]
            name = "builder"
            capabilities = ["build", "test"]
            static_priority = 3
            command = ["./agents/builder"]

            [[agents]]
            name = "docgen"
            aliases = ["doc-writer"]
            capabilities = ["docs"]
        "#;

        let config: ForemanConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.loop_interval_secs, 10);
        assert!(config.requeue_failed);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].name, "builder");
        assert_eq!(config.agents[1].aliases, vec!["doc-writer"]);
        assert_eq!(config.routes.get("build").unwrap(), "builder");
        // Unset fields fall back to defaults
        assert_eq!(config.restart.limit, 5);
    }
}
