//! Health classification from liveness and recent log output.

use regex::Regex;
use std::path::Path;
use tokio::fs;

use foreman_core::{AgentRecord, HealthConfig, Result};

use crate::probe::ProcessProbe;

/// Health classification for one agent, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// No findings
    Healthy,
    /// Error rate in the recent log window exceeds the threshold
    Degraded,
    /// A fatal/panic pattern appeared in the recent log window
    Critical,
    /// The expected pid is not a live process
    Crashed,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// Classifies agent health each supervision cycle.
pub struct HealthMonitor {
    fatal_patterns: Vec<Regex>,
    error_pattern: Regex,
    window_lines: usize,
    degraded_threshold: usize,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> Self {
        let fatal_patterns = vec![
            Regex::new(r"(?i)thread '.*' panicked").unwrap(),
            Regex::new(r"(?i)\bpanic\b").unwrap(),
            Regex::new(r"(?i)\bfatal\b").unwrap(),
            Regex::new(r"(?i)segmentation fault").unwrap(),
            Regex::new(r"(?i)out of memory").unwrap(),
        ];
        let error_pattern = Regex::new(r"(?i)\berror\b").unwrap();

        Self {
            fatal_patterns,
            error_pattern,
            window_lines: config.window_lines,
            degraded_threshold: config.degraded_error_threshold,
        }
    }

    /// Add a custom fatal pattern (e.g. an agent-specific crash marker).
    pub fn with_fatal_pattern(mut self, pattern: Regex) -> Self {
        self.fatal_patterns.push(pattern);
        self
    }

    /// Classify one agent from its record and recent log lines.
    ///
    /// Severity wins: a dead pid is Crashed regardless of what the log says.
    pub fn classify(
        &self,
        probe: &dyn ProcessProbe,
        agent: &AgentRecord,
        recent_lines: &[String],
    ) -> HealthStatus {
        if let Some(pid) = agent.pid {
            if !probe.is_alive(pid) {
                return HealthStatus::Crashed;
            }
        }

        let window: Vec<&String> = recent_lines
            .iter()
            .rev()
            .take(self.window_lines)
            .collect();

        if window
            .iter()
            .any(|line| self.fatal_patterns.iter().any(|p| p.is_match(line)))
        {
            return HealthStatus::Critical;
        }

        let error_count = window
            .iter()
            .filter(|line| self.error_pattern.is_match(line))
            .count();
        if error_count > self.degraded_threshold {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }
}

/// Read up to the last `n` lines of a log file.
///
/// A missing file reads as empty: an agent that has not written a log yet is
/// not thereby unhealthy.
pub async fn read_recent_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let lines: Vec<String> = content.lines().map(str::to_string).collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].to_vec())
}
