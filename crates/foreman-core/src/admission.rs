//! Admission control and graceful degradation
//!
//! Before an expensive operation starts, components check a resource budget
//! (system load, open file descriptors, concurrent-instance count) and back
//! off with capped exponential delay when the budget is exceeded. The same
//! module carries `best_effort`, used for infrastructure operations that must
//! never crash the control loop (reporting, alert persistence, log tails).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{ForemanError, Result};

/// Resource ceilings checked before admitting an expensive operation.
#[derive(Debug, Clone)]
pub struct ResourceBudget {
    /// 1-minute load average ceiling (0.0 disables the check)
    pub max_load: f64,
    /// Open file descriptor ceiling for this process (0 disables the check)
    pub max_open_files: usize,
    /// Maximum simultaneous admitted instances
    pub max_instances: usize,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            max_load: 8.0,
            max_open_files: 512,
            max_instances: 4,
        }
    }
}

/// Gate that admits expensive operations under a resource budget.
///
/// `admit` retries with exponential backoff (base `wait_when_busy`, capped)
/// and fails with [`ForemanError::ResourceExhausted`] once retries run out,
/// so the caller can log and retry on a later cycle instead of proceeding
/// into a saturated system.
pub struct AdmissionGate {
    budget: ResourceBudget,
    instances: Arc<Semaphore>,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: usize,
}

/// Permit held for the duration of an admitted operation.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(budget: ResourceBudget, wait_when_busy: Duration) -> Self {
        let instances = Arc::new(Semaphore::new(budget.max_instances.max(1)));
        Self {
            budget,
            instances,
            base_delay: wait_when_busy,
            max_delay: Duration::from_secs(60),
            max_attempts: 4,
        }
    }

    /// Admit an operation, backing off while the budget is exceeded.
    pub async fn admit(&self, operation: &str) -> Result<AdmissionPermit> {
        for attempt in 1..=self.max_attempts {
            match self.try_admit() {
                Ok(permit) => {
                    debug!("{} admitted (attempt {})", operation, attempt);
                    return Ok(permit);
                }
                Err(reason) if attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "{} deferred ({}), backing off {:?} (attempt {}/{})",
                        operation, reason, delay, attempt, self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(reason) => {
                    return Err(ForemanError::ResourceExhausted(format!(
                        "{}: {}",
                        operation, reason
                    )));
                }
            }
        }
        unreachable!("admission loop returns on the final attempt")
    }

    /// Single budget check without backoff.
    fn try_admit(&self) -> std::result::Result<AdmissionPermit, String> {
        if self.budget.max_load > 0.0 {
            if let Some(load) = load_average() {
                if load > self.budget.max_load {
                    return Err(format!(
                        "load {:.2} exceeds ceiling {:.2}",
                        load, self.budget.max_load
                    ));
                }
            }
        }

        if self.budget.max_open_files > 0 {
            if let Some(open) = open_file_count() {
                if open > self.budget.max_open_files {
                    return Err(format!(
                        "{} open files exceeds ceiling {}",
                        open, self.budget.max_open_files
                    ));
                }
            }
        }

        match self.instances.clone().try_acquire_owned() {
            Ok(permit) => Ok(AdmissionPermit { _permit: permit }),
            Err(_) => Err(format!(
                "{} concurrent instances already admitted",
                self.budget.max_instances
            )),
        }
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1).min(16) as u32);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// 1-minute load average from `/proc/loadavg`, if readable.
fn load_average() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/loadavg").ok()?;
    content.split_whitespace().next()?.parse().ok()
}

/// Open file descriptor count for this process from `/proc/self/fd`.
fn open_file_count() -> Option<usize> {
    let entries = std::fs::read_dir("/proc/self/fd").ok()?;
    Some(entries.count())
}

/// Execute an infrastructure operation that should fail open.
///
/// Logs the error via `tracing::warn!` on failure and returns `None`. Use for
/// status reporting, alert persistence, and similar concerns whose failure
/// must never stop orchestration; never use it for scheduling or store writes.
pub async fn best_effort<F, Fut, T>(operation: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation, e);
            None
        }
    }
}
