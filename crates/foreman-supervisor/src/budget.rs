//! Windowed restart budget (circuit breaker) for agent recovery.
//!
//! Restarts are throttled and counted inside a rolling window; once the
//! window's limit is hit the budget is exhausted and the agent must be
//! escalated instead of restarted. All methods take `now` explicitly so the
//! policy is deterministic under test.

use chrono::{DateTime, Duration, Utc};

use foreman_core::RestartConfig;

/// Outcome of asking the budget for a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart allowed; call [`RestartBudget::record`] when acting on it
    Allow,
    /// Too soon after the previous restart; retry later
    Throttled { retry_after: Duration },
    /// The rolling window's restart limit is spent
    Exhausted,
}

/// Per-agent restart budget.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    limit: u32,
    throttle: Duration,
    window: Duration,
    restarts: Vec<DateTime<Utc>>,
}

impl RestartBudget {
    pub fn new(config: &RestartConfig) -> Self {
        Self {
            limit: config.limit,
            throttle: Duration::seconds(config.throttle_secs),
            window: Duration::seconds(config.window_secs),
            restarts: Vec::new(),
        }
    }

    /// Decide whether a restart may happen at `now`.
    ///
    /// Exhaustion wins over throttling: an agent over its windowed limit is
    /// reported Exhausted even if the throttle interval has also not elapsed.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> RestartDecision {
        self.prune(now);

        if self.restarts.len() as u32 >= self.limit {
            return RestartDecision::Exhausted;
        }

        if let Some(last) = self.restarts.last() {
            let since = now - *last;
            if since < self.throttle {
                return RestartDecision::Throttled {
                    retry_after: self.throttle - since,
                };
            }
        }

        RestartDecision::Allow
    }

    /// Record a restart performed at `now`.
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.prune(now);
        self.restarts.push(now);
    }

    /// Restarts currently inside the rolling window.
    pub fn count(&mut self, now: DateTime<Utc>) -> u32 {
        self.prune(now);
        self.restarts.len() as u32
    }

    /// Manual clear: forget the restart history (operator reset).
    pub fn reset(&mut self) {
        self.restarts.clear();
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        self.restarts.retain(|t| *t >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(limit: u32, throttle_secs: i64, window_secs: i64) -> RestartConfig {
        RestartConfig {
            limit,
            throttle_secs,
            window_secs,
        }
    }

    #[test]
    fn test_allows_until_limit() {
        let mut budget = RestartBudget::new(&config(5, 0, 600));
        let t0 = Utc::now();

        for i in 0..5 {
            let now = t0 + Duration::seconds(i);
            assert_eq!(budget.evaluate(now), RestartDecision::Allow);
            budget.record(now);
        }

        // The 6th request inside the window is exhausted, not throttled
        assert_eq!(
            budget.evaluate(t0 + Duration::seconds(10)),
            RestartDecision::Exhausted
        );
    }

    #[test]
    fn test_throttle_between_restarts() {
        let mut budget = RestartBudget::new(&config(5, 60, 600));
        let t0 = Utc::now();

        assert_eq!(budget.evaluate(t0), RestartDecision::Allow);
        budget.record(t0);

        match budget.evaluate(t0 + Duration::seconds(10)) {
            RestartDecision::Throttled { retry_after } => {
                assert_eq!(retry_after, Duration::seconds(50));
            }
            other => panic!("expected throttle, got {:?}", other),
        }

        assert_eq!(
            budget.evaluate(t0 + Duration::seconds(61)),
            RestartDecision::Allow
        );
    }

    #[test]
    fn test_window_rolls_off_old_restarts() {
        let mut budget = RestartBudget::new(&config(2, 0, 600));
        let t0 = Utc::now();

        budget.record(t0);
        budget.record(t0 + Duration::seconds(1));
        assert_eq!(
            budget.evaluate(t0 + Duration::seconds(2)),
            RestartDecision::Exhausted
        );

        // Eleven minutes later the window is clear again
        let later = t0 + Duration::seconds(660);
        assert_eq!(budget.evaluate(later), RestartDecision::Allow);
        assert_eq!(budget.count(later), 0);
    }

    #[test]
    fn test_convergence_bound() {
        // An agent failing continuously restarts at most `limit` times in any
        // window, then gets zero further restarts.
        let mut budget = RestartBudget::new(&config(3, 0, 600));
        let t0 = Utc::now();
        let mut granted = 0;

        for i in 0..20 {
            let now = t0 + Duration::seconds(i);
            if budget.evaluate(now) == RestartDecision::Allow {
                budget.record(now);
                granted += 1;
            }
        }

        assert_eq!(granted, 3);
    }

    #[test]
    fn test_manual_reset_clears_history() {
        let mut budget = RestartBudget::new(&config(1, 0, 600));
        let t0 = Utc::now();

        budget.record(t0);
        assert_eq!(budget.evaluate(t0), RestartDecision::Exhausted);

        budget.reset();
        assert_eq!(budget.evaluate(t0), RestartDecision::Allow);
    }
}
