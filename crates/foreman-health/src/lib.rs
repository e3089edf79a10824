//! # foreman-health
//!
//! Liveness and log-pattern health classification for managed agents.
//!
//! The monitor classifies, the supervisor decides: nothing here mutates
//! agent state beyond producing a [`HealthStatus`] per cycle.

#![allow(dead_code)]

mod monitor;
mod probe;

pub use monitor::{read_recent_lines, HealthMonitor, HealthStatus};
pub use probe::{MockProbe, ProcessProbe, SystemProbe};
