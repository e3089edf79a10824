//! # foreman-orchestrator
//!
//! The top-level control loop that ties the scheduler, health monitor, and
//! supervisor into one ticker-driven driver:
//!
//! - Reconciles worker-reported task outcomes into the state store
//! - Self-heals stale-busy agents
//! - Runs the supervision pass and the scheduler's task distribution
//! - Requeues stuck tasks and prunes expired records
//! - Ingests task submissions and emits periodic status reports
//!
//! Every step is fail-open: errors are logged and the loop continues.

#![allow(dead_code)]

mod ingest;
mod orchestrator;
mod report;

pub use ingest::{SubmissionIntake, TaskSubmission};
pub use orchestrator::{Orchestrator, OrchestratorConfig, CONTROL_MAILBOX};
pub use report::{ReportWriter, StatusReport};
