//! # foreman-supervisor
//!
//! Process lifecycle management for the agent pool.
//!
//! This crate provides:
//! - A pure state machine for agent lifecycle transitions
//! - A windowed restart budget (circuit breaker) that stops restart storms
//! - Deduplicated operator escalation via the notification bus
//! - The per-cycle supervision pass that ties probe, budget, and store together

#![allow(dead_code)]

mod alerts;
mod budget;
mod state;
mod supervisor;

pub use alerts::AlertHistory;
pub use budget::{RestartBudget, RestartDecision};
pub use state::{transition, SupervisionEvent, SupervisorAction};
pub use supervisor::{AgentLauncher, MockLauncher, ProcessLauncher, Supervisor};
