//! # foreman-bus
//!
//! Per-agent notification mailboxes.
//!
//! Producers append one encoded message per call; the owning agent drains its
//! mailbox once per poll cycle. The delivery contract is **at-least-once**:
//! a message appended between a consumer's read and clear can be lost, and a
//! consumer crash mid-batch can re-deliver already-processed messages.
//! Consumers therefore deduplicate against a bounded, persisted processed-id
//! set, and task processing must stay idempotent. Nothing in this crate
//! upgrades the contract to exactly-once.

#![allow(dead_code)]

mod bus;
mod dedup;
mod mailbox;

pub use bus::{MailboxConsumer, NotificationBus};
pub use dedup::ProcessedIds;
pub use mailbox::Mailbox;
