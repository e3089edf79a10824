//! Producer and consumer facades over per-agent mailboxes.

use std::path::{Path, PathBuf};
use tracing::debug;

use foreman_core::{Notification, Result};

use crate::dedup::ProcessedIds;
use crate::mailbox::Mailbox;

/// Producer side of the notification bus.
///
/// Each agent owns exactly one mailbox under the bus directory; producers
/// address agents by name.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    dir: PathBuf,
}

impl NotificationBus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn mailbox(&self, agent: &str) -> Mailbox {
        Mailbox::new(&self.dir, agent)
    }

    /// Push one notification to one agent's mailbox.
    pub async fn notify(&self, agent: &str, notification: &Notification) -> Result<()> {
        self.mailbox(agent).push(notification).await
    }

    /// Push a copy of the notification to every listed agent.
    ///
    /// All copies share the notification id, so a consumer observing the
    /// broadcast through more than one path still processes it once.
    pub async fn broadcast(&self, agents: &[String], notification: &Notification) -> Result<()> {
        for agent in agents {
            self.notify(agent, notification).await?;
        }
        debug!(
            "Broadcast {} notification to {} agents",
            notification.kind,
            agents.len()
        );
        Ok(())
    }
}

/// Consumer side: drain + deduplicate + persist the processed-id set.
pub struct MailboxConsumer {
    mailbox: Mailbox,
    processed: ProcessedIds,
}

impl MailboxConsumer {
    /// Open the consumer for `agent`, loading its persisted processed-id set.
    pub async fn open(dir: &Path, agent: &str) -> Self {
        let mailbox = Mailbox::new(dir, agent);
        let processed = ProcessedIds::load(dir.join(format!("{}.processed.json", agent))).await;
        Self { mailbox, processed }
    }

    /// Drain the mailbox and return only not-yet-processed notifications.
    ///
    /// The processed-id set is persisted after the batch; a crash between
    /// handing out notifications and the persist re-delivers the batch on the
    /// next poll, which is exactly the at-least-once contract.
    pub async fn poll(&mut self) -> Result<Vec<Notification>> {
        let drained = self.mailbox.drain().await?;
        if drained.is_empty() {
            return Ok(Vec::new());
        }

        let fresh: Vec<Notification> = drained
            .into_iter()
            .filter(|n| self.processed.insert(n.id))
            .collect();

        self.processed.persist().await?;
        Ok(fresh)
    }
}
