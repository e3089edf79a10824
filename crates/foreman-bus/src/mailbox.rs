//! Append-only mailbox files, one per agent.

use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use foreman_core::{Notification, Result};

/// One agent's mailbox: a JSON-Lines file appended by producers and drained
/// by the owning agent.
#[derive(Debug, Clone)]
pub struct Mailbox {
    path: PathBuf,
}

impl Mailbox {
    pub fn new(dir: &Path, agent: &str) -> Self {
        Self {
            path: dir.join(format!("{}.jsonl", agent)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one notification as a single write.
    ///
    /// The entire line (message + newline) goes out in one `write_all` on a
    /// file opened with append, so concurrent producers cannot interleave
    /// partial lines.
    pub async fn push(&self, notification: &Notification) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(notification)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(
            "Pushed {} notification to {}",
            notification.kind,
            self.path.display()
        );
        Ok(())
    }

    /// Read every entry and clear the mailbox.
    ///
    /// At-least-once: a message appended between the read and the clear is
    /// lost from this mailbox, and entries already handed out may reappear
    /// after a consumer crash. Invalid lines are skipped with a warning.
    pub async fn drain(&self) -> Result<Vec<Notification>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut notifications = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Notification>(line) {
                Ok(notification) => notifications.push(notification),
                Err(e) => warn!(
                    "Skipping invalid mailbox entry in {}: {}",
                    self.path.display(),
                    e
                ),
            }
        }

        fs::write(&self.path, b"").await?;
        Ok(notifications)
    }

    /// Number of entries currently waiting, without consuming them.
    pub async fn pending(&self) -> Result<usize> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.lines().filter(|l| !l.trim().is_empty()).count()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
