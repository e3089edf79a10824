//! Windowed deduplication of operator escalations.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::warn;

use foreman_core::{AlertRecord, Result};

/// Alert history keyed by alert key, persisted so dedup survives restarts.
///
/// `should_emit` answers "has this key fired inside the window?"; persistence
/// is best-effort because losing the history only risks one duplicate alert.
#[derive(Debug)]
pub struct AlertHistory {
    window: Duration,
    path: Option<PathBuf>,
    entries: BTreeMap<String, AlertRecord>,
}

impl AlertHistory {
    pub fn new(window_minutes: i64) -> Self {
        Self {
            window: Duration::minutes(window_minutes),
            path: None,
            entries: BTreeMap::new(),
        }
    }

    /// Load history from `path`, or start empty if missing/unparsable.
    pub async fn load(path: impl Into<PathBuf>, window_minutes: i64) -> Self {
        let path = path.into();
        let entries = match fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(
                    "Alert history {} unparsable ({}); starting empty",
                    path.display(),
                    e
                );
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };

        Self {
            window: Duration::minutes(window_minutes),
            path: Some(path),
            entries,
        }
    }

    /// Record the alert and report whether it should actually be emitted.
    ///
    /// Returns `false` when the same key already fired inside the window.
    pub fn should_emit(&mut self, key: &str, message: &str, now: DateTime<Utc>) -> bool {
        if let Some(existing) = self.entries.get(key) {
            if now - existing.timestamp < self.window {
                return false;
            }
        }

        self.entries.insert(
            key.to_string(),
            AlertRecord {
                key: key.to_string(),
                message: message.to_string(),
                timestamp: now,
            },
        );
        true
    }

    /// Drop entries older than the window.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.entries
            .retain(|_, record| now - record.timestamp < window);
    }

    /// Persist the history (best-effort; callers wrap in fail-open).
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(&self.entries)?;
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}
