//! Bounded processed-id set for consumer-side deduplication.
//!
//! Replaces an ever-growing append-only dedup file with an LRU of the most
//! recently processed notification ids, persisted as a small JSON array.
//! Bounded memory means a sufficiently old duplicate can slip through; that
//! is acceptable under the at-least-once contract, which already requires
//! idempotent processing.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use foreman_core::Result;

const DEFAULT_CAPACITY: usize = 1024;

/// LRU set of recently processed notification ids.
#[derive(Debug)]
pub struct ProcessedIds {
    path: PathBuf,
    capacity: usize,
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl ProcessedIds {
    /// Load the persisted set from `path`, or start empty.
    ///
    /// An unreadable or unparsable file starts the set empty with a warning;
    /// the worst outcome is reprocessing, which consumers must tolerate.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        Self::load_with_capacity(path, DEFAULT_CAPACITY).await
    }

    pub async fn load_with_capacity(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let ids: Vec<Uuid> = match fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(
                    "Processed-id set {} unparsable ({}); starting empty",
                    path.display(),
                    e
                );
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };

        let mut set = Self {
            path,
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        };
        for id in ids {
            set.insert(id);
        }
        set
    }

    /// Record an id as processed. Returns `false` if it was already present.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Persist the set (temp file + rename, like every other snapshot).
    pub async fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let ids: Vec<&Uuid> = self.order.iter().collect();
        let data = serde_json::to_vec(&ids)?;

        let tmp = tmp_path(&self.path);
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tmp", path.display()))
}
