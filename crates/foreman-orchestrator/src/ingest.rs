//! Task submission intake.
//!
//! External submitters drop JSON files into `<dir>/inbox`; the orchestrator
//! ingests them each cycle. Accepted submissions are archived; malformed or
//! duplicate ones are moved aside with a warning. Ingest never deletes a
//! submitter's file outright.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use foreman_core::{Result, TaskRecord};
use foreman_store::StateStore;

/// One submitted task, as written by an external submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Explicit task id; generated when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub task_type: String,

    pub description: String,

    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

fn default_priority() -> i32 {
    2
}

impl TaskSubmission {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            description: description.into(),
            priority: default_priority(),
            dependencies: Vec::new(),
        }
    }

    /// Convert into a queued task record.
    pub fn into_task(self) -> TaskRecord {
        let task = match self.id {
            Some(id) => TaskRecord::with_id(id, self.task_type, self.description),
            None => TaskRecord::new(self.task_type, self.description),
        };
        task.with_priority(self.priority)
            .with_dependencies(self.dependencies)
    }
}

/// Inbox-directory intake for task submissions.
pub struct SubmissionIntake {
    inbox: PathBuf,
    accepted: PathBuf,
    rejected: PathBuf,
}

impl SubmissionIntake {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            inbox: dir.join("inbox"),
            accepted: dir.join("inbox-accepted"),
            rejected: dir.join("inbox-rejected"),
        }
    }

    /// Write a submission file into the inbox (the submitter side).
    pub async fn submit(&self, submission: &TaskSubmission) -> Result<PathBuf> {
        fs::create_dir_all(&self.inbox).await?;
        let path = self
            .inbox
            .join(format!("sub-{}.json", &Uuid::new_v4().to_string()[..8]));
        let data = serde_json::to_vec_pretty(submission)?;
        fs::write(&path, data).await?;
        Ok(path)
    }

    /// Ingest every pending submission into the store.
    ///
    /// Returns how many tasks were accepted. Files that fail to parse or
    /// validate are moved to the rejected directory; this is a schema
    /// mismatch a submitter must fix, so it is logged loudly rather than
    /// silently dropped.
    pub async fn ingest(&self, store: &StateStore) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.inbox).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        fs::create_dir_all(&self.accepted).await?;
        fs::create_dir_all(&self.rejected).await?;

        let mut accepted = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            match self.ingest_file(store, &path).await {
                Ok(task_id) => {
                    info!("Accepted submission {} as task {}", path.display(), task_id);
                    self.archive(&path, &self.accepted).await;
                    accepted += 1;
                }
                Err(e) => {
                    warn!("Rejecting submission {}: {}", path.display(), e);
                    self.archive(&path, &self.rejected).await;
                }
            }
        }

        Ok(accepted)
    }

    async fn ingest_file(&self, store: &StateStore, path: &Path) -> Result<String> {
        let data = fs::read(path).await?;
        let submission: TaskSubmission = serde_json::from_slice(&data)?;
        let task = submission.into_task();
        let task_id = task.id.clone();
        store.submit_task(task).await?;
        Ok(task_id)
    }

    async fn archive(&self, path: &Path, dest_dir: &Path) {
        let Some(file_name) = path.file_name() else {
            return;
        };
        if let Err(e) = fs::rename(path, dest_dir.join(file_name)).await {
            warn!("Failed to archive {}: {}", path.display(), e);
        }
    }
}
