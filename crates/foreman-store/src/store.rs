//! Domain facade over the task and agent tables.

use chrono::{Duration, Utc};
use std::path::Path;
use tracing::{info, warn};

use foreman_core::{AgentRecord, AgentStatus, Result, TaskRecord, TaskStatus};

use crate::actor::{spawn_table, TableHandle};
use crate::table::Table;

/// The two logical tables every other component works against.
#[derive(Clone)]
pub struct StateStore {
    tasks: TableHandle<TaskRecord>,
    agents: TableHandle<AgentRecord>,
}

impl StateStore {
    /// Open the store under `dir`, spawning one owner task per table.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let tasks = spawn_table(Table::load(dir, "tasks").await?);
        let agents = spawn_table(Table::load(dir, "agents").await?);
        Ok(Self { tasks, agents })
    }

    pub fn tasks(&self) -> &TableHandle<TaskRecord> {
        &self.tasks
    }

    pub fn agents(&self) -> &TableHandle<AgentRecord> {
        &self.agents
    }

    /// Accept a new task into the queue. Task ids are immutable and globally
    /// unique, so resubmitting an existing id is an error.
    pub async fn submit_task(&self, task: TaskRecord) -> Result<()> {
        info!("Submitting task {} ({})", task.id, task.task_type);
        self.tasks.create(task).await
    }

    /// Record an agent status write, creating the record on first contact
    /// (implicit registration).
    pub async fn record_agent_status(
        &self,
        name: &str,
        status: AgentStatus,
        pid: Option<u32>,
    ) -> Result<AgentRecord> {
        self.agents
            .upsert(AgentRecord::new(name), move |agent| {
                agent.status = status;
                if pid.is_some() {
                    agent.pid = pid;
                }
                agent.touch();
                Ok(())
            })
            .await
    }

    /// Release agents stuck Busy with no current task back to Available.
    ///
    /// Returns the names of the healed agents.
    pub async fn release_stale_busy(&self) -> Result<Vec<String>> {
        let stale: Vec<String> = self
            .agents
            .scan(|agent| agent.is_stale_busy())
            .await?
            .into_iter()
            .map(|agent| agent.name)
            .collect();

        for name in &stale {
            warn!("Agent {} was busy with no current task; releasing", name);
            self.agents
                .update(name, |agent| {
                    agent.status = AgentStatus::Available;
                    Ok(())
                })
                .await?;
        }

        Ok(stale)
    }

    /// Prune agents whose last heartbeat is older than the staleness window.
    pub async fn prune_stale_agents(&self, stale_after: Duration) -> Result<usize> {
        let cutoff = Utc::now() - stale_after;
        let pruned = self
            .agents
            .retain(move |agent| agent.last_seen >= cutoff)
            .await?;
        if pruned > 0 {
            info!("Pruned {} stale agent records", pruned);
        }
        Ok(pruned)
    }

    /// Prune terminal tasks past their retention window.
    pub async fn prune_terminal_tasks(
        &self,
        completed_after: Duration,
        failed_after: Duration,
    ) -> Result<usize> {
        let now = Utc::now();
        let pruned = self
            .tasks
            .retain(move |task| {
                let Some(completed_at) = task.completed_at else {
                    return true;
                };
                match task.status {
                    TaskStatus::Completed => now - completed_at < completed_after,
                    TaskStatus::Failed => now - completed_at < failed_after,
                    _ => true,
                }
            })
            .await?;
        if pruned > 0 {
            info!("Pruned {} terminal task records", pruned);
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_submit_rejects_duplicate_id() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::open(temp_dir.path()).await.unwrap();

        store
            .submit_task(TaskRecord::with_id("t-1", "build", "compile"))
            .await
            .unwrap();
        assert!(store
            .submit_task(TaskRecord::with_id("t-1", "build", "again"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_implicit_agent_registration() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::open(temp_dir.path()).await.unwrap();

        // First status write creates the record
        let agent = store
            .record_agent_status("builder", AgentStatus::Available, Some(1234))
            .await
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        assert_eq!(agent.pid, Some(1234));

        // Second write updates in place, keeping the pid
        let agent = store
            .record_agent_status("builder", AgentStatus::Busy, None)
            .await
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(agent.pid, Some(1234));
        assert_eq!(store.agents().all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_stale_busy() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::open(temp_dir.path()).await.unwrap();

        store
            .record_agent_status("builder", AgentStatus::Busy, None)
            .await
            .unwrap();

        let healed = store.release_stale_busy().await.unwrap();
        assert_eq!(healed, vec!["builder".to_string()]);

        let agent = store.agents().get("builder").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
    }

    #[tokio::test]
    async fn test_release_skips_genuinely_busy() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::open(temp_dir.path()).await.unwrap();

        store
            .record_agent_status("builder", AgentStatus::Busy, None)
            .await
            .unwrap();
        store
            .agents()
            .update("builder", |agent| {
                agent.current_task_id = Some("t-1".to_string());
                Ok(())
            })
            .await
            .unwrap();

        let healed = store.release_stale_busy().await.unwrap();
        assert!(healed.is_empty());
    }

    #[tokio::test]
    async fn test_prune_stale_agents() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::open(temp_dir.path()).await.unwrap();

        let mut ancient = AgentRecord::new("ghost");
        ancient.last_seen = Utc::now() - Duration::hours(48);
        store.agents().put(ancient).await.unwrap();
        store
            .record_agent_status("builder", AgentStatus::Available, None)
            .await
            .unwrap();

        let pruned = store.prune_stale_agents(Duration::hours(24)).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(store.agents().get("ghost").await.unwrap().is_none());
        assert!(store.agents().get("builder").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_prune_terminal_tasks_respects_windows() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::open(temp_dir.path()).await.unwrap();

        let mut old_done = TaskRecord::with_id("t-done", "build", "compile");
        old_done.status = TaskStatus::Completed;
        old_done.assigned_agent = Some("builder".to_string());
        old_done.completed_at = Some(Utc::now() - Duration::hours(30));
        store.tasks().put(old_done).await.unwrap();

        let mut recent_fail = TaskRecord::with_id("t-fail", "build", "compile");
        recent_fail.status = TaskStatus::Failed;
        recent_fail.assigned_agent = Some("builder".to_string());
        recent_fail.completed_at = Some(Utc::now() - Duration::hours(1));
        store.tasks().put(recent_fail).await.unwrap();

        store
            .submit_task(TaskRecord::with_id("t-live", "build", "compile"))
            .await
            .unwrap();

        let pruned = store
            .prune_terminal_tasks(Duration::hours(24), Duration::hours(72))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.tasks().get("t-done").await.unwrap().is_none());
        assert!(store.tasks().get("t-fail").await.unwrap().is_some());
        assert!(store.tasks().get("t-live").await.unwrap().is_some());
    }
}
