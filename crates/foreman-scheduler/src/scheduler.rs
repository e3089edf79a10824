//! Task distribution and lifecycle bookkeeping.

use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use foreman_bus::NotificationBus;
use foreman_core::{
    AgentRecord, AgentRegistry, AgentStatus, ForemanConfig, ForemanError, Notification, Result,
    TaskRecord, TaskStatus,
};
use foreman_store::StateStore;

use crate::score::select_best_agent;

/// Matches queued tasks to available agents and advances task lifecycle
/// bookkeeping the workers cannot do themselves.
pub struct Scheduler {
    store: StateStore,
    bus: NotificationBus,
    registry: AgentRegistry,
    routes: BTreeMap<String, String>,
    requeue_failed: bool,
    stuck_timeout: Duration,
}

impl Scheduler {
    pub fn new(
        store: StateStore,
        bus: NotificationBus,
        registry: AgentRegistry,
        config: &ForemanConfig,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            routes: config.routes.clone(),
            requeue_failed: config.requeue_failed,
            stuck_timeout: Duration::seconds(config.in_progress_timeout_secs),
        }
    }

    /// Assign every assignable queued task to the best available agent.
    ///
    /// Tasks are visited in (priority, created_at, id) order. An agent gets
    /// at most one new task per cycle: the local view is marked Busy as soon
    /// as an assignment is written.
    pub async fn distribute_tasks(&self) -> Result<usize> {
        let tasks = self.store.tasks().all().await?;
        let mut agents: BTreeMap<String, AgentRecord> = self
            .store
            .agents()
            .all()
            .await?
            .into_iter()
            .map(|agent| (agent.name.clone(), agent))
            .collect();

        let by_id: BTreeMap<&str, &TaskRecord> =
            tasks.iter().map(|task| (task.id.as_str(), task)).collect();

        let mut queued: Vec<&TaskRecord> = tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Queued)
            .collect();
        queued.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        let mut assigned = 0;
        for task in queued {
            if !dependencies_satisfied(task, &by_id) {
                debug!("Task {} has unfinished dependencies; skipping", task.id);
                continue;
            }

            let Some(agent_name) =
                select_best_agent(&self.registry, &agents, &self.routes, &task.task_type)
            else {
                debug!("No agent registered for task type {}", task.task_type);
                continue;
            };

            let accepts = agents
                .get(&agent_name)
                .map(|agent| agent.status.accepts_work())
                .unwrap_or(false);
            if !accepts {
                debug!(
                    "Best agent {} for task {} is not accepting work",
                    agent_name, task.id
                );
                continue;
            }

            match self.assign(task, &agent_name).await {
                Ok(()) => {
                    if let Some(agent) = agents.get_mut(&agent_name) {
                        agent.status = AgentStatus::Busy;
                        agent.current_task_id = Some(task.id.clone());
                    }
                    assigned += 1;
                }
                Err(e) => warn!("Failed to assign task {}: {}", task.id, e),
            }
        }

        Ok(assigned)
    }

    /// Write one assignment: task first, then agent, then the wake-up.
    async fn assign(&self, task: &TaskRecord, agent_name: &str) -> Result<()> {
        let now = Utc::now();
        let task_id = task.id.clone();

        let agent_for_task = agent_name.to_string();
        self.store
            .tasks()
            .update(&task.id, move |t| {
                if t.status != TaskStatus::Queued {
                    return Err(ForemanError::Scheduler(format!(
                        "task {} is no longer queued",
                        t.id
                    )));
                }
                t.status = TaskStatus::Assigned;
                t.assigned_agent = Some(agent_for_task);
                t.assigned_at = Some(now);
                Ok(())
            })
            .await?;

        let task_for_agent = task_id.clone();
        self.store
            .agents()
            .update(agent_name, move |agent| {
                agent.status = AgentStatus::Busy;
                agent.current_task_id = Some(task_for_agent);
                Ok(())
            })
            .await?;

        self.bus
            .notify(agent_name, &Notification::execute_task(&task_id))
            .await?;

        info!("Assigned task {} to agent {}", task_id, agent_name);
        Ok(())
    }

    /// Reconcile terminal task signals written by workers: release the agent
    /// and count the completion.
    pub async fn reconcile_completions(&self) -> Result<usize> {
        let tasks = self.store.tasks().all().await?;
        let mut reconciled = 0;

        for task in tasks.iter().filter(|task| task.status.is_terminal()) {
            let Some(agent_name) = &task.assigned_agent else {
                continue;
            };
            let Some(agent) = self.store.agents().get(agent_name).await? else {
                continue;
            };
            if agent.current_task_id.as_deref() != Some(task.id.as_str()) {
                continue;
            }

            let completed = task.status == TaskStatus::Completed;
            self.store
                .agents()
                .update(agent_name, move |agent| {
                    agent.current_task_id = None;
                    if agent.status == AgentStatus::Busy {
                        agent.status = AgentStatus::Available;
                    }
                    if completed {
                        agent.tasks_completed += 1;
                    }
                    Ok(())
                })
                .await?;

            info!(
                "Reconciled {} task {} from agent {}",
                task.status, task.id, agent_name
            );
            reconciled += 1;
        }

        Ok(reconciled)
    }

    /// Requeue tasks stuck past the configured timeout.
    ///
    /// Covers both tasks an agent never acknowledged (stuck Assigned) and
    /// tasks whose agent went silent mid-flight (stuck InProgress). Requeue
    /// always routes back through Queued, never directly to another agent.
    pub async fn requeue_stuck(&self) -> Result<usize> {
        let now = Utc::now();
        let timeout = self.stuck_timeout;

        let stuck = self
            .store
            .tasks()
            .scan(|task| {
                let since = match task.status {
                    TaskStatus::InProgress => task.started_at.or(task.assigned_at),
                    TaskStatus::Assigned => task.assigned_at,
                    _ => return false,
                };
                since.map(|s| now - s > timeout).unwrap_or(true)
            })
            .await?;

        for task in &stuck {
            warn!(
                "Task {} stuck in {} past {}s; requeueing",
                task.id,
                task.status,
                timeout.num_seconds()
            );
            self.requeue_and_release(task).await?;
        }

        Ok(stuck.len())
    }

    /// Route failed tasks back through the queue, when enabled.
    pub async fn requeue_failed_tasks(&self) -> Result<usize> {
        if !self.requeue_failed {
            return Ok(0);
        }

        let failed = self
            .store
            .tasks()
            .scan(|task| task.status == TaskStatus::Failed)
            .await?;

        for task in &failed {
            info!("Requeueing failed task {}", task.id);
            self.requeue_and_release(task).await?;
        }

        Ok(failed.len())
    }

    async fn requeue_and_release(&self, task: &TaskRecord) -> Result<()> {
        let agent_name = task.assigned_agent.clone();

        self.store
            .tasks()
            .update(&task.id, |t| {
                t.requeue();
                Ok(())
            })
            .await?;

        if let Some(agent_name) = agent_name {
            let task_id = task.id.clone();
            // Release only if the agent still points at this task
            let released = self
                .store
                .agents()
                .update(&agent_name, move |agent| {
                    if agent.current_task_id.as_deref() == Some(task_id.as_str()) {
                        agent.current_task_id = None;
                        if agent.status == AgentStatus::Busy {
                            agent.status = AgentStatus::Available;
                        }
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = released {
                debug!("Agent {} not released with task {}: {}", agent_name, task.id, e);
            }
        }

        Ok(())
    }
}

/// A task is assignable when every dependency is complete. Terminal tasks
/// are pruned after their retention window, so a missing dependency record
/// counts as completed.
fn dependencies_satisfied(task: &TaskRecord, by_id: &BTreeMap<&str, &TaskRecord>) -> bool {
    task.dependencies.iter().all(|dep| match by_id.get(dep.as_str()) {
        Some(dep_task) => dep_task.status == TaskStatus::Completed,
        None => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::{AgentDefinition, NotificationKind};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        store: StateStore,
        bus: NotificationBus,
        scheduler: Scheduler,
    }

    async fn fixture_with(config: ForemanConfig, definitions: Vec<AgentDefinition>) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::open(temp_dir.path().join("state")).await.unwrap();
        let bus = NotificationBus::new(temp_dir.path().join("mailboxes"));
        let scheduler = Scheduler::new(
            store.clone(),
            bus.clone(),
            AgentRegistry::new(definitions),
            &config,
        );
        Fixture {
            _temp_dir: temp_dir,
            store,
            bus,
            scheduler,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(
            ForemanConfig::default(),
            vec![AgentDefinition::new("a1").with_capabilities(vec!["build".to_string()])],
        )
        .await
    }

    async fn seed_agent(store: &StateStore, name: &str, status: AgentStatus) {
        store.record_agent_status(name, status, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_assigns_queued_task_to_available_agent() {
        let f = fixture().await;
        seed_agent(&f.store, "a1", AgentStatus::Available).await;
        f.store
            .submit_task(TaskRecord::with_id("t1", "build", "compile").with_priority(1))
            .await
            .unwrap();

        let assigned = f.scheduler.distribute_tasks().await.unwrap();
        assert_eq!(assigned, 1);

        let task = f.store.tasks().get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_agent.as_deref(), Some("a1"));
        assert!(task.assigned_at.is_some());

        let agent = f.store.agents().get("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(agent.current_task_id.as_deref(), Some("t1"));

        let mail = f.bus.mailbox("a1").drain().await.unwrap();
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].kind, NotificationKind::ExecuteTask);
        assert_eq!(mail[0].payload, "t1");
    }

    #[tokio::test]
    async fn test_one_agent_gets_one_task_per_cycle() {
        let f = fixture().await;
        seed_agent(&f.store, "a1", AgentStatus::Available).await;
        f.store
            .submit_task(TaskRecord::with_id("t1", "build", "first"))
            .await
            .unwrap();
        f.store
            .submit_task(TaskRecord::with_id("t2", "build", "second"))
            .await
            .unwrap();

        let assigned = f.scheduler.distribute_tasks().await.unwrap();
        assert_eq!(assigned, 1);

        let t2 = f.store.tasks().get("t2").await.unwrap().unwrap();
        assert_eq!(t2.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_priority_order_lower_value_first() {
        let f = fixture().await;
        seed_agent(&f.store, "a1", AgentStatus::Available).await;
        f.store
            .submit_task(TaskRecord::with_id("t-low", "build", "later").with_priority(3))
            .await
            .unwrap();
        f.store
            .submit_task(TaskRecord::with_id("t-urgent", "build", "now").with_priority(0))
            .await
            .unwrap();

        f.scheduler.distribute_tasks().await.unwrap();

        let urgent = f.store.tasks().get("t-urgent").await.unwrap().unwrap();
        assert_eq!(urgent.status, TaskStatus::Assigned);
        let low = f.store.tasks().get("t-low").await.unwrap().unwrap();
        assert_eq!(low.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_busy_agent_not_assigned() {
        let f = fixture().await;
        seed_agent(&f.store, "a1", AgentStatus::Busy).await;
        f.store
            .submit_task(TaskRecord::with_id("t1", "build", "compile"))
            .await
            .unwrap();

        assert_eq!(f.scheduler.distribute_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dependency_gating() {
        let f = fixture().await;
        seed_agent(&f.store, "a1", AgentStatus::Available).await;

        f.store
            .submit_task(TaskRecord::with_id("t-dep", "build", "prerequisite"))
            .await
            .unwrap();
        f.store
            .submit_task(
                TaskRecord::with_id("t-main", "build", "dependent")
                    .with_priority(0)
                    .with_dependencies(vec!["t-dep".to_string()]),
            )
            .await
            .unwrap();

        // t-main is more urgent but blocked; t-dep gets the agent
        f.scheduler.distribute_tasks().await.unwrap();
        let main = f.store.tasks().get("t-main").await.unwrap().unwrap();
        assert_eq!(main.status, TaskStatus::Queued);
        let dep = f.store.tasks().get("t-dep").await.unwrap().unwrap();
        assert_eq!(dep.status, TaskStatus::Assigned);

        // Complete the dependency; the dependent becomes assignable
        f.store
            .tasks()
            .update("t-dep", |t| {
                t.status = TaskStatus::InProgress;
                t.started_at = Some(Utc::now());
                Ok(())
            })
            .await
            .unwrap();
        f.store
            .tasks()
            .update("t-dep", |t| {
                t.status = TaskStatus::Completed;
                t.completed_at = Some(Utc::now());
                Ok(())
            })
            .await
            .unwrap();
        f.scheduler.reconcile_completions().await.unwrap();

        f.scheduler.distribute_tasks().await.unwrap();
        let main = f.store.tasks().get("t-main").await.unwrap().unwrap();
        assert_eq!(main.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_missing_dependency_counts_as_completed() {
        let f = fixture().await;
        seed_agent(&f.store, "a1", AgentStatus::Available).await;
        f.store
            .submit_task(
                TaskRecord::with_id("t1", "build", "depends on pruned task")
                    .with_dependencies(vec!["t-long-gone".to_string()]),
            )
            .await
            .unwrap();

        assert_eq!(f.scheduler.distribute_tasks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_completion_releases_agent_and_counts() {
        let f = fixture().await;
        seed_agent(&f.store, "a1", AgentStatus::Available).await;
        f.store
            .submit_task(TaskRecord::with_id("t1", "build", "compile"))
            .await
            .unwrap();
        f.scheduler.distribute_tasks().await.unwrap();

        // Worker reports progress then completion
        f.store
            .tasks()
            .update("t1", |t| {
                t.status = TaskStatus::InProgress;
                t.started_at = Some(Utc::now());
                Ok(())
            })
            .await
            .unwrap();
        f.store
            .tasks()
            .update("t1", |t| {
                t.status = TaskStatus::Completed;
                t.completed_at = Some(Utc::now());
                Ok(())
            })
            .await
            .unwrap();

        let reconciled = f.scheduler.reconcile_completions().await.unwrap();
        assert_eq!(reconciled, 1);

        let agent = f.store.agents().get("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        assert!(agent.current_task_id.is_none());
        assert_eq!(agent.tasks_completed, 1);

        // Reconciling again is a no-op
        assert_eq!(f.scheduler.reconcile_completions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_task_does_not_increment_counter() {
        let f = fixture().await;
        seed_agent(&f.store, "a1", AgentStatus::Available).await;
        f.store
            .submit_task(TaskRecord::with_id("t1", "build", "compile"))
            .await
            .unwrap();
        f.scheduler.distribute_tasks().await.unwrap();

        f.store
            .tasks()
            .update("t1", |t| {
                t.status = TaskStatus::InProgress;
                t.started_at = Some(Utc::now());
                Ok(())
            })
            .await
            .unwrap();
        f.store
            .tasks()
            .update("t1", |t| {
                t.status = TaskStatus::Failed;
                t.completed_at = Some(Utc::now());
                Ok(())
            })
            .await
            .unwrap();

        f.scheduler.reconcile_completions().await.unwrap();
        let agent = f.store.agents().get("a1").await.unwrap().unwrap();
        assert_eq!(agent.tasks_completed, 0);
        assert_eq!(agent.status, AgentStatus::Available);
    }

    #[tokio::test]
    async fn test_requeue_stuck_in_progress_task() {
        let mut config = ForemanConfig::default();
        config.in_progress_timeout_secs = 60;
        let f = fixture_with(
            config,
            vec![AgentDefinition::new("a1").with_capabilities(vec!["build".to_string()])],
        )
        .await;
        seed_agent(&f.store, "a1", AgentStatus::Available).await;
        f.store
            .submit_task(TaskRecord::with_id("t1", "build", "compile"))
            .await
            .unwrap();
        f.scheduler.distribute_tasks().await.unwrap();

        // Worker started long ago and went silent
        f.store
            .tasks()
            .update("t1", |t| {
                t.status = TaskStatus::InProgress;
                t.started_at = Some(Utc::now() - Duration::seconds(300));
                Ok(())
            })
            .await
            .unwrap();

        let requeued = f.scheduler.requeue_stuck().await.unwrap();
        assert_eq!(requeued, 1);

        let task = f.store.tasks().get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.assigned_agent.is_none());

        let agent = f.store.agents().get("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        assert!(agent.current_task_id.is_none());
    }

    #[tokio::test]
    async fn test_fresh_in_progress_not_requeued() {
        let f = fixture().await;
        seed_agent(&f.store, "a1", AgentStatus::Available).await;
        f.store
            .submit_task(TaskRecord::with_id("t1", "build", "compile"))
            .await
            .unwrap();
        f.scheduler.distribute_tasks().await.unwrap();
        f.store
            .tasks()
            .update("t1", |t| {
                t.status = TaskStatus::InProgress;
                t.started_at = Some(Utc::now());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(f.scheduler.requeue_stuck().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_requeue_failed_respects_flag() {
        let mut config = ForemanConfig::default();
        config.requeue_failed = true;
        let f = fixture_with(
            config,
            vec![AgentDefinition::new("a1").with_capabilities(vec!["build".to_string()])],
        )
        .await;

        let mut failed = TaskRecord::with_id("t1", "build", "compile");
        failed.status = TaskStatus::Failed;
        failed.assigned_agent = Some("a1".to_string());
        failed.completed_at = Some(Utc::now());
        f.store.tasks().put(failed).await.unwrap();

        assert_eq!(f.scheduler.requeue_failed_tasks().await.unwrap(), 1);
        let task = f.store.tasks().get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);

        // Disabled by default
        let f2 = fixture().await;
        let mut failed = TaskRecord::with_id("t1", "build", "compile");
        failed.status = TaskStatus::Failed;
        failed.assigned_agent = Some("a1".to_string());
        failed.completed_at = Some(Utc::now());
        f2.store.tasks().put(failed).await.unwrap();
        assert_eq!(f2.scheduler.requeue_failed_tasks().await.unwrap(), 0);
        assert_eq!(
            f2.store.tasks().get("t1").await.unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }
}
