//! Periodic status reporting to `.foreman/status.md`
//!
//! Read-only consumers (dashboards, operators) watch this file; it is
//! rewritten wholesale each time so readers never see a partial report.

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use tokio::fs;

use foreman_core::{AgentRecord, Result, TaskRecord, TaskStatus};

/// Snapshot of task and agent state at one point in time.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub queued: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub agents: Vec<AgentRecord>,
}

impl StatusReport {
    pub fn collect(tasks: &[TaskRecord], mut agents: Vec<AgentRecord>) -> Self {
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        agents.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            generated_at: Utc::now(),
            queued: count(TaskStatus::Queued),
            assigned: count(TaskStatus::Assigned),
            in_progress: count(TaskStatus::InProgress),
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            agents,
        }
    }

    /// One-line summary for the orchestrator log.
    pub fn summary_line(&self) -> String {
        format!(
            "tasks: {} queued, {} assigned, {} in progress, {} completed, {} failed; {} agents",
            self.queued,
            self.assigned,
            self.in_progress,
            self.completed,
            self.failed,
            self.agents.len()
        )
    }

    fn to_markdown(&self) -> String {
        let mut content = String::new();
        content.push_str("# Foreman Status\n\n");
        content.push_str(&format!(
            "**Generated**: {}\n\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));

        content.push_str("## Tasks\n\n");
        content.push_str(&format!("- Queued: {}\n", self.queued));
        content.push_str(&format!("- Assigned: {}\n", self.assigned));
        content.push_str(&format!("- In progress: {}\n", self.in_progress));
        content.push_str(&format!("- Completed: {}\n", self.completed));
        content.push_str(&format!("- Failed: {}\n", self.failed));
        content.push('\n');

        content.push_str("## Agents\n\n");
        if self.agents.is_empty() {
            content.push_str("No agents registered.\n");
        }
        for agent in &self.agents {
            let task = agent.current_task_id.as_deref().unwrap_or("-");
            content.push_str(&format!(
                "- **{}**: {} (task: {}, completed: {}, restarts: {}, last seen: {})\n",
                agent.name,
                agent.status,
                task,
                agent.tasks_completed,
                agent.restart_count,
                agent.last_seen.format("%H:%M:%S"),
            ));
        }

        content
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary_line())?;
        for agent in &self.agents {
            writeln!(
                f,
                "  {} {} (task: {}, completed: {})",
                agent.name,
                agent.status,
                agent.current_task_id.as_deref().unwrap_or("-"),
                agent.tasks_completed
            )?;
        }
        Ok(())
    }
}

/// Writes status reports to `<dir>/status.md`.
pub struct ReportWriter {
    output_path: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            output_path: dir.into().join("status.md"),
        }
    }

    pub async fn write(&self, report: &StatusReport) -> Result<()> {
        if let Some(parent) = self.output_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.output_path, report.to_markdown()).await?;
        Ok(())
    }
}
