//! Core record definitions for Foreman orchestration
//!
//! These types are the canonical schema shared by every component. All
//! persisted records go through `validate()` at the store boundary, so a
//! writer and a reader can never disagree on field names or enum values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::{ForemanError, Result};

/// Task lifecycle status.
///
/// Transitions move strictly forward through
/// `Queued -> Assigned -> InProgress -> {Completed | Failed}`; the single
/// backward edge is `Failed -> Queued` when requeueing is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// True for statuses that end a task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// True if a task in this status must carry an assigned agent.
    pub fn requires_agent(&self) -> bool {
        !matches!(self, Self::Queued)
    }

    /// Check whether `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Assigned)
                | (Self::Assigned, Self::InProgress)
                | (Self::Assigned, Self::Queued)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Queued)
                | (Self::Failed, Self::Queued)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Assigned => write!(f, "assigned"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// A unit of work pulled from the queue by an agent.
///
/// Priority convention: lower value means more urgent; 0 is the most urgent
/// (P0). Valid range is 0-4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,

    /// Capability tag used to match the task to an agent (e.g. "build")
    #[serde(rename = "type")]
    pub task_type: String,

    pub description: String,

    pub priority: i32,

    pub status: TaskStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,

    /// Task ids that must complete before this task becomes assignable
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a queued task with a generated id.
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self::with_id(
            format!("task-{}", &Uuid::new_v4().to_string()[..8]),
            task_type,
            description,
        )
    }

    /// Create a queued task with an explicit id.
    pub fn with_id(
        id: impl Into<String>,
        task_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            description: description.into(),
            priority: 2,
            status: TaskStatus::Queued,
            assigned_agent: None,
            dependencies: Vec::new(),
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Validate checks if the record has valid field values.
    ///
    /// Enforces the assignment invariant: `assigned_agent` is set iff the
    /// status is past `Queued`.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ForemanError::SchemaValidation("task id is required".to_string()));
        }
        if self.task_type.is_empty() {
            return Err(ForemanError::SchemaValidation(
                "task type is required".to_string(),
            ));
        }
        if !(0..=4).contains(&self.priority) {
            return Err(ForemanError::SchemaValidation(format!(
                "priority must be between 0 and 4 (got {})",
                self.priority
            )));
        }
        if self.status.requires_agent() && self.assigned_agent.is_none() {
            return Err(ForemanError::SchemaValidation(format!(
                "task {} has status {} but no assigned agent",
                self.id, self.status
            )));
        }
        if !self.status.requires_agent() && self.assigned_agent.is_some() {
            return Err(ForemanError::SchemaValidation(format!(
                "queued task {} must not carry an assigned agent",
                self.id
            )));
        }
        if self.status.is_terminal() && self.completed_at.is_none() {
            return Err(ForemanError::SchemaValidation(format!(
                "terminal task {} must have completed_at",
                self.id
            )));
        }
        Ok(())
    }

    /// Return the task to the queue, clearing assignment bookkeeping.
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Queued;
        self.assigned_agent = None;
        self.assigned_at = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// Agent lifecycle status as maintained by the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Unknown,
    Starting,
    Available,
    Busy,
    Idle,
    Unresponsive,
    Restarting,
    Stopped,
    Critical,
}

impl AgentStatus {
    /// True for statuses in which the agent can accept new work.
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Available | Self::Idle)
    }

    /// True for statuses that represent a running process.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Available | Self::Busy | Self::Idle | Self::Unresponsive
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Starting => write!(f, "starting"),
            Self::Available => write!(f, "available"),
            Self::Busy => write!(f, "busy"),
            Self::Idle => write!(f, "idle"),
            Self::Unresponsive => write!(f, "unresponsive"),
            Self::Restarting => write!(f, "restarting"),
            Self::Stopped => write!(f, "stopped"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "starting" => Ok(Self::Starting),
            "available" => Ok(Self::Available),
            "busy" => Ok(Self::Busy),
            "idle" => Ok(Self::Idle),
            "unresponsive" => Ok(Self::Unresponsive),
            "restarting" => Ok(Self::Restarting),
            "stopped" => Ok(Self::Stopped),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid agent status: {}", s)),
        }
    }
}

/// Registry record for one worker agent.
///
/// Created implicitly on the first status write. A record whose `last_seen`
/// exceeds the staleness threshold is pruned from the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,

    pub status: AgentStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    pub last_seen: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,

    #[serde(default)]
    pub tasks_completed: u64,

    /// Restarts within the supervisor's rolling window
    #[serde(default)]
    pub restart_count: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: AgentStatus::Unknown,
            pid: None,
            last_seen: Utc::now(),
            current_task_id: None,
            tasks_completed: 0,
            restart_count: 0,
            capabilities: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Busy with no current task: an inconsistency the orchestrator self-heals
    /// back to Available rather than rejecting.
    pub fn is_stale_busy(&self) -> bool {
        self.status == AgentStatus::Busy && self.current_task_id.is_none()
    }

    /// Record a heartbeat.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Validate checks if the record has valid field values.
    ///
    /// Deliberately tolerates the stale-busy inconsistency; see
    /// [`AgentRecord::is_stale_busy`].
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ForemanError::SchemaValidation(
                "agent name is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Kinds of mailbox notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A task entered the queue
    NewTask,
    /// The receiving agent was assigned a task and should execute it
    ExecuteTask,
    /// Informational status change
    StatusChange,
    /// Operator-facing escalation
    EmergencyBroadcast,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewTask => write!(f, "new_task"),
            Self::ExecuteTask => write!(f, "execute_task"),
            Self::StatusChange => write!(f, "status_change"),
            Self::EmergencyBroadcast => write!(f, "emergency_broadcast"),
        }
    }
}

/// One mailbox entry.
///
/// Delivery is at-least-once: across a crash/restart boundary the same entry
/// may be observed more than once. The `id` exists solely so consumers can
/// deduplicate against their persisted processed-id set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: NotificationKind,
    /// Task id or free text, depending on `kind`
    pub payload: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            payload: payload.into(),
        }
    }

    /// A task entered the queue.
    pub fn new_task(task_id: impl Into<String>) -> Self {
        Self::new(NotificationKind::NewTask, task_id)
    }

    /// The receiving agent should execute the given task.
    pub fn execute_task(task_id: impl Into<String>) -> Self {
        Self::new(NotificationKind::ExecuteTask, task_id)
    }

    /// Informational status change.
    pub fn status_change(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::StatusChange, message)
    }

    /// Operator-facing escalation.
    pub fn emergency(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::EmergencyBroadcast, message)
    }
}

/// Static definition of one agent, loaded from configuration.
///
/// Replaces ad-hoc global capability/priority tables: the registry is the
/// single source for what an agent can do and how it is launched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Canonical agent name (unique key)
    pub name: String,

    /// Historical names that must resolve to the same record
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,

    /// Capability tags this agent advertises (matched against task types)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    /// Static scheduling priority added to the capability score
    #[serde(default)]
    pub static_priority: i32,

    /// Command line used to launch the agent process
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_static_priority(mut self, static_priority: i32) -> Self {
        self.static_priority = static_priority;
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn has_capability(&self, task_type: &str) -> bool {
        self.capabilities.iter().any(|c| c == task_type)
    }
}

/// Registry of agent definitions with alias resolution.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    definitions: BTreeMap<String, AgentDefinition>,
    aliases: BTreeMap<String, String>,
}

impl AgentRegistry {
    pub fn new(definitions: Vec<AgentDefinition>) -> Self {
        let mut registry = Self::default();
        for def in definitions {
            for alias in &def.aliases {
                registry.aliases.insert(alias.clone(), def.name.clone());
            }
            registry.definitions.insert(def.name.clone(), def);
        }
        registry
    }

    /// Resolve a name or historical alias to its definition.
    pub fn resolve(&self, name: &str) -> Option<&AgentDefinition> {
        if let Some(def) = self.definitions.get(name) {
            return Some(def);
        }
        self.aliases
            .get(name)
            .and_then(|canonical| self.definitions.get(canonical))
    }

    /// Resolve a name or alias to the canonical agent name.
    pub fn canonical_name(&self, name: &str) -> Option<&str> {
        self.resolve(name).map(|def| def.name.as_str())
    }

    /// All definitions in deterministic (name) order.
    pub fn definitions(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// One entry of the alert/notification history, used to deduplicate
/// operator escalations within a configurable window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub key: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
