//! Task and execution records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque key-value mapping passed to handlers and returned by them.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TaskStatus::Idle),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Outcome state of a [`TaskExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

impl From<ExecutionStatus> for TaskStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Running => TaskStatus::Running,
            ExecutionStatus::Success => TaskStatus::Success,
            ExecutionStatus::Failed => TaskStatus::Failed,
        }
    }
}

/// A recurring or manually-triggered unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier. Generated on add when left empty.
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Key into the handler registry.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Interval keyword, or empty for manual-only tasks.
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Task {
    /// Build an enabled, not-yet-registered task.
    ///
    /// Server-maintained fields are placeholders until the registry stamps them.
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        schedule: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            task_type: task_type.into(),
            schedule: schedule.into(),
            params: Params::new(),
            enabled: true,
            last_run: None,
            next_run: None,
            status: TaskStatus::Idle,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether the scanner should pick this task up at `now`.
    ///
    /// Running-set membership is checked separately by the coordinator.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|next| next <= now)
    }
}

/// One concrete run of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: i64,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result: Params,
    #[serde(default)]
    pub error: String,
}

/// Completion fields written once when an execution finishes.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub completed_at: DateTime<Utc>,
    pub result: Params,
    pub error: String,
}

impl ExecutionOutcome {
    pub fn success(completed_at: DateTime<Utc>, result: Params) -> Self {
        Self {
            status: ExecutionStatus::Success,
            completed_at,
            result,
            error: String::new(),
        }
    }

    pub fn failure(completed_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            completed_at,
            result: Params::new(),
            error: error.into(),
        }
    }
}
