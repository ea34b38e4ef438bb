//! Persisted task records and their lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a persisted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed, // terminal
    Failed,    // terminal
    Cancelled, // terminal
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Durable record of a single task.
///
/// Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub title: String,
    pub kind: String,
    pub payload: Vec<u8>,
    pub status: TaskStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    /// Last failure detail, empty unless `status == Failed`.
    pub error: String,
}

impl TaskState {
    /// Build a new `Pending` record with a freshly generated id.
    pub fn new_pending(kind: impl Into<String>, payload: Vec<u8>, title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            kind: kind.into(),
            payload,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: String::new(),
        }
    }
}

/// Kind of entry in the task audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventType {
    Submitted,
    Started,
    RetryScheduled,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
    Recovered,
}

impl TaskEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventType::Submitted => "submitted",
            TaskEventType::Started => "started",
            TaskEventType::RetryScheduled => "retry_scheduled",
            TaskEventType::Completed => "completed",
            TaskEventType::Failed => "failed",
            TaskEventType::Cancelled => "cancelled",
            TaskEventType::Interrupted => "interrupted",
            TaskEventType::Recovered => "recovered",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(TaskEventType::Submitted),
            "started" => Some(TaskEventType::Started),
            "retry_scheduled" => Some(TaskEventType::RetryScheduled),
            "completed" => Some(TaskEventType::Completed),
            "failed" => Some(TaskEventType::Failed),
            "cancelled" => Some(TaskEventType::Cancelled),
            "interrupted" => Some(TaskEventType::Interrupted),
            "recovered" => Some(TaskEventType::Recovered),
            _ => None,
        }
    }
}

/// One row of the `task_events` audit table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEventRecord {
    /// Database-assigned id, `None` until stored.
    pub id: Option<i64>,
    pub task_id: String,
    pub event_type: TaskEventType,
    pub timestamp: i64,
    pub details: Option<serde_json::Value>,
}

impl TaskEventRecord {
    pub fn new(task_id: impl Into<String>, event_type: TaskEventType) -> Self {
        Self {
            id: None,
            task_id: task_id.into(),
            event_type,
            timestamp: now_millis(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
