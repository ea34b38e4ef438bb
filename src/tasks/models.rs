//! Job-level errors, status views and the transfer payload.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::task_store::StoreError;

/// Classification of a failed fetch or store attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    Network,        // retry
    Timeout,        // retry
    NotFound,       // source is gone - NO retry
    Permission,     // NO retry
    InvalidPayload, // NO retry
    Storage,        // retry
    Cancelled,      // stop signal observed
    Unknown,        // retry
}

impl TaskErrorKind {
    /// Returns true if this error kind consumes retry budget instead of
    /// failing the task immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskErrorKind::Network
                | TaskErrorKind::Timeout
                | TaskErrorKind::Storage
                | TaskErrorKind::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskErrorKind::Network => "network",
            TaskErrorKind::Timeout => "timeout",
            TaskErrorKind::NotFound => "not_found",
            TaskErrorKind::Permission => "permission",
            TaskErrorKind::InvalidPayload => "invalid_payload",
            TaskErrorKind::Storage => "storage",
            TaskErrorKind::Cancelled => "cancelled",
            TaskErrorKind::Unknown => "unknown",
        }
    }
}

/// Failure of a single execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(TaskErrorKind::Cancelled, "cancelled")
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == TaskErrorKind::Cancelled
    }
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => TaskErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => TaskErrorKind::Permission,
            std::io::ErrorKind::TimedOut => TaskErrorKind::Timeout,
            _ => TaskErrorKind::Storage,
        };
        TaskError::new(kind, e.to_string())
    }
}

/// Errors surfaced synchronously by the scheduler's public operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("No handler registered for task kind '{0}'")]
    UnknownKind(String),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

/// Status-reporting snapshot of a queued or running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskView {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    /// Cancellation was requested but the worker has not stopped yet.
    pub cancelled: bool,
}

impl TaskView {
    pub(crate) fn new(id: &str, title: &str, created_at_millis: i64, cancelled: bool) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            created_at: Utc
                .timestamp_millis_opt(created_at_millis)
                .single()
                .unwrap_or_default(),
            cancelled,
        }
    }
}

/// Source and destination halves of a task payload.
///
/// The scheduler only splits the payload to route each half to the kind's
/// fetcher and storage; both strings are opaque to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPayload {
    pub source: String,
    pub destination: String,
}

impl TransferPayload {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Two plain strings always serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TaskError> {
        serde_json::from_slice(bytes).map_err(|e| {
            TaskError::new(
                TaskErrorKind::InvalidPayload,
                format!("malformed transfer payload: {}", e),
            )
        })
    }
}
