//! Task lifecycle events and the sinks that consume them.
//!
//! The scheduler reports every lifecycle step to an [`EventSink`]. Sinks must
//! never block; [`BoundedEventSink`] drops events when its channel is full and
//! [`AuditLogger`] drains the channel into the task store's audit table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::models::TaskError;
use crate::task_store::{TaskEventRecord, TaskEventType, TaskStatus, TaskStore};

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Submitted {
        task_id: String,
        kind: String,
        title: String,
    },
    Started {
        task_id: String,
        attempt: u32,
    },
    RetryScheduled {
        task_id: String,
        remaining: u32,
        error: TaskError,
    },
    Completed {
        task_id: String,
        bytes: u64,
        duration_ms: u64,
    },
    Failed {
        task_id: String,
        error: TaskError,
    },
    Cancelled {
        task_id: String,
    },
    /// Worker stopped by shutdown; the task stays `running` for recovery.
    Interrupted {
        task_id: String,
    },
    Recovered {
        task_id: String,
        previous: TaskStatus,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Submitted { task_id, .. }
            | TaskEvent::Started { task_id, .. }
            | TaskEvent::RetryScheduled { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::Cancelled { task_id }
            | TaskEvent::Interrupted { task_id }
            | TaskEvent::Recovered { task_id, .. } => task_id,
        }
    }

    pub fn event_type(&self) -> TaskEventType {
        match self {
            TaskEvent::Submitted { .. } => TaskEventType::Submitted,
            TaskEvent::Started { .. } => TaskEventType::Started,
            TaskEvent::RetryScheduled { .. } => TaskEventType::RetryScheduled,
            TaskEvent::Completed { .. } => TaskEventType::Completed,
            TaskEvent::Failed { .. } => TaskEventType::Failed,
            TaskEvent::Cancelled { .. } => TaskEventType::Cancelled,
            TaskEvent::Interrupted { .. } => TaskEventType::Interrupted,
            TaskEvent::Recovered { .. } => TaskEventType::Recovered,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            TaskEvent::Submitted { kind, title, .. } => Some(serde_json::json!({
                "kind": kind,
                "title": title,
            })),
            TaskEvent::Started { attempt, .. } => Some(serde_json::json!({ "attempt": attempt })),
            TaskEvent::RetryScheduled {
                remaining, error, ..
            } => Some(serde_json::json!({
                "remaining_retries": remaining,
                "error_type": error.kind.as_str(),
                "error_message": error.message,
            })),
            TaskEvent::Completed {
                bytes, duration_ms, ..
            } => Some(serde_json::json!({
                "bytes_written": bytes,
                "duration_ms": duration_ms,
            })),
            TaskEvent::Failed { error, .. } => Some(serde_json::json!({
                "error_type": error.kind.as_str(),
                "error_message": error.message,
            })),
            TaskEvent::Recovered { previous, .. } => Some(serde_json::json!({
                "previous_status": previous.as_db_str(),
            })),
            TaskEvent::Cancelled { .. } | TaskEvent::Interrupted { .. } => None,
        }
    }

    pub fn to_record(&self) -> TaskEventRecord {
        let record = TaskEventRecord::new(self.task_id(), self.event_type());
        match self.details() {
            Some(details) => record.with_details(details),
            None => record,
        }
    }
}

/// Receives lifecycle events. Must return without blocking.
pub trait EventSink: Send + Sync {
    fn record(&self, event: TaskEvent);
}

/// Discards every event.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: TaskEvent) {}
}

/// Forwards events into a bounded channel, dropping them when it is full.
pub struct BoundedEventSink {
    tx: mpsc::Sender<TaskEvent>,
    dropped: AtomicU64,
}

impl BoundedEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TaskEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events discarded so far because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for BoundedEventSink {
    fn record(&self, event: TaskEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Dropping task event ({} dropped so far): {}", dropped, e);
        }
    }
}

/// Writes lifecycle events to the task store's audit table.
pub struct AuditLogger {
    store: Arc<dyn TaskStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn log(&self, event: &TaskEvent) {
        if let Err(e) = self.store.log_event(&event.to_record()) {
            warn!(
                "Failed to write audit event {} for task {}: {}",
                event.event_type().as_str(),
                event.task_id(),
                e
            );
        }
    }

    /// Drain `rx` until every sender is gone or `shutdown` fires, then flush
    /// whatever is already buffered.
    pub async fn run(self, mut rx: mpsc::Receiver<TaskEvent>, shutdown: CancellationToken) {
        info!("Task audit logger started");
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.log(&event),
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    rx.close();
                    while let Ok(event) = rx.try_recv() {
                        self.log(&event);
                    }
                    break;
                }
            }
        }
        info!("Task audit logger stopped");
    }
}
