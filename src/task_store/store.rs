//! Task state storage and persistence.
//!
//! Provides SQLite-backed storage for task records and their audit trail.

use super::models::*;
use super::schema::TASK_STATE_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::open_or_create;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::info;

/// Errors raised by the task store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Trait for task state storage operations.
///
/// Implementations must be safe to share between workers; each worker only
/// touches its own task ids but physical writes are serialized by the store.
/// No retry logic lives here: failures are surfaced to the caller.
pub trait TaskStore: Send + Sync {
    /// Insert or fully replace a task record.
    fn put(&self, task: &TaskState) -> Result<(), StoreError>;

    /// Get a task by id.
    fn get(&self, id: &str) -> Result<TaskState, StoreError>;

    /// All tasks in `pending` or `running` status, oldest first.
    fn list_pending(&self) -> Result<Vec<TaskState>, StoreError>;

    /// List tasks, newest first, optionally filtered by status.
    fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<TaskState>, StoreError>;

    /// Update status, error text and timestamps of an existing task.
    ///
    /// `completed_at` is set only for terminal statuses, and `error` is kept
    /// only for `failed`.
    fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Delete a task and its audit trail.
    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Append an entry to the audit trail.
    fn log_event(&self, event: &TaskEventRecord) -> Result<(), StoreError>;

    /// Audit entries of a task, oldest first.
    fn events_for(&self, task_id: &str, limit: usize) -> Result<Vec<TaskEventRecord>, StoreError>;
}

/// SQLite-backed task store.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open an existing database or create a new one with the current schema.
    ///
    /// Existing databases are validated against their recorded schema version
    /// and migrated forward.
    pub fn new<P: AsRef<Path>>(db_path: P) -> anyhow::Result<Self> {
        let is_new = !db_path.as_ref().exists();
        let conn = Connection::open(&db_path)?;
        open_or_create(&conn, TASK_STATE_VERSIONED_SCHEMAS, is_new)?;
        if is_new {
            info!("Created new task database at {:?}", db_path.as_ref());
        }

        Ok(SqliteTaskStore {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store, used by tests.
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        open_or_create(&conn, TASK_STATE_VERSIONED_SCHEMAS, true)?;
        Ok(SqliteTaskStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<TaskState> {
        let status: String = row.get("status")?;
        Ok(TaskState {
            id: row.get("id")?,
            title: row.get("title")?,
            kind: row.get("kind")?,
            payload: row.get("payload")?,
            status: TaskStatus::from_db_str(&status).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    format!("unknown task status '{}'", status).into(),
                )
            })?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
            error: row.get("error")?,
        })
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<TaskEventRecord> {
        let event_type: String = row.get("event_type")?;
        let details: Option<String> = row.get("details")?;
        Ok(TaskEventRecord {
            id: row.get("id")?,
            task_id: row.get("task_id")?,
            event_type: TaskEventType::from_str(&event_type).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    format!("unknown event type '{}'", event_type).into(),
                )
            })?,
            timestamp: row.get("timestamp")?,
            details: details.and_then(|s| serde_json::from_str(&s).ok()),
        })
    }
}

impl TaskStore for SqliteTaskStore {
    fn put(&self, task: &TaskState) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r#"INSERT INTO task_states (
                id, title, kind, status, payload, created_at, updated_at, completed_at, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                kind = excluded.kind,
                status = excluded.status,
                payload = excluded.payload,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at,
                error = excluded.error"#,
            params![
                task.id,
                task.title,
                task.kind,
                task.status.as_db_str(),
                task.payload,
                task.created_at,
                task.updated_at,
                task.completed_at,
                task.error,
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<TaskState, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM task_states WHERE id = ?1",
            [id],
            Self::row_to_task,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list_pending(&self) -> Result<Vec<TaskState>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT * FROM task_states
               WHERE status IN ('pending', 'running')
               ORDER BY created_at ASC"#,
        )?;
        let tasks = stmt
            .query_map([], Self::row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<TaskState>, StoreError> {
        let conn = self.lock()?;
        let tasks = match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    r#"SELECT * FROM task_states WHERE status = ?1
                       ORDER BY created_at DESC LIMIT ?2"#,
                )?;
                let rows = stmt
                    .query_map(params![status.as_db_str(), limit as i64], Self::row_to_task)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT * FROM task_states ORDER BY created_at DESC LIMIT ?1")?;
                let rows = stmt
                    .query_map(params![limit as i64], Self::row_to_task)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(tasks)
    }

    fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = now_millis();
        let completed_at = status.is_terminal().then_some(now);
        let error = match status {
            TaskStatus::Failed => error.unwrap_or_default(),
            _ => "",
        };

        let conn = self.lock()?;
        let updated = conn.execute(
            r#"UPDATE task_states
               SET status = ?2, updated_at = ?3, completed_at = ?4, error = ?5
               WHERE id = ?1"#,
            params![id, status.as_db_str(), now, completed_at, error],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let deleted = tx.execute("DELETE FROM task_states WHERE id = ?1", [id])?;
        tx.execute("DELETE FROM task_events WHERE task_id = ?1", [id])?;
        tx.commit()?;
        if deleted == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn log_event(&self, event: &TaskEventRecord) -> Result<(), StoreError> {
        let details = event
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let conn = self.lock()?;
        conn.execute(
            r#"INSERT INTO task_events (task_id, event_type, timestamp, details)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![
                event.task_id,
                event.event_type.as_str(),
                event.timestamp,
                details
            ],
        )?;
        Ok(())
    }

    fn events_for(&self, task_id: &str, limit: usize) -> Result<Vec<TaskEventRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT * FROM task_events WHERE task_id = ?1
               ORDER BY timestamp ASC, id ASC LIMIT ?2"#,
        )?;
        let events = stmt
            .query_map(params![task_id, limit as i64], Self::row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}
