//! Durable task state.
//!
//! One record per task, keyed by id, plus an append-only audit trail of
//! lifecycle events. The store is authoritative; the scheduler's in-memory
//! views are caches over it.

mod models;
mod schema;
mod store;

pub use models::{TaskEventRecord, TaskEventType, TaskState, TaskStatus};
pub(crate) use models::now_millis;
pub use schema::TASK_STATE_VERSIONED_SCHEMAS;
pub use store::{SqliteTaskStore, StoreError, TaskStore};
