//! SaveBot Agent Library
//!
//! Task scheduling and connection resilience for the chat-driven save agent.
//! Exposes the internal modules to the binaries and the integration tests.

pub mod backends;
pub mod config;
pub mod health;
pub mod notify;
pub mod sqlite_persistence;
pub mod task_store;
pub mod tasks;

// Re-export commonly used types for convenience
pub use health::{ConnectionState, HealthMonitor};
pub use notify::{AdminNotifier, ChatTransport};
pub use task_store::{SqliteTaskStore, TaskStore};
pub use tasks::{HandlerRegistry, TaskScheduler};
