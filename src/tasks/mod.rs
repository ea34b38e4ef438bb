//! Task scheduling.
//!
//! The [`TaskScheduler`] runs persisted transfer tasks on a fixed number of
//! worker slots. Each task kind maps to a fetcher and a storage backend in
//! the [`HandlerRegistry`]; lifecycle steps are reported to an
//! [`EventSink`] and terminal outcomes to the operators.

mod capability;
mod events;
mod models;
mod registry;
mod retry_policy;
mod scheduler;

pub use capability::{ByteStream, FetchedSource, SourceFetcher, StorageBackend};
pub use events::{AuditLogger, BoundedEventSink, EventSink, NoopSink, TaskEvent};
pub use models::{SchedulerError, TaskError, TaskErrorKind, TaskView, TransferPayload};
pub use registry::{HandlerRegistry, KindHandler};
pub use retry_policy::{RetryDecision, RetryPolicy};
pub use scheduler::TaskScheduler;
