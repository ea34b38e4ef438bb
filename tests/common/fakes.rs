//! In-memory stand-ins for the chat transport, the transfer capabilities and
//! a task store that fails on demand.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use savebot_agent::notify::{ChatTransport, TransportError};
use savebot_agent::task_store::{
    SqliteTaskStore, StoreError, TaskEventRecord, TaskState, TaskStatus, TaskStore,
};
use savebot_agent::tasks::{
    ByteStream, EventSink, FetchedSource, SourceFetcher, StorageBackend, TaskError,
    TaskErrorKind, TaskEvent,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Transport whose liveness is flipped by the test.
pub struct ScriptedTransport {
    up: AtomicBool,
    probes: AtomicUsize,
    sent: Mutex<Vec<(i64, String)>>,
}

impl ScriptedTransport {
    pub fn new(up: bool) -> Self {
        Self {
            up: AtomicBool::new(up),
            probes: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, text)| text).collect()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unavailable("gateway down".to_string()))
        }
    }

    async fn send(&self, recipient: i64, text: &str) -> Result<(), TransportError> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("gateway down".to_string()));
        }
        self.sent.lock().unwrap().push((recipient, text.to_string()));
        Ok(())
    }
}

/// Behaviour of one source of the [`ScriptedFetcher`].
#[derive(Clone)]
pub enum Script {
    /// Yield the chunks, then end.
    Chunks(Vec<Vec<u8>>),
    /// Fail the first `failures` fetches with `error`, then yield `chunks`.
    FailThen {
        failures: u32,
        error: TaskError,
        chunks: Vec<Vec<u8>>,
    },
    /// Yield the chunks, then never finish.
    Hang(Vec<Vec<u8>>),
}

impl Script {
    pub fn ok(body: &[u8]) -> Self {
        Script::Chunks(vec![body.to_vec()])
    }

    pub fn always_fail(kind: TaskErrorKind, message: &str) -> Self {
        Script::FailThen {
            failures: u32::MAX,
            error: TaskError::new(kind, message),
            chunks: Vec::new(),
        }
    }

    pub fn hang() -> Self {
        Script::Hang(vec![b"partial".to_vec()])
    }
}

/// Fetcher serving scripted sources and recording every fetch in order.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    failures_served: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, source: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(source.to_string(), script);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, source: &str) -> usize {
        self.calls().iter().filter(|s| s.as_str() == source).count()
    }
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
    async fn fetch(&self, source: &str) -> Result<FetchedSource, TaskError> {
        self.calls.lock().unwrap().push(source.to_string());

        let script = self.scripts.lock().unwrap().get(source).cloned();
        let script = script.ok_or_else(|| {
            TaskError::new(TaskErrorKind::NotFound, format!("no such source {}", source))
        })?;

        let (chunks, hang) = match script {
            Script::Chunks(chunks) => (chunks, false),
            Script::Hang(chunks) => (chunks, true),
            Script::FailThen {
                failures,
                error,
                chunks,
            } => {
                let mut served = self.failures_served.lock().unwrap();
                let count = served.entry(source.to_string()).or_insert(0);
                if *count < failures {
                    *count += 1;
                    return Err(error);
                }
                (chunks, false)
            }
        };

        let size = chunks.iter().map(|c| c.len() as u64).sum();
        let body = stream::iter(chunks.into_iter().map(Ok));
        let stream: ByteStream = if hang {
            body.chain(stream::pending()).boxed()
        } else {
            body.boxed()
        };
        Ok(FetchedSource {
            stream,
            size: Some(size),
        })
    }
}

/// Storage keeping objects in memory, with rollback of partial writes.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    partial: Mutex<HashMap<String, Vec<u8>>>,
    rollbacks: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, destination: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(destination).cloned()
    }

    pub fn has_partial(&self, destination: &str) -> bool {
        self.partial.lock().unwrap().contains_key(destination)
    }

    pub fn rollbacks(&self) -> Vec<String> {
        self.rollbacks.lock().unwrap().clone()
    }

    /// Highest number of writes observed in flight at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn put(&self, mut stream: ByteStream, destination: &str) -> Result<u64, TaskError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let mut written = 0u64;
        let mut result = Ok(());
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    written += bytes.len() as u64;
                    self.partial
                        .lock()
                        .unwrap()
                        .entry(destination.to_string())
                        .or_default()
                        .extend_from_slice(&bytes);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        result?;

        let body = self
            .partial
            .lock()
            .unwrap()
            .remove(destination)
            .unwrap_or_default();
        self.objects
            .lock()
            .unwrap()
            .insert(destination.to_string(), body);
        Ok(written)
    }

    fn supports_rollback(&self) -> bool {
        true
    }

    async fn rollback(&self, destination: &str) -> Result<(), TaskError> {
        self.partial.lock().unwrap().remove(destination);
        self.objects.lock().unwrap().remove(destination);
        self.rollbacks
            .lock()
            .unwrap()
            .push(destination.to_string());
        Ok(())
    }
}

/// Event sink keeping every event for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, task_id: &str) -> Vec<TaskEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.task_id() == task_id)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: TaskEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Task store wrapper whose writes can be switched to fail.
///
/// Reads always go through. Status writes can also be slowed down: the delay
/// runs after the inner write succeeded, while the caller still waits.
pub struct FaultyStore {
    inner: Arc<SqliteTaskStore>,
    fail_puts: AtomicBool,
    failing_statuses: Mutex<HashSet<TaskStatus>>,
    slow_statuses: Mutex<HashMap<TaskStatus, Duration>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<SqliteTaskStore>) -> Self {
        Self {
            inner,
            fail_puts: AtomicBool::new(false),
            failing_statuses: Mutex::new(HashSet::new()),
            slow_statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Make every `update_status` to `status` fail.
    pub fn fail_status(&self, status: TaskStatus) {
        self.failing_statuses.lock().unwrap().insert(status);
    }

    pub fn slow_status(&self, status: TaskStatus, delay: Duration) {
        self.slow_statuses.lock().unwrap().insert(status, delay);
    }

    /// Let every write through again.
    pub fn heal(&self) {
        self.fail_puts.store(false, Ordering::SeqCst);
        self.failing_statuses.lock().unwrap().clear();
        self.slow_statuses.lock().unwrap().clear();
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("disk detached".to_string())
    }
}

impl TaskStore for FaultyStore {
    fn put(&self, task: &TaskState) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.put(task)
    }

    fn get(&self, id: &str) -> Result<TaskState, StoreError> {
        self.inner.get(id)
    }

    fn list_pending(&self) -> Result<Vec<TaskState>, StoreError> {
        self.inner.list_pending()
    }

    fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<TaskState>, StoreError> {
        self.inner.list(status, limit)
    }

    fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        if self.failing_statuses.lock().unwrap().contains(&status) {
            return Err(Self::unavailable());
        }
        self.inner.update_status(id, status, error)?;

        let delay = self.slow_statuses.lock().unwrap().get(&status).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete(id)
    }

    fn log_event(&self, event: &TaskEventRecord) -> Result<(), StoreError> {
        self.inner.log_event(event)
    }

    fn events_for(&self, task_id: &str, limit: usize) -> Result<Vec<TaskEventRecord>, StoreError> {
        self.inner.events_for(task_id, limit)
    }
}
