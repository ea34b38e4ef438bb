use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capability::ByteStream;
use super::events::{EventSink, TaskEvent};
use super::models::{SchedulerError, TaskError, TaskErrorKind, TaskView, TransferPayload};
use super::registry::HandlerRegistry;
use super::retry_policy::{RetryDecision, RetryPolicy};
use crate::config::SchedulerSettings;
use crate::health::ConnectionState;
use crate::notify::AdminNotifier;
use crate::task_store::{StoreError, TaskState, TaskStatus, TaskStore};

/// Attempts made for a single status write before the transition is abandoned.
const PERSIST_ATTEMPTS: u32 = 3;

/// Pause of the dispatch loop after the store refused to claim a task.
const CLAIM_FAILURE_BACKOFF: Duration = Duration::from_secs(1);

struct QueuedTask {
    id: String,
    title: String,
    kind: String,
    payload: Vec<u8>,
    created_at: i64,
    remaining_retries: u32,
    attempts: u32,
}

struct RunningTask {
    title: String,
    created_at: i64,
    /// Dispatch order, used to keep snapshots stable.
    seq: u64,
    cancel: CancellationToken,
    /// Set by [`TaskScheduler::cancel`]; a cancelled token without it means
    /// the worker was stopped by shutdown.
    cancel_requested: bool,
}

#[derive(Default)]
struct QueueState {
    queued: VecDeque<QueuedTask>,
    running: HashMap<String, RunningTask>,
    /// Cancelled between a failure and its re-queue, with the `cancelled`
    /// write still outstanding. The store says `pending` for these.
    cancelling: HashSet<String>,
    next_seq: u64,
    closed: bool,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    registry: HandlerRegistry,
    notifier: Arc<AdminNotifier>,
    sink: Arc<dyn EventSink>,
    connection: watch::Receiver<ConnectionState>,
    settings: SchedulerSettings,
    policy: RetryPolicy,
    /// Single serialization point for every queue mutation.
    queue: Mutex<QueueState>,
    wakeup: Notify,
    permits: Arc<Semaphore>,
}

/// Bounded-concurrency executor of persisted transfer tasks.
///
/// Cloning yields another handle to the same scheduler; one clone drives
/// [`TaskScheduler::run`] while the others submit, cancel and inspect.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: HandlerRegistry,
        notifier: Arc<AdminNotifier>,
        sink: Arc<dyn EventSink>,
        connection: watch::Receiver<ConnectionState>,
        settings: SchedulerSettings,
    ) -> Self {
        let workers = settings.workers.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                notifier,
                sink,
                connection,
                policy: RetryPolicy::new(&settings),
                settings,
                queue: Mutex::new(QueueState::default()),
                wakeup: Notify::new(),
                permits: Arc::new(Semaphore::new(workers)),
            }),
        }
    }

    /// Persist a new `pending` task and queue it. Returns its id.
    ///
    /// Nothing is queued when the write fails.
    pub fn submit(
        &self,
        kind: &str,
        payload: Vec<u8>,
        title: &str,
    ) -> Result<String, SchedulerError> {
        if !self.inner.registry.contains(kind) {
            return Err(SchedulerError::UnknownKind(kind.to_string()));
        }

        let task = TaskState::new_pending(kind, payload, title);
        {
            let mut queue = self.inner.lock_queue();
            if queue.closed {
                return Err(SchedulerError::ShuttingDown);
            }
            self.inner.store.put(&task)?;
            queue.queued.push_back(QueuedTask {
                id: task.id.clone(),
                title: task.title.clone(),
                kind: task.kind.clone(),
                payload: task.payload,
                created_at: task.created_at,
                remaining_retries: self.inner.policy.initial_budget(),
                attempts: 0,
            });
            // Recorded before a worker can report the start.
            self.inner.sink.record(TaskEvent::Submitted {
                task_id: task.id.clone(),
                kind: task.kind.clone(),
                title: task.title.clone(),
            });
        }

        info!("Task {} submitted: {} ({})", task.id, task.title, task.kind);
        self.inner.wakeup.notify_one();
        Ok(task.id)
    }

    /// Cancel a queued or running task.
    ///
    /// A queued task is removed and persisted `cancelled` at once. A running
    /// task is signalled; its worker persists `cancelled` at the next chunk
    /// boundary.
    pub fn cancel(&self, id: &str) -> Result<(), SchedulerError> {
        let mut queue = self.inner.lock_queue();

        if let Some(position) = queue.queued.iter().position(|t| t.id == id) {
            self.inner
                .store
                .update_status(id, TaskStatus::Cancelled, None)?;
            queue.queued.remove(position);
            drop(queue);

            info!("Task {} cancelled while queued", id);
            self.inner.sink.record(TaskEvent::Cancelled {
                task_id: id.to_string(),
            });
            return Ok(());
        }

        if let Some(running) = queue.running.get_mut(id) {
            if !running.cancel_requested {
                info!("Cancellation requested for running task {}", id);
                running.cancel_requested = true;
                running.cancel.cancel();
            }
            return Ok(());
        }

        Err(SchedulerError::NotFound(id.to_string()))
    }

    /// Snapshot of the running tasks, in dispatch order.
    pub fn running_tasks(&self) -> Vec<TaskView> {
        let queue = self.inner.lock_queue();
        let mut running: Vec<(&String, &RunningTask)> = queue.running.iter().collect();
        running.sort_by_key(|(_, task)| task.seq);
        running
            .into_iter()
            .map(|(id, task)| TaskView::new(id, &task.title, task.created_at, task.cancel_requested))
            .collect()
    }

    /// Snapshot of the queued tasks, in dispatch order.
    pub fn queued_tasks(&self) -> Vec<TaskView> {
        self.inner
            .lock_queue()
            .queued
            .iter()
            .map(|task| TaskView::new(&task.id, &task.title, task.created_at, false))
            .collect()
    }

    /// Re-queue every `pending` and `running` task found in the store that
    /// this scheduler does not already track.
    ///
    /// Tasks that were `running` restart from scratch and are reset to
    /// `pending` until a worker claims them again. A task cancelled while
    /// waiting for a retry whose `cancelled` write failed is never queued;
    /// its write is retried instead. Returns the number of tasks queued.
    pub fn recover(&self) -> Result<usize, SchedulerError> {
        let mut recovered = Vec::new();
        let mut cancelled = Vec::new();

        {
            // Listing under the queue lock: a worker leaves `running` in the
            // same critical section that stores its terminal status.
            let mut queue = self.inner.lock_queue();
            let tasks = self.inner.store.list_pending()?;
            for task in tasks {
                if queue.cancelling.contains(&task.id) {
                    if self.inner.retry_cancel_write(&task.id) {
                        queue.cancelling.remove(&task.id);
                        cancelled.push(task.id);
                    }
                    continue;
                }
                let known = queue.running.contains_key(&task.id)
                    || queue.queued.iter().any(|t| t.id == task.id);
                if known {
                    continue;
                }
                if task.status == TaskStatus::Running {
                    self.inner
                        .store
                        .update_status(&task.id, TaskStatus::Pending, None)?;
                }
                queue.queued.push_back(QueuedTask {
                    id: task.id.clone(),
                    title: task.title,
                    kind: task.kind,
                    payload: task.payload,
                    created_at: task.created_at,
                    remaining_retries: self.inner.policy.initial_budget(),
                    attempts: 0,
                });
                recovered.push((task.id, task.status));
            }
        }

        for task_id in cancelled {
            info!("Task {} cancelled", task_id);
            self.inner.sink.record(TaskEvent::Cancelled { task_id });
        }
        for (task_id, previous) in &recovered {
            debug!("Recovered task {} (was {})", task_id, previous);
            self.inner.sink.record(TaskEvent::Recovered {
                task_id: task_id.clone(),
                previous: *previous,
            });
        }
        if !recovered.is_empty() {
            info!("Recovered {} unfinished tasks from previous run", recovered.len());
            self.inner.wakeup.notify_one();
        }
        Ok(recovered.len())
    }

    /// Dispatch loop. Returns after `shutdown` fires and running workers have
    /// stopped or the shutdown timeout elapsed.
    pub async fn run(&self, shutdown: CancellationToken) {
        let inner = &self.inner;
        let mut connection = inner.connection.clone();
        let mut connection_alive = true;
        let workers_token = CancellationToken::new();
        let mut workers = JoinSet::new();

        info!(
            "Starting task scheduler with {} workers, {} retries per task",
            inner.settings.workers, inner.policy.max_retries
        );

        loop {
            while let Some(result) = workers.try_join_next() {
                if let Err(e) = result {
                    error!("Task worker panicked: {}", e);
                }
            }

            let connected = *connection.borrow_and_update() == ConnectionState::Connected;
            if !connected {
                debug!("Dispatch paused until connection is restored");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = connection.changed(), if connection_alive => {
                        connection_alive = changed.is_ok();
                    }
                    Some(result) = workers.join_next() => {
                        if let Err(e) = result {
                            error!("Task worker panicked: {}", e);
                        }
                    }
                }
                continue;
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if *connection.borrow() != ConnectionState::Connected {
                drop(permit);
                continue;
            }

            match inner.claim_next(&workers_token) {
                Claim::Task(task, token) => {
                    let worker = Arc::clone(inner);
                    workers.spawn(async move { worker.execute(task, token, permit).await });
                }
                Claim::Empty => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = inner.wakeup.notified() => {}
                        changed = connection.changed(), if connection_alive => {
                            connection_alive = changed.is_ok();
                        }
                    }
                }
                Claim::StoreFailed => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(CLAIM_FAILURE_BACKOFF) => {}
                    }
                }
            }
        }

        self.shutdown_workers(workers_token, workers).await;
    }

    async fn shutdown_workers(&self, workers_token: CancellationToken, mut workers: JoinSet<()>) {
        let running = {
            let mut queue = self.inner.lock_queue();
            queue.closed = true;
            queue.running.len()
        };
        info!(
            "Task scheduler shutting down, stopping {} running tasks",
            running
        );
        workers_token.cancel();

        let timeout = Duration::from_secs(self.inner.settings.shutdown_timeout_secs);
        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    error!("Task worker panicked: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Workers did not stop within {:?}, aborting them",
                timeout
            );
            workers.abort_all();
        }
        info!("Task scheduler stopped");
    }
}

enum Claim {
    Task(QueuedTask, CancellationToken),
    Empty,
    StoreFailed,
}

impl Inner {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dequeue the head of the queue and persist it as `running`.
    ///
    /// On a failed write the task goes back to the head of the queue.
    fn claim_next(&self, workers_token: &CancellationToken) -> Claim {
        let mut queue = self.lock_queue();
        let Some(mut task) = queue.queued.pop_front() else {
            return Claim::Empty;
        };

        if let Err(e) = self
            .store
            .update_status(&task.id, TaskStatus::Running, None)
        {
            error!("Failed to mark task {} as running: {}", task.id, e);
            queue.queued.push_front(task);
            return Claim::StoreFailed;
        }

        task.attempts += 1;
        let token = workers_token.child_token();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.running.insert(
            task.id.clone(),
            RunningTask {
                title: task.title.clone(),
                created_at: task.created_at,
                seq,
                cancel: token.clone(),
                cancel_requested: false,
            },
        );
        Claim::Task(task, token)
    }

    async fn execute(
        self: Arc<Self>,
        task: QueuedTask,
        token: CancellationToken,
        _permit: OwnedSemaphorePermit,
    ) {
        info!(
            "Task {} started: {} (attempt {})",
            task.id, task.title, task.attempts
        );
        self.sink.record(TaskEvent::Started {
            task_id: task.id.clone(),
            attempt: task.attempts,
        });

        let started = Instant::now();
        let outcome = self.transfer(&task, &token).await;
        let outcome = match outcome {
            Ok(_) if token.is_cancelled() => Err(TaskError::cancelled()),
            other => other,
        };

        match outcome {
            Ok(bytes) => self.finish_completed(task, bytes, started.elapsed()).await,
            Err(e) if e.is_cancelled() => self.finish_cancelled(task).await,
            Err(e) => self.finish_failed(task, e).await,
        }
    }

    async fn transfer(&self, task: &QueuedTask, token: &CancellationToken) -> Result<u64, TaskError> {
        let handler = self.registry.get(&task.kind).ok_or_else(|| {
            TaskError::new(
                TaskErrorKind::InvalidPayload,
                format!("no handler registered for kind '{}'", task.kind),
            )
        })?;
        let payload = TransferPayload::decode(&task.payload)?;

        let fetched = tokio::select! {
            _ = token.cancelled() => return Err(TaskError::cancelled()),
            fetched = handler.fetcher.fetch(&payload.source) => fetched?,
        };
        if let Some(size) = fetched.size {
            debug!("Task {} source size: {} bytes", task.id, size);
        }

        let stream = checkpointed(fetched.stream, token.clone());
        let result = handler.storage.put(stream, &payload.destination).await;

        let cancelled = token.is_cancelled() || matches!(&result, Err(e) if e.is_cancelled());
        if cancelled {
            if handler.storage.supports_rollback() {
                if let Err(e) = handler.storage.rollback(&payload.destination).await {
                    warn!(
                        "Failed to roll back partial output of task {} at {}: {}",
                        task.id, payload.destination, e
                    );
                }
            } else {
                warn!(
                    "Task {} stopped mid-transfer, partial output left at {}",
                    task.id, payload.destination
                );
            }
            return Err(TaskError::cancelled());
        }
        result
    }

    async fn finish_completed(&self, task: QueuedTask, bytes: u64, elapsed: Duration) {
        if !self.persist(&task.id, TaskStatus::Completed, None, true).await {
            self.abandon(&task.id);
            return;
        }

        info!(
            "Task {} completed: {} ({} bytes in {:?})",
            task.id, task.title, bytes, elapsed
        );
        self.sink.record(TaskEvent::Completed {
            task_id: task.id,
            bytes,
            duration_ms: elapsed.as_millis() as u64,
        });
        self.notifier.task_succeeded(&task.title);
    }

    async fn finish_cancelled(&self, task: QueuedTask) {
        let requested = self
            .lock_queue()
            .running
            .get(&task.id)
            .map(|r| r.cancel_requested)
            .unwrap_or(false);

        if !requested {
            // Stopped by shutdown: the store keeps `running` so the next
            // start recovers the task.
            self.lock_queue().running.remove(&task.id);
            info!("Task {} interrupted by shutdown", task.id);
            self.sink.record(TaskEvent::Interrupted { task_id: task.id });
            return;
        }

        if !self.persist(&task.id, TaskStatus::Cancelled, None, true).await {
            self.abandon(&task.id);
            return;
        }
        info!("Task {} cancelled: {}", task.id, task.title);
        self.sink.record(TaskEvent::Cancelled { task_id: task.id });
    }

    async fn finish_failed(&self, mut task: QueuedTask, error: TaskError) {
        match self.policy.decide(&error, task.remaining_retries) {
            RetryDecision::Retry { remaining } => {
                if !self.persist(&task.id, TaskStatus::Pending, None, false).await {
                    self.abandon(&task.id);
                    return;
                }

                let not_requeued = {
                    let mut queue = self.lock_queue();
                    let cancel_requested = queue
                        .running
                        .remove(&task.id)
                        .map(|r| r.cancel_requested)
                        .unwrap_or(false);
                    if cancel_requested {
                        queue.cancelling.insert(task.id.clone());
                        Some(task)
                    } else {
                        warn!(
                            "Task {} failed: {}. Re-queued, {} retries left",
                            task.id, error, remaining
                        );
                        task.remaining_retries = remaining;
                        self.sink.record(TaskEvent::RetryScheduled {
                            task_id: task.id.clone(),
                            remaining,
                            error,
                        });
                        queue.queued.push_back(task);
                        None
                    }
                };

                match not_requeued {
                    None => self.wakeup.notify_one(),
                    // Cancelled between the failure and the re-queue.
                    Some(task) => {
                        if self.persist(&task.id, TaskStatus::Cancelled, None, false).await {
                            self.lock_queue().cancelling.remove(&task.id);
                            info!("Task {} cancelled: {}", task.id, task.title);
                            self.sink.record(TaskEvent::Cancelled { task_id: task.id });
                        } else {
                            error!(
                                "Task {} was cancelled but the store still has it pending, \
                                 it is held back until the write succeeds",
                                task.id
                            );
                        }
                    }
                }
            }
            RetryDecision::Fail => {
                let message = error.to_string();
                if !self
                    .persist(&task.id, TaskStatus::Failed, Some(&message), true)
                    .await
                {
                    self.abandon(&task.id);
                    return;
                }

                error!("Task {} failed permanently: {}", task.id, message);
                self.sink.record(TaskEvent::Failed {
                    task_id: task.id,
                    error,
                });
                self.notifier.task_failed(&task.title, &message);
            }
        }
    }

    /// Write a status transition, retrying transient store failures.
    ///
    /// With `release`, each write happens under the queue lock and a
    /// successful one drops the task from the running set before the lock is
    /// released, so [`TaskScheduler::cancel`] never sees a finished task.
    /// Returns false when the transition could not be persisted.
    async fn persist(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
        release: bool,
    ) -> bool {
        let mut attempt = 1;
        loop {
            let result = if release {
                let mut queue = self.lock_queue();
                let result = self.store.update_status(id, status, error);
                if result.is_ok() {
                    queue.running.remove(id);
                }
                result
            } else {
                self.store.update_status(id, status, error)
            };
            match result {
                Ok(()) => return true,
                Err(StoreError::NotFound(_)) => {
                    warn!("Task {} was removed from the store before becoming {}", id, status);
                    return false;
                }
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(
                        "Failed to mark task {} as {} (attempt {}/{}): {}",
                        id, status, attempt, PERSIST_ATTEMPTS, e
                    );
                    tokio::time::sleep(Duration::from_millis(100 << attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Giving up marking task {} as {}: {}", id, status, e);
                    return false;
                }
            }
        }
    }

    /// Store a `cancelled` status that failed to persist earlier. Called with
    /// the queue lock held.
    fn retry_cancel_write(&self, id: &str) -> bool {
        match self.store.update_status(id, TaskStatus::Cancelled, None) {
            Ok(()) => true,
            Err(e) => {
                warn!("Task {} is still not marked cancelled: {}", id, e);
                false
            }
        }
    }

    /// Drop the in-memory record of a task whose final transition could not
    /// be persisted. The store still says `running`, so recovery picks it up.
    fn abandon(&self, id: &str) {
        self.lock_queue().running.remove(id);
        error!(
            "Abandoned transition of task {}, it will be recovered on next start",
            id
        );
    }
}

/// Yield a `Cancelled` error as soon as `token` fires, otherwise pass chunks
/// through. Cancellation is thus observed at least once per chunk.
fn checkpointed(stream: ByteStream, token: CancellationToken) -> ByteStream {
    futures::stream::unfold(Some((stream, token)), |state| async move {
        let (mut stream, token) = state?;
        tokio::select! {
            biased;
            _ = token.cancelled() => Some((Err(TaskError::cancelled()), None)),
            next = stream.next() => next.map(|chunk| (chunk, Some((stream, token)))),
        }
    })
    .boxed()
}
