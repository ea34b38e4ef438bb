//! A scheduler wired to in-memory fakes.

use super::fakes::{
    FaultyStore, MemoryStorage, RecordingSink, ScriptedFetcher, ScriptedTransport,
};
use savebot_agent::config::SchedulerSettings;
use savebot_agent::health::ConnectionState;
use savebot_agent::notify::AdminNotifier;
use savebot_agent::task_store::{SqliteTaskStore, TaskStatus, TaskStore};
use savebot_agent::tasks::{HandlerRegistry, TaskScheduler, TransferPayload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TEST_KIND: &str = "mem";
pub const ADMIN_ID: i64 = 4242;

/// Upper bound for any condition a test waits on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SchedulerHarness {
    /// The backing store, read directly by assertions.
    pub store: Arc<SqliteTaskStore>,
    /// The scheduler's view of `store`, healthy until a test breaks it.
    pub faults: Arc<FaultyStore>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub storage: Arc<MemoryStorage>,
    pub transport: Arc<ScriptedTransport>,
    pub events: Arc<RecordingSink>,
    pub connection: watch::Sender<ConnectionState>,
    pub scheduler: TaskScheduler,
    pub shutdown: CancellationToken,
}

impl SchedulerHarness {
    pub fn new(workers: usize, max_retries: u32) -> Self {
        Self::with_store(
            Arc::new(SqliteTaskStore::in_memory().unwrap()),
            workers,
            max_retries,
        )
    }

    pub fn with_store(store: Arc<SqliteTaskStore>, workers: usize, max_retries: u32) -> Self {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let storage = Arc::new(MemoryStorage::new());
        let transport = Arc::new(ScriptedTransport::new(true));
        let events = Arc::new(RecordingSink::new());
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let (connection, connection_rx) = watch::channel(ConnectionState::Connected);

        let registry = HandlerRegistry::new().with_kind(
            TEST_KIND,
            fetcher.clone(),
            storage.clone(),
        );
        let notifier = Arc::new(AdminNotifier::new(
            Some(transport.clone()),
            vec![ADMIN_ID],
        ));
        let settings = SchedulerSettings {
            workers,
            max_retries,
            shutdown_timeout_secs: 2,
            ..Default::default()
        };

        let scheduler = TaskScheduler::new(
            faults.clone(),
            registry,
            notifier,
            events.clone(),
            connection_rx,
            settings,
        );

        Self {
            store,
            faults,
            fetcher,
            storage,
            transport,
            events,
            connection,
            scheduler,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the dispatch loop.
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move { scheduler.run(token).await })
    }

    /// Submit a transfer of `source` into `out/<title>`.
    pub fn submit(&self, source: &str, title: &str) -> String {
        self.scheduler
            .submit(TEST_KIND, payload(source, title), title)
            .unwrap()
    }

    pub fn status(&self, id: &str) -> TaskStatus {
        self.store.get(id).unwrap().status
    }

    /// Wait until the task `id` reaches `status` in the store.
    pub async fn wait_for_status(&self, id: &str, status: TaskStatus) {
        wait_until(|| self.status(id) == status).await;
    }
}

pub fn payload(source: &str, title: &str) -> Vec<u8> {
    TransferPayload::new(source, destination(title)).encode()
}

pub fn destination(title: &str) -> String {
    format!("out/{}", title)
}

/// Poll `condition` until it holds, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", WAIT_TIMEOUT);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
