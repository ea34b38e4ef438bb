use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use savebot_agent::backends::{HttpFetcher, LocalStorage, WebhookTransport};
use savebot_agent::config::{AppConfig, CliConfig, FileConfig};
use savebot_agent::health::{HealthEvent, HealthMonitor};
use savebot_agent::notify::{AdminNotifier, ChatTransport};
use savebot_agent::task_store::{SqliteTaskStore, TaskStore};
use savebot_agent::tasks::{
    AuditLogger, BoundedEventSink, EventSink, HandlerRegistry, NoopSink, TaskScheduler,
};

/// How long shutdown waits for the farewell notification.
const SHUTDOWN_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the task database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Base directory of the local storage backend. Defaults to `<db-dir>/files`.
    #[clap(long, value_parser = parse_path)]
    pub storage_dir: Option<PathBuf>,

    /// Number of tasks that may run at once.
    #[clap(long, default_value_t = 3)]
    pub workers: usize,

    /// Retries granted to each task after its first failed attempt.
    #[clap(long, default_value_t = 2)]
    pub max_retries: u32,

    /// Interval in seconds between connection health probes.
    #[clap(long, default_value_t = 30)]
    pub check_interval_secs: u64,

    /// Operator chat id receiving status messages. Repeatable.
    #[clap(long = "admin-id")]
    pub admin_ids: Vec<i64>,

    /// URL probed to check the chat gateway is reachable.
    #[clap(long)]
    pub probe_url: Option<String>,

    /// URL receiving outgoing chat messages.
    #[clap(long)]
    pub webhook_url: Option<String>,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_dir: self.db_dir.clone(),
            storage_dir: self.storage_dir.clone(),
            workers: self.workers,
            max_retries: self.max_retries,
            check_interval_secs: self.check_interval_secs,
            admin_ids: self.admin_ids.clone(),
            probe_url: self.probe_url.clone(),
            webhook_url: self.webhook_url.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    info!("Opening task database at {:?}...", config.task_db_path());
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(config.task_db_path())?);

    let (probe_url, webhook_url) = match (
        config.transport.probe_url.clone(),
        config.transport.webhook_url.clone(),
    ) {
        (Some(probe_url), Some(webhook_url)) => (probe_url, webhook_url),
        _ => bail!("Both transport.probe_url and transport.webhook_url must be configured"),
    };
    let transport: Arc<dyn ChatTransport> = Arc::new(WebhookTransport::new(
        probe_url,
        webhook_url,
        config.transport.timeout_secs,
    )?);

    let notifier = Arc::new(AdminNotifier::new(
        Some(Arc::clone(&transport)),
        config.admin_recipients.clone(),
    ));
    if !notifier.enabled() {
        info!("No admin recipients configured, operator notifications disabled");
    }

    let monitor = HealthMonitor::new(Arc::clone(&transport), config.health.clone());
    {
        let n = Arc::clone(&notifier);
        monitor.on(HealthEvent::Disconnected, move || {
            n.disconnected();
        });
        let n = Arc::clone(&notifier);
        monitor.on(HealthEvent::Reconnected, move || {
            n.reconnected();
        });
        let n = Arc::clone(&notifier);
        monitor.on(HealthEvent::ReconnectFailed, move || {
            n.reconnect_failed();
        });
    }

    let shutdown = CancellationToken::new();
    // Stopped after the scheduler so events of interrupted tasks are kept.
    let audit_shutdown = CancellationToken::new();

    let mut audit_handle = None;
    let sink: Arc<dyn EventSink> = if config.audit.enabled {
        let (sink, rx) = BoundedEventSink::new(config.audit.buffer);
        let logger = AuditLogger::new(Arc::clone(&store));
        let token = audit_shutdown.clone();
        audit_handle = Some(tokio::spawn(async move { logger.run(rx, token).await }));
        Arc::new(sink)
    } else {
        Arc::new(NoopSink)
    };

    tokio::fs::create_dir_all(&config.storage.local_base_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create storage directory {:?}",
                config.storage.local_base_dir
            )
        })?;
    info!(
        "Local storage rooted at {:?}",
        config.storage.local_base_dir
    );
    let registry = HandlerRegistry::new().with_kind(
        "http",
        Arc::new(HttpFetcher::new(config.transport.timeout_secs)?),
        Arc::new(LocalStorage::new(config.storage.local_base_dir.clone())),
    );
    info!("Registered task kinds: {:?}", registry.kinds());

    let scheduler = TaskScheduler::new(
        Arc::clone(&store),
        registry,
        Arc::clone(&notifier),
        sink,
        monitor.watch_state(),
        config.scheduler.clone(),
    );

    let recovered = scheduler.recover()?;
    info!("{} unfinished tasks queued from previous run", recovered);

    let monitor_handle = monitor.start(&shutdown);
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { scheduler.run(token).await })
    };

    // Pick up tasks enqueued by the operator CLI while running
    if config.scheduler.rescan_interval_secs > 0 {
        let scheduler = scheduler.clone();
        let token = shutdown.clone();
        let period = Duration::from_secs(config.scheduler.rescan_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);

            // Skip the first immediate tick, startup already recovered
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match scheduler.recover() {
                    Ok(count) if count > 0 => info!("Picked up {} new tasks from the store", count),
                    Ok(_) => {}
                    Err(e) => error!("Failed to rescan task store: {}", e),
                }
            }
        });
    }

    let _ = notifier.startup();
    info!("Agent ready with {} workers", config.scheduler.workers);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    monitor.stop();

    if let Err(e) = scheduler_handle.await {
        error!("Task scheduler panicked: {}", e);
    }
    if let Err(e) = monitor_handle.await {
        error!("Health monitor panicked: {}", e);
    }
    audit_shutdown.cancel();
    if let Some(handle) = audit_handle {
        if let Err(e) = handle.await {
            error!("Audit logger panicked: {}", e);
        }
    }

    if tokio::time::timeout(SHUTDOWN_NOTIFY_TIMEOUT, notifier.shutdown().settled())
        .await
        .is_err()
    {
        warn!("Shutdown notification not delivered within {:?}", SHUTDOWN_NOTIFY_TIMEOUT);
    }

    info!("Agent stopped");
    Ok(())
}
