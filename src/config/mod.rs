mod file_config;

pub use file_config::{
    AdminConfig, AuditConfig, FileConfig, HealthConfig, SchedulerConfig, StorageConfig,
    TransportConfig,
};

use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub storage_dir: Option<PathBuf>,
    pub workers: usize,
    pub max_retries: u32,
    pub check_interval_secs: u64,
    pub admin_ids: Vec<i64>,
    pub probe_url: Option<String>,
    pub webhook_url: Option<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_dir: None,
            storage_dir: None,
            workers: SchedulerSettings::default().workers,
            max_retries: SchedulerSettings::default().max_retries,
            check_interval_secs: HealthSettings::default().check_interval_secs,
            admin_ids: Vec::new(),
            probe_url: None,
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,

    pub scheduler: SchedulerSettings,
    pub health: HealthSettings,
    pub admin_recipients: Vec<i64>,
    pub transport: TransportSettings,
    pub storage: StorageSettings,
    pub audit: AuditSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let scheduler_file = file.scheduler.unwrap_or_default();
        let scheduler = SchedulerSettings {
            workers: scheduler_file.workers.unwrap_or(cli.workers),
            max_retries: scheduler_file.max_retries.unwrap_or(cli.max_retries),
            shutdown_timeout_secs: scheduler_file.shutdown_timeout_secs.unwrap_or(30),
            rescan_interval_secs: scheduler_file.rescan_interval_secs.unwrap_or(60),
        };
        if scheduler.workers == 0 {
            bail!("scheduler.workers must be at least 1");
        }

        let health_file = file.health.unwrap_or_default();
        let health = HealthSettings {
            check_interval_secs: health_file
                .check_interval_secs
                .unwrap_or(cli.check_interval_secs),
            max_retries: health_file.max_retries.unwrap_or(10),
            failure_threshold: health_file.failure_threshold.unwrap_or(3),
        };
        if health.check_interval_secs == 0 {
            bail!("health.check_interval_secs must be at least 1");
        }

        let admin_recipients = file
            .admin
            .and_then(|admin| admin.recipients)
            .unwrap_or_else(|| cli.admin_ids.clone());

        let transport_file = file.transport.unwrap_or_default();
        let transport = TransportSettings {
            probe_url: transport_file.probe_url.or_else(|| cli.probe_url.clone()),
            webhook_url: transport_file
                .webhook_url
                .or_else(|| cli.webhook_url.clone()),
            timeout_secs: transport_file.timeout_secs.unwrap_or(10),
        };

        let local_base_dir = file
            .storage
            .and_then(|storage| storage.local_base_dir)
            .map(PathBuf::from)
            .or_else(|| cli.storage_dir.clone())
            .unwrap_or_else(|| db_dir.join("files"));
        if local_base_dir.exists() && !local_base_dir.is_dir() {
            bail!("Storage base is not a directory: {:?}", local_base_dir);
        }

        let audit_file = file.audit.unwrap_or_default();
        let audit = AuditSettings {
            enabled: audit_file.enabled.unwrap_or(true),
            buffer: audit_file.buffer.unwrap_or(256).max(1),
        };

        Ok(Self {
            db_dir,
            scheduler,
            health,
            admin_recipients,
            transport,
            storage: StorageSettings { local_base_dir },
            audit,
        })
    }

    pub fn task_db_path(&self) -> PathBuf {
        self.db_dir.join("tasks.db")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Maximum number of tasks running at once.
    pub workers: usize,
    /// Retries granted to each task after its first failed attempt.
    pub max_retries: u32,
    /// How long shutdown waits for running workers.
    pub shutdown_timeout_secs: u64,
    /// Period of the store rescan picking up externally enqueued tasks.
    /// Zero disables it.
    pub rescan_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            max_retries: 2,
            shutdown_timeout_secs: 30,
            rescan_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSettings {
    pub check_interval_secs: u64,
    /// Reconnection attempts per failure episode.
    pub max_retries: u32,
    /// Consecutive probe failures that start a failure episode.
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            max_retries: 10,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub probe_url: Option<String>,
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub local_base_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSettings {
    pub enabled: bool,
    /// Capacity of the event channel feeding the audit log.
    pub buffer: usize,
}
