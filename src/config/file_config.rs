use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,

    // Feature configs
    pub scheduler: Option<SchedulerConfig>,
    pub health: Option<HealthConfig>,
    pub admin: Option<AdminConfig>,
    pub transport: Option<TransportConfig>,
    pub storage: Option<StorageConfig>,
    pub audit: Option<AuditConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub shutdown_timeout_secs: Option<u64>,
    pub rescan_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub failure_threshold: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AdminConfig {
    /// Operator chat ids receiving status messages.
    pub recipients: Option<Vec<i64>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct TransportConfig {
    pub probe_url: Option<String>,
    pub webhook_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub local_base_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: Option<bool>,
    pub buffer: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
