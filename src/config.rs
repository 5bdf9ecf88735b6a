//! TOML configuration parsing and validation.
//!
//! Every section carries serde defaults, so a file containing only `[db]`
//! is a complete configuration. Retry limits, backoff curve and the
//! reconciler interval are all tunables here rather than constants.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lease_poll_timeout_ms")]
    pub lease_poll_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_depth: default_max_depth(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_poll_timeout_ms: default_lease_poll_timeout_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_visibility_timeout_secs() -> u64 {
    30
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_max_depth() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_lease_poll_timeout_ms() -> u64 {
    2_000
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_poll_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub extract: usize,
    #[serde(default = "default_worker_count")]
    pub index: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_idle_backoff_max_ms")]
    pub idle_backoff_max_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            extract: default_worker_count(),
            index: default_worker_count(),
            max_in_flight: default_max_in_flight(),
            idle_backoff_max_ms: default_idle_backoff_max_ms(),
        }
    }
}

fn default_worker_count() -> usize {
    2
}
fn default_max_in_flight() -> usize {
    8
}
fn default_idle_backoff_max_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_extract_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_object_root")]
    pub object_root: PathBuf,
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_extract_timeout_secs(),
            object_root: default_object_root(),
            max_source_bytes: default_max_source_bytes(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_extract_timeout_secs() -> u64 {
    30
}
fn default_object_root() -> PathBuf {
    PathBuf::from("./data/objects")
}
fn default_max_source_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_http_timeout_secs() -> u64 {
    15
}

impl ExtractionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    #[serde(default = "default_index_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_index_timeout_secs(),
        }
    }
}

fn default_index_timeout_secs() -> u64 {
    10
}

impl IndexerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_reconcile_batch_size")]
    pub batch_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            batch_size: default_reconcile_batch_size(),
        }
    }
}

fn default_reconcile_interval_secs() -> u64 {
    300
}
fn default_reconcile_batch_size() -> usize {
    500
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_relay_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_relay_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: default_relay_batch_size(),
            interval_ms: default_relay_interval_ms(),
        }
    }
}

fn default_relay_batch_size() -> i64 {
    100
}
fn default_relay_interval_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Configuration with defaults everywhere except the database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: path.into(),
                max_connections: default_max_connections(),
            },
            queue: QueueConfig::default(),
            workers: WorkersConfig::default(),
            extraction: ExtractionConfig::default(),
            indexer: IndexerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            relay: RelayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.max_attempts == 0 {
            anyhow::bail!("queue.max_attempts must be >= 1");
        }
        if self.queue.backoff_base_ms > self.queue.backoff_max_ms {
            anyhow::bail!("queue.backoff_base_ms must be <= queue.backoff_max_ms");
        }
        if self.queue.visibility_timeout_secs == 0 {
            anyhow::bail!("queue.visibility_timeout_secs must be > 0");
        }
        if self.queue.max_depth == 0 {
            anyhow::bail!("queue.max_depth must be > 0");
        }
        if self.workers.max_in_flight == 0 {
            anyhow::bail!("workers.max_in_flight must be > 0");
        }
        if self.extraction.timeout_secs == 0 || self.indexer.timeout_secs == 0 {
            anyhow::bail!("extraction.timeout_secs and indexer.timeout_secs must be > 0");
        }
        if self.reconciler.interval_secs == 0 {
            anyhow::bail!("reconciler.interval_secs must be > 0");
        }
        if self.relay.batch_size < 1 || self.relay.interval_ms == 0 {
            anyhow::bail!("relay.batch_size and relay.interval_ms must be > 0");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
