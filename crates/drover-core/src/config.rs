//! File configuration (YAML).
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! in-memory, priority-aging setup.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::DroverError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for DroverError {
    fn from(err: ConfigError) -> Self {
        DroverError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroverConfig {
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
}

impl DroverConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: DroverConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.collection.trim().is_empty() {
            return Err(ConfigError::Invalid("store.collection must not be empty".into()));
        }
        if self.store.kind == StoreKind::Redis && self.store.redis_url.trim().is_empty() {
            return Err(ConfigError::Invalid("store.redis_url is required for redis".into()));
        }
        if !self.broker.aging_factor.is_finite() || self.broker.aging_factor < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "broker.aging_factor must be a finite non-negative number, got {}",
                self.broker.aging_factor
            )));
        }
        if self.broker.rescore_interval_ms == 0 {
            return Err(ConfigError::Invalid("broker.rescore_interval_ms must be > 0".into()));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid("worker.concurrency must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub redis_url: String,
    /// Key of the sorted set (priority) or list (fifo).
    pub collection: String,
    /// Server-side timeout of one blocking pop; bounds cancellation latency.
    pub block_timeout_ms: u64,
}

impl StoreConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            collection: "tasks".to_string(),
            block_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerStrategy {
    Fifo,
    #[default]
    PriorityAging,
}

impl BrokerStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            BrokerStrategy::Fifo => "fifo",
            BrokerStrategy::PriorityAging => "priority_aging",
        }
    }
}

impl fmt::Display for BrokerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fifo" => Ok(BrokerStrategy::Fifo),
            "priority_aging" | "priority" => Ok(BrokerStrategy::PriorityAging),
            _ => Err(ConfigError::Invalid(format!("unknown broker strategy: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub strategy: BrokerStrategy,
    /// Priority gained per second of waiting.
    pub aging_factor: f64,
    pub rescore_interval_ms: u64,
}

impl BrokerConfig {
    pub fn rescore_interval(&self) -> Duration {
        Duration::from_millis(self.rescore_interval_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            strategy: BrokerStrategy::PriorityAging,
            aging_factor: 0.1,
            rescore_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub id: String,
    pub concurrency: usize,
    pub shutdown_grace_ms: u64,
    pub error_backoff_ms: u64,
}

impl WorkerConfig {
    pub const DEFAULT_CONCURRENCY: usize = 5;
    pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(2_000);
    pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_millis(500);

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: format!("worker-{}", std::process::id()),
            concurrency: Self::DEFAULT_CONCURRENCY,
            shutdown_grace_ms: Self::DEFAULT_SHUTDOWN_GRACE.as_millis() as u64,
            error_backoff_ms: Self::DEFAULT_ERROR_BACKOFF.as_millis() as u64,
        }
    }
}
