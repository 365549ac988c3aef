//! Engine configuration, loaded from TOML.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::DEFAULT_MAX_ATTEMPTS;
use crate::queue::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine settings. Every field has a default, so an empty file is valid.
///
/// ```toml
/// workers = 4
/// default_max_attempts = 3
/// store_path = "relay-tasks.json"
///
/// [retry]
/// base_delay_ms = 2000
/// multiplier = 2.0
/// max_delay_ms = 300000
///
/// [queues.invoices]
/// concurrency = 2
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent workers.
    pub workers: usize,

    pub default_max_attempts: u32,

    /// Durable store location; in-memory when absent.
    pub store_path: Option<PathBuf>,

    /// Upper bound on how long an idle worker sleeps before rescanning.
    pub poll_interval_ms: u64,

    pub retry: RetryConfig,

    /// Per-queue settings. Queues not listed here are unlimited.
    pub queues: HashMap<String, QueueConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum tasks of this queue running at once.
    pub concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            store_path: None,
            poll_interval_ms: 1000,
            retry: RetryConfig::default(),
            queues: HashMap::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "default_max_attempts must be at least 1".into(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if let Some((name, _)) = self.queues.iter().find(|(_, q)| q.concurrency == 0) {
            return Err(ConfigError::Invalid(format!(
                "queues.{name}.concurrency must be at least 1"
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.base_delay_ms),
            self.retry.multiplier,
        )
        .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn queue_limits(&self) -> HashMap<String, usize> {
        self.queues
            .iter()
            .map(|(name, q)| (name.clone(), q.concurrency))
            .collect()
    }
}
