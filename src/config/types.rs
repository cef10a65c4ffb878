//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::ConfigError;
use crate::core::retry::{FixedDelayRetry, RetryPolicy};

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Clock loop quantum in milliseconds.
    pub tick_interval_ms: u64,
    /// How long `shutdown` waits for in-flight executions.
    pub shutdown_timeout_secs: u64,
    /// Policy for the stock fixed-delay retry provider.
    pub retry: Option<RetryPolicy>,
    /// Worker queue settings.
    pub worker_queue: WorkerQueueConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            shutdown_timeout_secs: 30,
            retry: None,
            worker_queue: WorkerQueueConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.worker_queue.max_batch == 0 {
            return Err(ConfigError::Invalid(
                "worker_queue.max_batch must be greater than zero".to_string(),
            ));
        }
        if self.worker_queue.item_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "worker_queue.item_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// The stock retry provider for the configured policy, if retries are
    /// enabled. Jobs share it by returning it from `Job::retry_provider`.
    pub fn retry_provider(&self) -> Option<FixedDelayRetry> {
        self.retry
            .as_ref()
            .filter(|policy| policy.is_enabled())
            .map(|policy| FixedDelayRetry::new(policy.clone()))
    }
}

/// Worker queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerQueueConfig {
    /// Items taken per drain.
    pub max_batch: usize,
    /// Per-item timeout; unset means items may run indefinitely.
    pub item_timeout_secs: Option<u64>,
}

impl Default for WorkerQueueConfig {
    fn default() -> Self {
        Self {
            max_batch: 16,
            item_timeout_secs: None,
        }
    }
}

impl WorkerQueueConfig {
    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout_secs.map(Duration::from_secs)
    }
}
