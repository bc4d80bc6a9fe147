//! Pipeline configuration.
//!
//! All values are plain data supplied at construction time. They can be
//! built in code with the `with_*` methods, read from `PIPELINE_*`
//! environment variables, or loaded from a YAML file in which durations are
//! given in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::retry::RetryPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file is not valid YAML for this schema.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of concurrent workers draining the queue.
    pub worker_count: usize,
    /// Maximum entries waiting in the queue; 0 means unbounded.
    pub queue_capacity: usize,
    /// Maximum external call attempts in flight across all workers.
    pub call_concurrency: usize,
    /// Deadline for one external call attempt.
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay between a failed attempt and the next one.
    #[serde(rename = "retry_backoff_ms", with = "millis")]
    pub retry_backoff: Duration,
    /// Pause before each item admission by the producer.
    #[serde(rename = "ingest_interval_ms", with = "millis")]
    pub ingest_interval: Duration,
    /// Period of progress log lines; disabled when `None`.
    #[serde(rename = "progress_interval_ms", with = "optional_millis")]
    pub progress_interval: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            queue_capacity: 4,
            call_concurrency: 2,
            call_timeout: Duration::from_secs(4),
            max_retries: 2,
            retry_backoff: Duration::from_secs(1),
            ingest_interval: Duration::ZERO,
            progress_interval: None,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PIPELINE_WORKER_COUNT`: Number of workers (default: 3)
    /// - `PIPELINE_QUEUE_CAPACITY`: Queue capacity, 0 for unbounded (default: 4)
    /// - `PIPELINE_CALL_CONCURRENCY`: Concurrent call limit (default: 2)
    /// - `PIPELINE_CALL_TIMEOUT_MS`: Per-attempt timeout (default: 4000)
    /// - `PIPELINE_MAX_RETRIES`: Retries after the first attempt (default: 2)
    /// - `PIPELINE_RETRY_BACKOFF_MS`: Backoff between attempts (default: 1000)
    /// - `PIPELINE_INGEST_INTERVAL_MS`: Producer pacing (default: 0)
    /// - `PIPELINE_PROGRESS_INTERVAL_MS`: Progress log period (default: off)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, parsed or validated.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from YAML text without validating it.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Renders the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Applies any `PIPELINE_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("PIPELINE_WORKER_COUNT") {
            self.worker_count = parse_env_value(&val, "PIPELINE_WORKER_COUNT")?;
        }

        if let Some(val) = lookup("PIPELINE_QUEUE_CAPACITY") {
            self.queue_capacity = parse_env_value(&val, "PIPELINE_QUEUE_CAPACITY")?;
        }

        if let Some(val) = lookup("PIPELINE_CALL_CONCURRENCY") {
            self.call_concurrency = parse_env_value(&val, "PIPELINE_CALL_CONCURRENCY")?;
        }

        if let Some(val) = lookup("PIPELINE_CALL_TIMEOUT_MS") {
            self.call_timeout = parse_env_millis(&val, "PIPELINE_CALL_TIMEOUT_MS")?;
        }

        if let Some(val) = lookup("PIPELINE_MAX_RETRIES") {
            self.max_retries = parse_env_value(&val, "PIPELINE_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("PIPELINE_RETRY_BACKOFF_MS") {
            self.retry_backoff = parse_env_millis(&val, "PIPELINE_RETRY_BACKOFF_MS")?;
        }

        if let Some(val) = lookup("PIPELINE_INGEST_INTERVAL_MS") {
            self.ingest_interval = parse_env_millis(&val, "PIPELINE_INGEST_INTERVAL_MS")?;
        }

        if let Some(val) = lookup("PIPELINE_PROGRESS_INTERVAL_MS") {
            let interval = parse_env_millis(&val, "PIPELINE_PROGRESS_INTERVAL_MS")?;
            self.progress_interval = (!interval.is_zero()).then_some(interval);
        }

        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_count must be greater than 0".to_string(),
            ));
        }

        if self.call_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "call_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.call_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "call_timeout must be greater than 0".to_string(),
            ));
        }

        if self.progress_interval.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "progress_interval must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Timeout and retry settings for the external call stage.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.call_timeout, self.max_retries, self.retry_backoff)
    }

    /// Builder method to set the worker count.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Builder method to set the queue capacity (0 = unbounded).
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Builder method to set the concurrent call limit.
    pub fn with_call_concurrency(mut self, limit: usize) -> Self {
        self.call_concurrency = limit;
        self
    }

    /// Builder method to set the per-attempt timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Builder method to set the retry count.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder method to set the retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Builder method to set the producer pacing.
    pub fn with_ingest_interval(mut self, interval: Duration) -> Self {
        self.ingest_interval = interval;
        self
    }

    /// Builder method to enable periodic progress logging.
    pub fn with_progress_interval(mut self, interval: Option<Duration>) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding milliseconds.
fn parse_env_millis(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_millis)
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
