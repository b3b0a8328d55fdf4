//! Pipeline configuration loading and representation.
//!
//! Every option has a default; `SECX_*` environment variables override them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use secx_core::RetryPolicy;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tuning knobs for retries, timeouts, and cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Dispatch attempts per job before it fails for good
    pub max_attempts: u32,
    /// Backoff base: a retry waits `backoff_base * 2^attempt_count`
    pub backoff_base: Duration,
    /// Backoff cap
    pub backoff_cap: Duration,
    /// How long a worker blocks waiting for a message
    pub lease_timeout: Duration,
    /// Bound on one extractor call
    pub extraction_timeout: Duration,
    /// Time between scheduler sweeps
    pub scheduler_interval: Duration,
    /// Non-terminal jobs untouched for this long are recovered by the sweep
    pub stall_timeout: Duration,
    /// Requeue delay after a store/broker failure
    pub infra_retry_delay: Duration,
    /// Worker threads per process
    pub worker_count: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(60 * 60),
            lease_timeout: Duration::from_millis(5_000),
            extraction_timeout: Duration::from_secs(10 * 60),
            scheduler_interval: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(2 * 60 * 60),
            infra_retry_delay: Duration::from_millis(1_000),
            worker_count: 4,
        }
    }
}

impl PipelineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let number = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(var) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
            }
        };

        let config = Self {
            max_attempts: match number("SECX_MAX_ATTEMPTS")? {
                Some(n) => u32::try_from(n).map_err(|_| {
                    ConfigError::Invalid(format!("SECX_MAX_ATTEMPTS out of range: {n}"))
                })?,
                None => defaults.max_attempts,
            },
            backoff_base: number("SECX_BACKOFF_BASE_SECS")?
                .map_or(defaults.backoff_base, Duration::from_secs),
            backoff_cap: number("SECX_BACKOFF_CAP_SECS")?
                .map_or(defaults.backoff_cap, Duration::from_secs),
            lease_timeout: number("SECX_LEASE_TIMEOUT_MS")?
                .map_or(defaults.lease_timeout, Duration::from_millis),
            extraction_timeout: number("SECX_EXTRACTION_TIMEOUT_SECS")?
                .map_or(defaults.extraction_timeout, Duration::from_secs),
            scheduler_interval: number("SECX_SCHEDULER_INTERVAL_SECS")?
                .map_or(defaults.scheduler_interval, Duration::from_secs),
            stall_timeout: number("SECX_STALL_TIMEOUT_SECS")?
                .map_or(defaults.stall_timeout, Duration::from_secs),
            infra_retry_delay: number("SECX_INFRA_RETRY_DELAY_MS")?
                .map_or(defaults.infra_retry_delay, Duration::from_millis),
            worker_count: number("SECX_WORKERS")?.map_or(defaults.worker_count, |n| n as usize),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if i32::try_from(self.max_attempts).is_err() {
            return Err(ConfigError::Invalid(format!(
                "max_attempts must not exceed {}",
                i32::MAX
            )));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(ConfigError::Invalid(
                "backoff_base must not exceed backoff_cap".into(),
            ));
        }
        if self.lease_timeout.is_zero() {
            return Err(ConfigError::Invalid("lease_timeout must be positive".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.stall_timeout <= self.extraction_timeout {
            return Err(ConfigError::Invalid(
                "stall_timeout must exceed extraction_timeout".into(),
            ));
        }
        if self.stall_timeout <= self.backoff_cap {
            return Err(ConfigError::Invalid(
                "stall_timeout must exceed backoff_cap".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_base, self.backoff_cap)
    }
}
