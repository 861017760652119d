//! Relay configuration.
//!
//! Defaults match a production relay: 1 s polling, 5 min lease, retry pass
//! every minute with a 5 min cool-down, 3 retries, 16-slot hand-off queue.

use std::time::Duration;

use chrono::TimeDelta;
use thiserror::Error;

pub const ENV_POLL_INTERVAL_MS: &str = "OUTFLOW_POLL_INTERVAL_MS";
pub const ENV_LOCK_TIMEOUT_SECS: &str = "OUTFLOW_LOCK_TIMEOUT_SECS";
pub const ENV_RETRY_INTERVAL_SECS: &str = "OUTFLOW_RETRY_INTERVAL_SECS";
pub const ENV_RETRY_COOLDOWN_SECS: &str = "OUTFLOW_RETRY_COOLDOWN_SECS";
pub const ENV_MAX_RETRIES: &str = "OUTFLOW_MAX_RETRIES";
pub const ENV_QUEUE_CAPACITY: &str = "OUTFLOW_QUEUE_CAPACITY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{var}={value:?} is not a valid number")]
    InvalidNumber { var: &'static str, value: String },
}

/// Timing and sizing knobs shared by the dispatcher, projector and retry
/// scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Dispatcher tick.
    pub poll_interval: Duration,
    /// A `processing` event older than this is reclaimable.
    pub lock_timeout: Duration,
    /// Retry scheduler tick.
    pub retry_interval: Duration,
    /// Minimum age of `last_retry_at` before a failed event is requeued.
    pub retry_cooldown: Duration,
    pub max_retries: u32,
    /// Capacity of the dispatcher -> projector channel.
    pub queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(5 * 60),
            retry_interval: Duration::from_secs(60),
            retry_cooldown: Duration::from_secs(5 * 60),
            max_retries: 3,
            queue_capacity: 16,
        }
    }
}

impl RelayConfig {
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Defaults overridden by `OUTFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(var) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
            }
        };

        let mut builder = Self::builder();
        if let Some(ms) = read(ENV_POLL_INTERVAL_MS)? {
            builder = builder.poll_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = read(ENV_LOCK_TIMEOUT_SECS)? {
            builder = builder.lock_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = read(ENV_RETRY_INTERVAL_SECS)? {
            builder = builder.retry_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = read(ENV_RETRY_COOLDOWN_SECS)? {
            builder = builder.retry_cooldown(Duration::from_secs(secs));
        }
        if let Some(n) = read(ENV_MAX_RETRIES)? {
            let n = u32::try_from(n).map_err(|_| ConfigError::InvalidNumber {
                var: ENV_MAX_RETRIES,
                value: n.to_string(),
            })?;
            builder = builder.max_retries(n);
        }
        if let Some(n) = read(ENV_QUEUE_CAPACITY)? {
            let n = usize::try_from(n).map_err(|_| ConfigError::InvalidNumber {
                var: ENV_QUEUE_CAPACITY,
                value: n.to_string(),
            })?;
            builder = builder.queue_capacity(n);
        }
        builder.build()
    }

    pub fn lock_timeout_delta(&self) -> TimeDelta {
        to_delta(self.lock_timeout)
    }

    pub fn retry_cooldown_delta(&self) -> TimeDelta {
        to_delta(self.retry_cooldown)
    }

    /// Reject zero durations, zero retries and a zero-capacity queue.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("poll_interval", self.poll_interval),
            ("lock_timeout", self.lock_timeout),
            ("retry_interval", self.retry_interval),
            ("retry_cooldown", self.retry_cooldown),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Zero {
                field: "max_retries",
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "queue_capacity",
            });
        }
        Ok(())
    }
}

// Durations beyond chrono's range saturate; nothing in a relay is that old.
fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[derive(Debug, Clone, Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.config.poll_interval = value;
        self
    }

    pub fn lock_timeout(mut self, value: Duration) -> Self {
        self.config.lock_timeout = value;
        self
    }

    pub fn retry_interval(mut self, value: Duration) -> Self {
        self.config.retry_interval = value;
        self
    }

    pub fn retry_cooldown(mut self, value: Duration) -> Self {
        self.config.retry_cooldown = value;
        self
    }

    pub fn max_retries(mut self, value: u32) -> Self {
        self.config.max_retries = value;
        self
    }

    pub fn queue_capacity(mut self, value: usize) -> Self {
        self.config.queue_capacity = value;
        self
    }

    pub fn build(self) -> Result<RelayConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
