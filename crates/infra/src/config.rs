//! Configuration for stream processors and Event Horizon subscriptions.
//!
//! Both structs deserialize with defaults for missing fields so they can be
//! embedded in a host's configuration file, and `from_env` overlays
//! `STREAMLINE_*` environment variables on top of the defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamProcessorConfig {
    /// Attempts after which a failing event (or partition) is no longer
    /// retried automatically. `None` retries as long as the processor asks.
    pub max_processing_attempts: Option<u32>,
    /// Longest wait for a new event before the source is polled again.
    pub event_wait_timeout: Duration,
    /// Delay before retrying an event whose new state could not be persisted,
    /// or a fetch that failed.
    pub infrastructure_retry_delay: Duration,
    /// Policy for persisting state.
    pub persistence_policy: RetryPolicy,
    /// Pending operator commands per running processor.
    pub admin_queue_capacity: usize,
}

impl Default for StreamProcessorConfig {
    fn default() -> Self {
        Self {
            max_processing_attempts: None,
            event_wait_timeout: Duration::from_secs(60),
            infrastructure_retry_delay: Duration::from_secs(5),
            persistence_policy: RetryPolicy::exponential(
                5,
                Duration::from_millis(100),
                Duration::from_secs(5),
            ),
            admin_queue_capacity: 16,
        }
    }
}

impl StreamProcessorConfig {
    pub fn with_max_processing_attempts(mut self, max: u32) -> Self {
        self.max_processing_attempts = Some(max);
        self
    }

    pub fn with_event_wait_timeout(mut self, timeout: Duration) -> Self {
        self.event_wait_timeout = timeout;
        self
    }

    pub fn with_infrastructure_retry_delay(mut self, delay: Duration) -> Self {
        self.infrastructure_retry_delay = delay;
        self
    }

    pub fn with_persistence_policy(mut self, policy: RetryPolicy) -> Self {
        self.persistence_policy = policy;
        self
    }

    /// Defaults overlaid with:
    /// - `STREAMLINE_MAX_PROCESSING_ATTEMPTS`
    /// - `STREAMLINE_EVENT_WAIT_TIMEOUT_MS`
    /// - `STREAMLINE_INFRASTRUCTURE_RETRY_DELAY_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(max) = parse_var::<u32>(&lookup, "STREAMLINE_MAX_PROCESSING_ATTEMPTS")? {
            config.max_processing_attempts = Some(max);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "STREAMLINE_EVENT_WAIT_TIMEOUT_MS")? {
            config.event_wait_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "STREAMLINE_INFRASTRUCTURE_RETRY_DELAY_MS")? {
            config.infrastructure_retry_delay = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventHorizonConfig {
    /// Received events buffered between the connection and the processor.
    pub queue_capacity: usize,
    /// Backoff between reconnect attempts. Should never give up.
    pub reconnect_policy: RetryPolicy,
}

impl Default for EventHorizonConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            reconnect_policy: RetryPolicy::forever(Duration::from_secs(1), Duration::from_secs(60)),
        }
    }
}

impl EventHorizonConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Defaults overlaid with:
    /// - `STREAMLINE_EVENT_HORIZON_QUEUE_CAPACITY`
    /// - `STREAMLINE_EVENT_HORIZON_RECONNECT_MAX_DELAY_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(capacity) = parse_var::<usize>(&lookup, "STREAMLINE_EVENT_HORIZON_QUEUE_CAPACITY")? {
            if capacity == 0 {
                return Err(ConfigError::Invalid {
                    var: "STREAMLINE_EVENT_HORIZON_QUEUE_CAPACITY",
                    value: capacity.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config.queue_capacity = capacity;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "STREAMLINE_EVENT_HORIZON_RECONNECT_MAX_DELAY_MS")? {
            config.reconnect_policy.max_delay = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
    }
}
