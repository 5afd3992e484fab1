//! Resilience policy for infrastructure calls.
//!
//! Processing failures reported by an event processor never go through here;
//! they are values handled by the state model. This module covers calls that
//! fail for infrastructure reasons: persisting state, fetching events,
//! (re)connecting to a producer microservice.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use streamline_events::Cancellation;

/// Decides how long to wait before the next attempt of a failed operation.
pub trait ResiliencePolicy: Send + Sync + Debug {
    /// Delay before attempt `failures + 1`, or `None` to give up.
    ///
    /// `failures` is 1 after the first failed attempt.
    fn next_delay(&self, failures: u32) -> Option<Duration>;
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries (`None` = retry forever)
    pub max_attempts: Option<u32>,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(0),
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Exponential backoff that never gives up. Used for reconnect loops.
    pub fn forever(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: None,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter so that delays are reproducible in tests.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if more retries are allowed after `failures` failed attempts.
    pub fn should_retry(&self, failures: u32) -> bool {
        self.max_attempts.is_none_or(|max| failures <= max)
    }
}

impl ResiliencePolicy for RetryPolicy {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        self.should_retry(failures)
            .then(|| self.delay_for_attempt(failures))
    }
}

/// Failure of an operation run under a [`ResiliencePolicy`].
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("{operation} failed: {source}")]
    Permanent {
        operation: &'static str,
        #[source]
        source: E,
    },

    #[error("{0} cancelled")]
    Cancelled(&'static str),
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled(_))
    }
}

/// Run `op` until it succeeds, the policy gives up, or `cancellation` fires.
///
/// Waiting between attempts is cancellable; an attempt in flight is dropped
/// when cancellation fires.
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &dyn ResiliencePolicy,
    cancellation: &Cancellation,
    operation: &'static str,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Display + 'static,
{
    retry_transient(policy, cancellation, operation, |_| true, op).await
}

/// Like [`retry_with_policy`], but only errors `is_transient` accepts are
/// retried. Any other error ends the operation at once with
/// [`RetryError::Permanent`].
pub async fn retry_transient<T, E, F, Fut, P>(
    policy: &dyn ResiliencePolicy,
    cancellation: &Cancellation,
    operation: &'static str,
    is_transient: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::error::Error + Display + 'static,
{
    let mut failures = 0u32;
    loop {
        if cancellation.is_cancelled() {
            return Err(RetryError::Cancelled(operation));
        }

        let outcome = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(RetryError::Cancelled(operation)),
            outcome = op() => outcome,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => err,
            Err(source) => return Err(RetryError::Permanent { operation, source }),
        };

        failures = failures.saturating_add(1);
        let Some(delay) = policy.next_delay(failures) else {
            return Err(RetryError::Exhausted {
                operation,
                attempts: failures,
                source: err,
            });
        };

        warn!(
            operation,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "operation failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(RetryError::Cancelled(operation)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
