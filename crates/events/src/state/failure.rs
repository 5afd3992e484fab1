use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use streamline_core::{DomainError, DomainResult};

/// When a failing event may be handed to its processor again.
///
/// `Never` sorts after every `At` and means the failure waits for an operator
/// (`skip_events_before` / `remove_failing_partition`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum RetryTime {
    At(DateTime<Utc>),
    Never,
}

impl RetryTime {
    /// `now + timeout`; a timeout too large to represent never retries.
    pub fn after(now: DateTime<Utc>, timeout: Duration) -> Self {
        chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .map_or(RetryTime::Never, RetryTime::At)
    }

    pub fn is_never(&self) -> bool {
        matches!(self, RetryTime::Never)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self {
            RetryTime::At(at) => *at <= now,
            RetryTime::Never => false,
        }
    }

    /// Time left until the retry is due: zero when already due,
    /// `Duration::MAX` for `Never`.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self {
            RetryTime::At(at) => (*at - now).to_std().unwrap_or(Duration::ZERO),
            RetryTime::Never => Duration::MAX,
        }
    }
}

/// Details of an event that failed processing and has not been confirmed since.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    reason: String,
    retry_time: RetryTime,
    processing_attempts: u32,
    last_failed: DateTime<Utc>,
}

impl Failure {
    pub(crate) fn first(reason: &str, retry_time: RetryTime, now: DateTime<Utc>) -> Self {
        Self {
            reason: reason.to_string(),
            retry_time,
            processing_attempts: 1,
            last_failed: now,
        }
    }

    /// Another failed attempt of the same failure episode.
    pub(crate) fn again(&self, reason: &str, retry_time: RetryTime, now: DateTime<Utc>) -> Self {
        Self {
            reason: reason.to_string(),
            retry_time,
            processing_attempts: self.processing_attempts.saturating_add(1),
            last_failed: now,
        }
    }

    /// Same failure, retry due at `now`.
    pub(crate) fn due_at(&self, now: DateTime<Utc>) -> Self {
        Self {
            retry_time: RetryTime::At(now),
            ..self.clone()
        }
    }

    /// Stops automatic retries once `max_attempts` is reached.
    pub(crate) fn capped(mut self, max_attempts: Option<u32>) -> Self {
        if let Some(max) = max_attempts {
            if self.processing_attempts >= max {
                self.retry_time = RetryTime::Never;
            }
        }
        self
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn retry_time(&self) -> RetryTime {
        self.retry_time
    }

    pub fn processing_attempts(&self) -> u32 {
        self.processing_attempts
    }

    pub fn last_failed(&self) -> DateTime<Utc> {
        self.last_failed
    }

    pub(crate) fn validate(&self) -> DomainResult<()> {
        if self.processing_attempts == 0 {
            return Err(DomainError::invalid_state(
                "failure recorded with zero processing attempts",
            ));
        }
        Ok(())
    }
}
