use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::state::RetryTime;

/// Outcome of handing one event (in one partition) to an event processor.
///
/// Processing failures are values, never errors: the state model turns them
/// into failing state with a retry time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// The event was processed.
    Succeeded,
    /// The processor asks for this exact event to be retried after `timeout`
    /// (transient or backpressure signal detected by the processor itself).
    Retry { reason: String, timeout: Duration },
    /// Processing failed. When `retry` is false no automatic retry is ever
    /// scheduled and the failure needs an operator.
    Failed {
        reason: String,
        retry: bool,
        timeout: Duration,
    },
}

impl ProcessingResult {
    pub fn retry(reason: impl Into<String>, timeout: Duration) -> Self {
        Self::Retry {
            reason: reason.into(),
            timeout,
        }
    }

    pub fn failed(reason: impl Into<String>, retry: bool, timeout: Duration) -> Self {
        Self::Failed {
            reason: reason.into(),
            retry,
            timeout,
        }
    }

    /// A failure that must never be retried automatically.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::failed(reason, false, Duration::ZERO)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingResult::Succeeded)
    }

    /// Failure reason and the time the event may be retried, `None` on success.
    pub fn failure(&self, now: DateTime<Utc>) -> Option<(&str, RetryTime)> {
        match self {
            ProcessingResult::Succeeded => None,
            ProcessingResult::Retry { reason, timeout } => {
                Some((reason.as_str(), RetryTime::after(now, *timeout)))
            }
            ProcessingResult::Failed {
                reason,
                retry: true,
                timeout,
            } => Some((reason.as_str(), RetryTime::after(now, *timeout))),
            ProcessingResult::Failed {
                reason,
                retry: false,
                ..
            } => Some((reason.as_str(), RetryTime::Never)),
        }
    }
}
