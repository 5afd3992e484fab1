use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use streamline_core::{DomainResult, EventLogSequenceNumber, ProcessingPosition};

use super::failure::{Failure, RetryTime};
use crate::{ProcessingResult, StreamEvent};

/// Progress of a non-partitioned stream processor.
///
/// While `failure` is set the processor is failing and `position` does not
/// move: the event at `position` is retried until it succeeds or an operator
/// skips past it. `is_failing() == (processing_attempts() > 0)` holds by
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnpartitionedState {
    position: ProcessingPosition,
    failure: Option<Failure>,
    last_successfully_processed: Option<DateTime<Utc>>,
}

impl UnpartitionedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A healthy state at `position`.
    pub fn at(position: ProcessingPosition) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    pub fn position(&self) -> ProcessingPosition {
        self.position
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn is_failing(&self) -> bool {
        self.failure.is_some()
    }

    pub fn processing_attempts(&self) -> u32 {
        self.failure.as_ref().map_or(0, Failure::processing_attempts)
    }

    pub fn failure_reason(&self) -> &str {
        self.failure.as_ref().map_or("", Failure::reason)
    }

    pub fn retry_time(&self) -> Option<RetryTime> {
        self.failure.as_ref().map(Failure::retry_time)
    }

    pub fn last_successfully_processed(&self) -> Option<DateTime<Utc>> {
        self.last_successfully_processed
    }

    /// Apply the outcome of processing `event` (the event at `position`).
    ///
    /// Success moves to the position after the event and clears any failure.
    /// Failure keeps the position and records another attempt.
    pub fn with_result(
        &self,
        result: &ProcessingResult,
        event: &StreamEvent,
        now: DateTime<Utc>,
    ) -> Self {
        match result.failure(now) {
            None => Self {
                position: event
                    .next_processing_position()
                    .with_event_log_at_least(self.position.event_log_position),
                failure: None,
                last_successfully_processed: Some(now),
            },
            Some((reason, retry_time)) => Self {
                position: self.position,
                failure: Some(match &self.failure {
                    Some(previous) => previous.again(reason, retry_time, now),
                    None => Failure::first(reason, retry_time, now),
                }),
                last_successfully_processed: self.last_successfully_processed,
            },
        }
    }

    /// Whether `event` lies before the skip marker and must be passed over
    /// without processing.
    pub fn should_skip(&self, event: &StreamEvent) -> bool {
        event.event().event_log_sequence_number() < self.position.event_log_position
    }

    /// Pass over `event` without processing it.
    pub fn skip_event(&self, event: &StreamEvent) -> Self {
        Self {
            position: event
                .next_processing_position()
                .with_event_log_at_least(self.position.event_log_position),
            failure: None,
            last_successfully_processed: self.last_successfully_processed,
        }
    }

    /// Discard every event whose event log position is below `target`.
    ///
    /// Never rewinds: a target at or below the current event log position is
    /// a no-op. Skipping past the failing event clears the failure. The stream
    /// position is untouched; events below the marker are passed over as the
    /// processor reaches them.
    pub fn skip_events_before(&self, target: EventLogSequenceNumber) -> Self {
        if target <= self.position.event_log_position {
            return self.clone();
        }
        Self {
            position: self.position.with_event_log_at_least(target),
            failure: None,
            last_successfully_processed: self.last_successfully_processed,
        }
    }

    /// Stop automatic retries once the failure reached `max_attempts`.
    pub fn with_attempt_cap(mut self, max_attempts: Option<u32>) -> Self {
        self.failure = self.failure.map(|f| f.capped(max_attempts));
        self
    }

    /// `None` when not failing, otherwise the time left until the retry is
    /// due (zero if already due, `Duration::MAX` if it never is).
    pub fn try_get_timespan_to_retry(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.failure.as_ref().map(|f| f.retry_time().remaining(now))
    }

    pub(crate) fn validate(&self) -> DomainResult<()> {
        match &self.failure {
            Some(failure) => failure.validate(),
            None => Ok(()),
        }
    }
}
