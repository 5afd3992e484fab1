use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use streamline_core::{DomainError, DomainResult, EventLogSequenceNumber, PartitionId, ProcessingPosition};

use super::failure::{Failure, RetryTime};
use crate::{ProcessingResult, StreamEvent};

/// A partition that stopped receiving new events because one of them failed.
///
/// `position` is the event being retried. The partition's later events up to
/// the main line's head are delivered by catch-up once it succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingPartitionState {
    position: ProcessingPosition,
    failure: Failure,
}

impl FailingPartitionState {
    pub fn position(&self) -> ProcessingPosition {
        self.position
    }

    pub fn failure(&self) -> &Failure {
        &self.failure
    }

    pub fn reason(&self) -> &str {
        self.failure.reason()
    }

    pub fn retry_time(&self) -> RetryTime {
        self.failure.retry_time()
    }

    pub fn processing_attempts(&self) -> u32 {
        self.failure.processing_attempts()
    }
}

/// Progress of a partitioned stream processor.
///
/// Fields:
/// - `position`: the floor. Every event below it is confirmed in every
///   partition. Always `min(head, failing positions)`.
/// - `head`: next position the main line fetches. Events between the floor
///   and the head in healthy partitions are confirmed and not re-delivered.
/// - `failing_partitions`: stalled partitions. Absence means healthy.
///
/// Transitions return new values; nothing is mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionedState {
    position: ProcessingPosition,
    head: ProcessingPosition,
    failing_partitions: BTreeMap<PartitionId, FailingPartitionState>,
    last_successfully_processed: Option<DateTime<Utc>>,
}

impl PartitionedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A healthy state with both floor and head at `position`.
    pub fn at(position: ProcessingPosition) -> Self {
        Self {
            position,
            head: position,
            ..Self::default()
        }
    }

    pub fn position(&self) -> ProcessingPosition {
        self.position
    }

    pub fn head(&self) -> ProcessingPosition {
        self.head
    }

    pub fn failing_partitions(&self) -> &BTreeMap<PartitionId, FailingPartitionState> {
        &self.failing_partitions
    }

    pub fn failing_partition(&self, partition: &PartitionId) -> Option<&FailingPartitionState> {
        self.failing_partitions.get(partition)
    }

    pub fn is_failing(&self) -> bool {
        !self.failing_partitions.is_empty()
    }

    pub fn last_successfully_processed(&self) -> Option<DateTime<Utc>> {
        self.last_successfully_processed
    }

    /// Whether new work for `partition` at `position` must be held back.
    pub fn is_partition_failing_at(&self, partition: &PartitionId, position: ProcessingPosition) -> bool {
        self.failing_partitions
            .get(partition)
            .is_some_and(|entry| entry.position <= position)
    }

    /// Whether the main line must pass over `event` without processing it:
    /// it lies before the skip marker, or its partition is stalled.
    pub fn should_skip(&self, event: &StreamEvent) -> bool {
        event.event().event_log_sequence_number() < self.head.event_log_position
            || self.is_partition_failing_at(event.partition(), event.processing_position())
    }

    /// Apply the main line's outcome for `event` (the event at `head`).
    ///
    /// The head always moves past the event. A failure stalls the event's
    /// partition at the event; other partitions are not touched.
    pub fn with_result(
        &self,
        result: &ProcessingResult,
        event: &StreamEvent,
        now: DateTime<Utc>,
    ) -> Self {
        let head = self.head_after(event);
        match result.failure(now) {
            None => self.rebuild(head, self.failing_partitions.clone(), Some(now)),
            Some((reason, retry_time)) => {
                let mut failing = self.failing_partitions.clone();
                let failure = match failing.get(event.partition()) {
                    Some(entry) => entry.failure.again(reason, retry_time, now),
                    None => Failure::first(reason, retry_time, now),
                };
                failing.insert(
                    event.partition().clone(),
                    FailingPartitionState {
                        position: event.processing_position(),
                        failure,
                    },
                );
                self.rebuild(head, failing, self.last_successfully_processed)
            }
        }
    }

    /// Move the main line past `event` without processing it.
    pub fn skip_event(&self, event: &StreamEvent) -> Self {
        self.rebuild(
            self.head_after(event),
            self.failing_partitions.clone(),
            self.last_successfully_processed,
        )
    }

    /// Apply catch-up's outcome for `event` of the failing `partition`.
    ///
    /// Success moves the entry past the event with the next retry due at
    /// once, so the partition's backlog drains in order. Failure keeps the
    /// entry on the event and records another attempt. Unknown partitions are
    /// left alone.
    pub fn with_catchup_result(
        &self,
        partition: &PartitionId,
        event: &StreamEvent,
        result: &ProcessingResult,
        now: DateTime<Utc>,
    ) -> Self {
        let Some(entry) = self.failing_partitions.get(partition) else {
            return self.clone();
        };

        let mut failing = self.failing_partitions.clone();
        let (updated, last_success) = match result.failure(now) {
            None => (
                FailingPartitionState {
                    position: event.next_processing_position(),
                    failure: entry.failure.due_at(now),
                },
                Some(now),
            ),
            Some((reason, retry_time)) => (
                FailingPartitionState {
                    position: event.processing_position(),
                    failure: entry.failure.again(reason, retry_time, now),
                },
                self.last_successfully_processed,
            ),
        };
        failing.insert(partition.clone(), updated);
        self.rebuild(self.head, failing, last_success)
    }

    /// Drop `partition`'s failing entry. Used both when catch-up has no more
    /// backlog for it and by operators.
    pub fn remove_failing_partition(&self, partition: &PartitionId) -> Self {
        if !self.failing_partitions.contains_key(partition) {
            return self.clone();
        }
        let mut failing = self.failing_partitions.clone();
        failing.remove(partition);
        self.rebuild(self.head, failing, self.last_successfully_processed)
    }

    /// Clear every failing partition and raise the skip marker to `target`.
    ///
    /// The marker never moves backward and the head's stream position is
    /// untouched. With no failing partition left the floor is the head, so
    /// the stalled backlog between the old floor and the head is dropped.
    pub fn skip_events_before(&self, target: EventLogSequenceNumber) -> Self {
        self.rebuild(
            self.head.with_event_log_at_least(target),
            BTreeMap::new(),
            self.last_successfully_processed,
        )
    }

    /// Stop automatic retries of `partition` once it reached `max_attempts`.
    ///
    /// Applied after a failed attempt only. A partition draining its backlog
    /// after a successful retry keeps its attempt count but stays due.
    pub fn with_attempt_cap(mut self, partition: &PartitionId, max_attempts: Option<u32>) -> Self {
        if let Some(entry) = self.failing_partitions.get_mut(partition) {
            entry.failure = entry.failure.clone().capped(max_attempts);
        }
        self
    }

    /// The failing partition catch-up should retry now: earliest retry time
    /// first, then lowest position.
    pub fn next_due_partition(
        &self,
        now: DateTime<Utc>,
    ) -> Option<(&PartitionId, &FailingPartitionState)> {
        self.failing_partitions
            .iter()
            .filter(|(_, entry)| entry.retry_time().is_due(now))
            .min_by_key(|(_, entry)| (entry.retry_time(), entry.position))
    }

    /// Earliest retry time over all failing partitions.
    pub fn next_retry_time(&self) -> Option<RetryTime> {
        self.failing_partitions.values().map(|e| e.retry_time()).min()
    }

    pub fn try_get_timespan_to_retry(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_retry_time().map(|t| t.remaining(now))
    }

    /// Rebuild a state from its persisted parts, deriving the floor.
    pub fn from_parts(
        head: ProcessingPosition,
        failing_partitions: BTreeMap<PartitionId, FailingPartitionState>,
        last_successfully_processed: Option<DateTime<Utc>>,
    ) -> DomainResult<Self> {
        let state = Self {
            position: floor(head, &failing_partitions),
            head,
            failing_partitions,
            last_successfully_processed,
        };
        state.validate()?;
        Ok(state)
    }

    pub(crate) fn validate(&self) -> DomainResult<()> {
        for (partition, entry) in &self.failing_partitions {
            entry.failure.validate()?;
            if entry.position.stream_position > self.head.stream_position {
                return Err(DomainError::invalid_state(format!(
                    "failing partition {partition} at {} is ahead of head {}",
                    entry.position, self.head
                )));
            }
        }
        let expected = floor(self.head, &self.failing_partitions);
        if self.position != expected {
            return Err(DomainError::invalid_state(format!(
                "position {} does not match derived floor {expected}",
                self.position
            )));
        }
        Ok(())
    }

    fn head_after(&self, event: &StreamEvent) -> ProcessingPosition {
        event
            .next_processing_position()
            .with_event_log_at_least(self.head.event_log_position)
            .max(self.head)
    }

    fn rebuild(
        &self,
        head: ProcessingPosition,
        failing_partitions: BTreeMap<PartitionId, FailingPartitionState>,
        last_successfully_processed: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            position: floor(head, &failing_partitions),
            head,
            failing_partitions,
            last_successfully_processed,
        }
    }
}

fn floor(
    head: ProcessingPosition,
    failing_partitions: &BTreeMap<PartitionId, FailingPartitionState>,
) -> ProcessingPosition {
    failing_partitions
        .values()
        .map(|entry| entry.position)
        .fold(head, ProcessingPosition::min)
}
