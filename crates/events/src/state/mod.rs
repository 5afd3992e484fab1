//! Persisted stream processor state and its pure transitions.
//!
//! Two shapes exist: [`UnpartitionedState`] for processors that must see every
//! event strictly in order, and [`PartitionedState`] for processors where only
//! per-partition order matters and a failing partition is isolated from the rest.
//!
//! Every transition takes `&self` and returns a new value. The engines in
//! `streamline-infra` own one value per processor and persist each new one
//! before acting on it.

mod failure;
mod partitioned;
mod unpartitioned;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use streamline_core::{
    DomainError, DomainResult, EventLogSequenceNumber, PartitionId, ProcessingPosition, StreamPosition,
};

pub use failure::{Failure, RetryTime};
pub use partitioned::{FailingPartitionState, PartitionedState};
pub use unpartitioned::UnpartitionedState;

/// State of one stream processor, as stored by the state repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamProcessorState {
    Unpartitioned(UnpartitionedState),
    Partitioned(PartitionedState),
}

impl StreamProcessorState {
    /// State of a processor that has never processed anything.
    pub fn initial(partitioned: bool) -> Self {
        if partitioned {
            StreamProcessorState::Partitioned(PartitionedState::new())
        } else {
            StreamProcessorState::Unpartitioned(UnpartitionedState::new())
        }
    }

    pub fn is_partitioned(&self) -> bool {
        matches!(self, StreamProcessorState::Partitioned(_))
    }

    /// Confirmed position. For partitioned processors this is the floor.
    pub fn position(&self) -> ProcessingPosition {
        match self {
            StreamProcessorState::Unpartitioned(s) => s.position(),
            StreamProcessorState::Partitioned(s) => s.position(),
        }
    }

    /// Where a remote feed must resume so that nothing unconfirmed is lost.
    pub fn next_position_to_receive(&self) -> StreamPosition {
        self.position().stream_position
    }

    pub fn is_failing(&self) -> bool {
        match self {
            StreamProcessorState::Unpartitioned(s) => s.is_failing(),
            StreamProcessorState::Partitioned(s) => s.is_failing(),
        }
    }

    pub fn last_successfully_processed(&self) -> Option<DateTime<Utc>> {
        match self {
            StreamProcessorState::Unpartitioned(s) => s.last_successfully_processed(),
            StreamProcessorState::Partitioned(s) => s.last_successfully_processed(),
        }
    }

    pub fn skip_events_before(&self, target: EventLogSequenceNumber) -> Self {
        match self {
            StreamProcessorState::Unpartitioned(s) => {
                StreamProcessorState::Unpartitioned(s.skip_events_before(target))
            }
            StreamProcessorState::Partitioned(s) => {
                StreamProcessorState::Partitioned(s.skip_events_before(target))
            }
        }
    }

    /// Only meaningful for partitioned processors.
    pub fn remove_failing_partition(&self, partition: &PartitionId) -> DomainResult<Self> {
        match self {
            StreamProcessorState::Partitioned(s) => {
                Ok(StreamProcessorState::Partitioned(s.remove_failing_partition(partition)))
            }
            StreamProcessorState::Unpartitioned(_) => Err(DomainError::invariant(
                "cannot remove a failing partition from a non-partitioned processor",
            )),
        }
    }

    pub fn try_get_timespan_to_retry(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            StreamProcessorState::Unpartitioned(s) => s.try_get_timespan_to_retry(now),
            StreamProcessorState::Partitioned(s) => s.try_get_timespan_to_retry(now),
        }
    }

    /// Checks a loaded state for internal consistency.
    pub fn validate(&self) -> DomainResult<()> {
        match self {
            StreamProcessorState::Unpartitioned(s) => s.validate(),
            StreamProcessorState::Partitioned(s) => s.validate(),
        }
    }
}

impl From<UnpartitionedState> for StreamProcessorState {
    fn from(value: UnpartitionedState) -> Self {
        StreamProcessorState::Unpartitioned(value)
    }
}

impl From<PartitionedState> for StreamProcessorState {
    fn from(value: PartitionedState) -> Self {
        StreamProcessorState::Partitioned(value)
    }
}
