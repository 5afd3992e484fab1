//! Position model: where an event sits in the event log and in a stream, and
//! how far a processor has confirmed progress.

use serde::{Deserialize, Serialize};

/// Absolute position of an event in the append-only event log.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventLogSequenceNumber(u64);

/// Position of an event within the stream a processor consumes.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StreamPosition(u64);

macro_rules! impl_sequence {
    ($t:ident) => {
        impl $t {
            pub const START: $t = $t(0);

            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn value(self) -> u64 {
                self.0
            }

            /// The position directly after this one.
            pub const fn next(self) -> Self {
                Self(self.0.saturating_add(1))
            }
        }

        impl From<u64> for $t {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for u64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

impl_sequence!(EventLogSequenceNumber);
impl_sequence!(StreamPosition);

/// Combined (event log, stream) position.
///
/// Both components only ever increase together when an event is confirmed
/// processed. Ordering compares the stream position first since that is the
/// axis processors walk.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessingPosition {
    pub event_log_position: EventLogSequenceNumber,
    pub stream_position: StreamPosition,
}

impl ProcessingPosition {
    pub const INITIAL: ProcessingPosition = ProcessingPosition {
        event_log_position: EventLogSequenceNumber::START,
        stream_position: StreamPosition::START,
    };

    pub fn new(event_log_position: u64, stream_position: u64) -> Self {
        Self {
            event_log_position: EventLogSequenceNumber::new(event_log_position),
            stream_position: StreamPosition::new(stream_position),
        }
    }

    /// Position directly after this one on both axes.
    pub fn next(self) -> Self {
        Self {
            event_log_position: self.event_log_position.next(),
            stream_position: self.stream_position.next(),
        }
    }

    /// Same stream position, event log position raised to at least `floor`.
    pub fn with_event_log_at_least(self, floor: EventLogSequenceNumber) -> Self {
        Self {
            event_log_position: self.event_log_position.max(floor),
            stream_position: self.stream_position,
        }
    }
}

impl PartialOrd for ProcessingPosition {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProcessingPosition {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.stream_position
            .cmp(&other.stream_position)
            .then(self.event_log_position.cmp(&other.event_log_position))
    }
}

impl core::fmt::Display for ProcessingPosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {})", self.event_log_position, self.stream_position)
    }
}
