use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use streamline_core::{EventLogSequenceNumber, PartitionId, ProcessingPosition, StreamId, StreamPosition};

/// An event committed to the append-only event log.
///
/// Notes:
/// - `event_log_sequence_number` is the event's absolute position in the log.
/// - `content` is the domain-agnostic event payload.
/// - `public` events may be consumed by other microservices over the Event Horizon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEvent {
    event_log_sequence_number: EventLogSequenceNumber,
    occurred: DateTime<Utc>,
    event_source: String,
    event_type: String,
    public: bool,
    content: JsonValue,
}

impl CommittedEvent {
    pub fn new(
        event_log_sequence_number: EventLogSequenceNumber,
        occurred: DateTime<Utc>,
        event_source: impl Into<String>,
        event_type: impl Into<String>,
        public: bool,
        content: JsonValue,
    ) -> Self {
        Self {
            event_log_sequence_number,
            occurred,
            event_source: event_source.into(),
            event_type: event_type.into(),
            public,
            content,
        }
    }

    pub fn event_log_sequence_number(&self) -> EventLogSequenceNumber {
        self.event_log_sequence_number
    }

    pub fn occurred(&self) -> DateTime<Utc> {
        self.occurred
    }

    pub fn event_source(&self) -> &str {
        &self.event_source
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn content(&self) -> &JsonValue {
        &self.content
    }
}

/// A committed event as it appears in a particular stream.
///
/// This is the unit processors consume: the committed event plus its position
/// in the stream and the partition it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    event: CommittedEvent,
    position: StreamPosition,
    stream_id: StreamId,
    partition: PartitionId,
    partitioned: bool,
}

impl StreamEvent {
    pub fn new(
        event: CommittedEvent,
        position: StreamPosition,
        stream_id: StreamId,
        partition: PartitionId,
        partitioned: bool,
    ) -> Self {
        Self {
            event,
            position,
            stream_id,
            partition,
            partitioned,
        }
    }

    pub fn event(&self) -> &CommittedEvent {
        &self.event
    }

    pub fn into_event(self) -> CommittedEvent {
        self.event
    }

    pub fn position(&self) -> StreamPosition {
        self.position
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    /// Where this event sits on both axes.
    pub fn processing_position(&self) -> ProcessingPosition {
        ProcessingPosition {
            event_log_position: self.event.event_log_sequence_number(),
            stream_position: self.position,
        }
    }

    /// The position a processor reaches once this event is confirmed processed.
    pub fn next_processing_position(&self) -> ProcessingPosition {
        self.processing_position().next()
    }
}
