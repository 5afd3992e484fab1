use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;

use streamline_core::{EventLogSequenceNumber, PartitionId, StreamId, StreamPosition};
use streamline_events::{Cancellation, CommittedEvent, StreamEvent};

use super::r#trait::{EventSource, FetchError};

/// In-memory stream.
///
/// Intended for tests/dev. Appends assign consecutive stream positions and
/// event log sequence numbers and wake up waiting processors.
#[derive(Debug)]
pub struct InMemoryEventSource {
    stream_id: StreamId,
    partitioned: bool,
    events: RwLock<Vec<StreamEvent>>,
    notify: Notify,
}

impl InMemoryEventSource {
    pub fn new(stream_id: StreamId, partitioned: bool) -> Self {
        Self {
            stream_id,
            partitioned,
            events: RwLock::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Append an event with the next event log sequence number.
    pub fn append(&self, event_type: &str, partition: impl Into<PartitionId>, content: JsonValue) -> StreamEvent {
        let partition = partition.into();
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        let next_log = events
            .last()
            .map(|e| e.event().event_log_sequence_number().next())
            .unwrap_or(EventLogSequenceNumber::START);
        let committed = CommittedEvent::new(
            next_log,
            Utc::now(),
            partition.as_str(),
            event_type,
            false,
            content,
        );
        let stream_event = self.stream_event(committed, events.len(), partition);
        events.push(stream_event.clone());
        drop(events);

        self.notify.notify_waiters();
        stream_event
    }

    /// Append an already committed event, keeping its event log sequence
    /// number. Used to model streams that are a filtered view of the log.
    pub fn append_committed(&self, committed: CommittedEvent, partition: impl Into<PartitionId>) -> StreamEvent {
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        let stream_event = self.stream_event(committed, events.len(), partition.into());
        events.push(stream_event.clone());
        drop(events);

        self.notify.notify_waiters();
        stream_event
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stream_event(&self, committed: CommittedEvent, index: usize, partition: PartitionId) -> StreamEvent {
        StreamEvent::new(
            committed,
            StreamPosition::new(index as u64),
            self.stream_id,
            partition,
            self.partitioned,
        )
    }

    fn has_event_at(&self, position: StreamPosition) -> bool {
        (self.len() as u64) > position.value()
    }
}

#[async_trait::async_trait]
impl EventSource for InMemoryEventSource {
    async fn fetch(&self, position: StreamPosition) -> Result<Option<StreamEvent>, FetchError> {
        let events = self
            .events
            .read()
            .map_err(|_| FetchError::Unavailable("lock poisoned".to_string()))?;
        Ok(usize::try_from(position.value())
            .ok()
            .and_then(|index| events.get(index))
            .cloned())
    }

    async fn fetch_in_partition(
        &self,
        partition: &PartitionId,
        from: StreamPosition,
        until: StreamPosition,
    ) -> Result<Option<StreamEvent>, FetchError> {
        let events = self
            .events
            .read()
            .map_err(|_| FetchError::Unavailable("lock poisoned".to_string()))?;
        let start = usize::try_from(from.value()).unwrap_or(usize::MAX);
        Ok(events
            .iter()
            .skip(start)
            .take_while(|e| e.position() < until)
            .find(|e| e.partition() == partition)
            .cloned())
    }

    async fn wait_for_event(
        &self,
        position: StreamPosition,
        timeout: Duration,
        cancellation: &Cancellation,
    ) -> Result<(), FetchError> {
        let appended = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.has_event_at(position) {
                    return;
                }
                notified.await;
            }
        };

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(FetchError::Cancelled),
            _ = appended => Ok(()),
            _ = tokio::time::sleep(timeout) => Ok(()),
        }
    }
}
