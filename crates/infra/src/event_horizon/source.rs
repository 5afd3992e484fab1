//! Event source over the events received from a producer.
//!
//! Received events are buffered by stream position so the partitioned engine
//! can walk a failing partition's backlog after the main line has moved on.
//! The buffer holds at most `capacity` events. Events are only pulled from
//! the queue when a requested position has not been received yet, so a
//! producer running ahead of the processor blocks on the bounded queue.
//!
//! When the buffer is full, events the main line has already passed are
//! dropped oldest first. A backlog lookup that reaches below the dropped
//! events ends the session, and the subscription reconnects from the
//! persisted floor so the producer sends them again.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use streamline_core::{PartitionId, StreamPosition};
use streamline_events::{Cancellation, StreamEvent};

use super::queue::{EventQueueReader, QueueError};
use crate::event_source::{EventSource, FetchError};

#[derive(Debug)]
struct Buffer {
    events: BTreeMap<StreamPosition, StreamEvent>,
    capacity: usize,
    released_before: StreamPosition,
    /// Every received event at or above this position is still buffered.
    retained_from: StreamPosition,
    /// One past the highest position received.
    received_until: StreamPosition,
    closed: bool,
}

impl Buffer {
    /// Whether one more event fits, possibly by dropping one below `evict_below`.
    fn has_room(&self, evict_below: StreamPosition) -> bool {
        self.events.len() < self.capacity
            || self
                .events
                .first_key_value()
                .is_some_and(|(oldest, _)| *oldest < evict_below)
    }

    fn accept(&mut self, event: StreamEvent, evict_below: StreamPosition) {
        let position = event.position();
        if position < self.released_before || self.events.contains_key(&position) {
            debug!(%position, "dropping event that was already received");
            return;
        }
        if self.events.len() >= self.capacity {
            if let Some((oldest, _)) = self.events.pop_first() {
                debug_assert!(oldest < evict_below);
                debug!(position = %oldest, "dropping passed event to stay within buffer capacity");
                self.retained_from = self.retained_from.max(oldest.next());
            }
        }
        self.received_until = self.received_until.max(position.next());
        self.events.insert(position, event);
    }
}

#[derive(Debug)]
pub struct EventHorizonEventSource {
    buffer: Mutex<Buffer>,
    reader: AsyncMutex<EventQueueReader>,
    cancellation: Cancellation,
}

impl EventHorizonEventSource {
    /// Source for a connection that streams from `from` onwards, buffering
    /// at most `capacity` events. Cancelling `cancellation` ends the session.
    pub fn new(reader: EventQueueReader, from: StreamPosition, capacity: usize, cancellation: Cancellation) -> Self {
        Self {
            buffer: Mutex::new(Buffer {
                events: BTreeMap::new(),
                capacity: capacity.max(1),
                released_before: from,
                retained_from: from,
                received_until: from,
                closed: false,
            }),
            reader: AsyncMutex::new(reader),
            cancellation,
        }
    }

    /// Number of buffered events.
    pub fn buffered(&self) -> usize {
        self.buffer().events.len()
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move queued events into the buffer until `position` has been
    /// received, the queue is empty or the buffer is full.
    fn pull_until(&self, reader: &mut EventQueueReader, position: StreamPosition, evict_below: StreamPosition) {
        loop {
            {
                let buffer = self.buffer();
                if buffer.received_until > position || buffer.closed || !buffer.has_room(evict_below) {
                    return;
                }
            }
            match reader.try_dequeue() {
                Ok(Some(event)) => self.buffer().accept(event, evict_below),
                Ok(None) => return,
                Err(_) => {
                    self.buffer().closed = true;
                    return;
                }
            }
        }
    }

    /// Receive one more event. `false` once nothing more will arrive.
    async fn receive(&self, reader: &mut EventQueueReader, evict_below: StreamPosition) -> Result<bool, FetchError> {
        match reader.dequeue(&self.cancellation).await {
            Ok(event) => {
                self.buffer().accept(event, evict_below);
                Ok(true)
            }
            Err(QueueError::Cancelled) => Err(FetchError::Cancelled),
            Err(QueueError::Closed) => {
                self.buffer().closed = true;
                Ok(false)
            }
        }
    }
}

#[async_trait::async_trait]
impl EventSource for EventHorizonEventSource {
    async fn fetch(&self, position: StreamPosition) -> Result<Option<StreamEvent>, FetchError> {
        let buffered = self.buffer().events.get(&position).cloned();
        if buffered.is_some() {
            return Ok(buffered);
        }
        let mut reader = self.reader.lock().await;
        self.pull_until(&mut reader, position, position);
        Ok(self.buffer().events.get(&position).cloned())
    }

    /// Waits until the partition's next event before `until` has been
    /// received, since the producer resends the backlog after a reconnect.
    async fn fetch_in_partition(
        &self,
        partition: &PartitionId,
        from: StreamPosition,
        until: StreamPosition,
    ) -> Result<Option<StreamEvent>, FetchError> {
        if from >= until {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        if from < self.buffer().retained_from {
            warn!(
                %partition,
                %from,
                "partition backlog is no longer buffered, reconnecting to receive it again"
            );
            self.cancellation.cancel();
            return Err(FetchError::Unavailable(
                "partition backlog was dropped from the buffer".to_string(),
            ));
        }

        loop {
            {
                let buffer = self.buffer();
                let scanned_until = buffer.received_until.min(until);
                if from < scanned_until {
                    let found = buffer
                        .events
                        .range(from..scanned_until)
                        .map(|(_, event)| event)
                        .find(|event| event.partition() == partition);
                    if let Some(event) = found {
                        return Ok(Some(event.clone()));
                    }
                }
                if buffer.received_until >= until {
                    return Ok(None);
                }
                if buffer.closed {
                    return Err(FetchError::Unavailable("connection to producer closed".to_string()));
                }
                // Everything buffered below `until` belongs to other partitions.
                if !buffer.has_room(until) {
                    return Err(FetchError::Unavailable("event buffer is full".to_string()));
                }
            }
            if !self.receive(&mut reader, until).await? {
                return Err(FetchError::Unavailable("connection to producer closed".to_string()));
            }
        }
    }

    async fn wait_for_event(
        &self,
        position: StreamPosition,
        timeout: Duration,
        cancellation: &Cancellation,
    ) -> Result<(), FetchError> {
        let mut reader = self.reader.lock().await;
        self.pull_until(&mut reader, position, position);
        let room = {
            let buffer = self.buffer();
            if buffer.events.contains_key(&position) {
                return Ok(());
            }
            if buffer.closed {
                return Err(FetchError::Unavailable("connection to producer closed".to_string()));
            }
            buffer.has_room(position)
        };

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(FetchError::Cancelled),
            received = self.receive(&mut reader, position), if room => received.map(|_| ()),
            _ = tokio::time::sleep(timeout) => Ok(()),
        }
    }

    async fn release_before(&self, position: StreamPosition) {
        let mut buffer = self.buffer();
        if position <= buffer.released_before {
            return;
        }
        buffer.events = buffer.events.split_off(&position);
        buffer.released_before = position;
        buffer.retained_from = buffer.retained_from.max(position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use streamline_core::{EventLogSequenceNumber, StreamId};
    use streamline_events::CommittedEvent;

    use crate::event_horizon::queue::event_queue;

    fn event(position: u64, partition: &str) -> StreamEvent {
        StreamEvent::new(
            CommittedEvent::new(
                EventLogSequenceNumber::new(position + 100),
                Utc::now(),
                partition,
                "e",
                true,
                serde_json::json!({}),
            ),
            StreamPosition::new(position),
            StreamId::new(),
            PartitionId::from(partition),
            true,
        )
    }

    #[tokio::test]
    async fn buffers_received_events_until_released() {
        let (writer, reader) = event_queue(8);
        let cancellation = Cancellation::new();
        let source = EventHorizonEventSource::new(reader, StreamPosition::new(3), 8, cancellation.clone());

        for position in 2..6 {
            writer.enqueue(event(position, "A"), &cancellation).await.unwrap();
        }

        assert!(source.fetch(StreamPosition::new(2)).await.unwrap().is_none());
        assert!(source.fetch(StreamPosition::new(5)).await.unwrap().is_some());
        assert_eq!(source.buffered(), 3);

        source.release_before(StreamPosition::new(5)).await;
        assert!(source.fetch(StreamPosition::new(4)).await.unwrap().is_none());
        assert_eq!(source.buffered(), 1);
    }

    #[tokio::test]
    async fn partition_lookup_waits_for_the_backlog() {
        let (writer, reader) = event_queue(8);
        let cancellation = Cancellation::new();
        let source = EventHorizonEventSource::new(reader, StreamPosition::START, 8, cancellation.clone());

        let feed = {
            let cancellation = cancellation.clone();
            tokio::spawn(async move {
                for (position, partition) in [(0, "A"), (1, "B"), (2, "B"), (3, "A")] {
                    writer.enqueue(event(position, partition), &cancellation).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let b = source
            .fetch_in_partition(&PartitionId::from("B"), StreamPosition::new(2), StreamPosition::new(4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.position(), StreamPosition::new(2));
        feed.await.unwrap();

        assert!(source
            .fetch_in_partition(&PartitionId::from("A"), StreamPosition::new(1), StreamPosition::new(3))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_is_reported_while_waiting() {
        let (writer, reader) = event_queue(1);
        let source = EventHorizonEventSource::new(reader, StreamPosition::START, 8, Cancellation::new());
        drop(writer);

        let err = source
            .wait_for_event(StreamPosition::START, Duration::from_secs(60), &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unavailable(_)));
    }

    #[tokio::test]
    async fn buffer_stays_bounded_while_the_floor_is_stuck() {
        let (writer, reader) = event_queue(2);
        let cancellation = Cancellation::new();
        let source = EventHorizonEventSource::new(reader, StreamPosition::START, 4, cancellation.clone());

        let feed = {
            let cancellation = cancellation.clone();
            tokio::spawn(async move {
                for position in 0..1000 {
                    if writer.enqueue(event(position, "A"), &cancellation).await.is_err() {
                        return position;
                    }
                }
                1000
            })
        };

        // The main line walks 200 events while nothing is released.
        for position in 0..200 {
            let position = StreamPosition::new(position);
            while source.fetch(position).await.unwrap().is_none() {
                source
                    .wait_for_event(position, Duration::from_secs(5), &Cancellation::new())
                    .await
                    .unwrap();
            }
            assert!(source.buffered() <= 4, "buffered {} events", source.buffered());
        }

        cancellation.cancel();
        let enqueued = feed.await.unwrap();
        assert!(enqueued < 1000);
    }

    #[tokio::test]
    async fn dropped_backlog_ends_the_session() {
        let (writer, reader) = event_queue(8);
        let session = Cancellation::new();
        let source = EventHorizonEventSource::new(reader, StreamPosition::START, 2, session.clone());

        for (position, partition) in [(0, "A"), (1, "B"), (2, "B"), (3, "B")] {
            writer.enqueue(event(position, partition), &Cancellation::new()).await.unwrap();
        }
        for position in 0..4 {
            assert!(source.fetch(StreamPosition::new(position)).await.unwrap().is_some());
        }
        assert_eq!(source.buffered(), 2);

        let err = source
            .fetch_in_partition(&PartitionId::from("A"), StreamPosition::START, StreamPosition::new(4))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Unavailable(_)));
        assert!(session.is_cancelled());
    }
}
