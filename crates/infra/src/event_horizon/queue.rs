//! Bounded queue between a connection and the processor consuming from it.
//!
//! Both ends race against a cancellation signal, so a producer blocked on a
//! full queue is released when the consumer side is torn down.

use thiserror::Error;
use tokio::sync::mpsc;

use streamline_events::{Cancellation, StreamEvent};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue operation cancelled")]
    Cancelled,

    #[error("queue closed")]
    Closed,
}

/// Create a queue holding at most `capacity` events.
pub fn event_queue(capacity: usize) -> (EventQueueWriter, EventQueueReader) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (EventQueueWriter { sender }, EventQueueReader { receiver })
}

#[derive(Debug, Clone)]
pub struct EventQueueWriter {
    sender: mpsc::Sender<StreamEvent>,
}

impl EventQueueWriter {
    /// Wait for room and enqueue `event`.
    pub async fn enqueue(&self, event: StreamEvent, cancellation: &Cancellation) -> Result<(), QueueError> {
        if cancellation.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(QueueError::Cancelled),
            sent = self.sender.send(event) => sent.map_err(|_| QueueError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug)]
pub struct EventQueueReader {
    receiver: mpsc::Receiver<StreamEvent>,
}

impl EventQueueReader {
    /// Wait for the next event.
    pub async fn dequeue(&mut self, cancellation: &Cancellation) -> Result<StreamEvent, QueueError> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(QueueError::Cancelled),
            received = self.receiver.recv() => received.ok_or(QueueError::Closed),
        }
    }

    /// The next event if one is queued.
    pub fn try_dequeue(&mut self) -> Result<Option<StreamEvent>, QueueError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(QueueError::Closed),
        }
    }
}
