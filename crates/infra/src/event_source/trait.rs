use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use streamline_core::{PartitionId, StreamPosition};
use streamline_events::{Cancellation, StreamEvent};

/// Event source operation error.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("event source unavailable: {0}")]
    Unavailable(String),

    #[error("malformed event at {position}: {reason}")]
    Malformed {
        position: StreamPosition,
        reason: String,
    },

    #[error("fetch cancelled")]
    Cancelled,
}

/// Read side of the stream a processor consumes.
///
/// ## Semantics
///
/// - `fetch(p)` returns the event at stream position `p`, or `None` when the
///   stream has not reached `p` yet.
/// - `fetch_in_partition(partition, from, until)` returns the first event of
///   `partition` in `[from, until)`. Catch-up uses it to walk a failing
///   partition's backlog up to the main line's head without touching other
///   partitions. `None` means the partition has no event in that range.
/// - `wait_for_event(p, timeout, ..)` returns once an event at `p` may be
///   available, or after `timeout`. Spurious wake-ups are allowed; callers
///   always fetch again.
/// - `release_before(p)` tells the source that events before `p` are
///   confirmed for good. Sources that buffer may drop them.
///
/// Events are never modified once visible: fetching the same position twice
/// returns the same event.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch(&self, position: StreamPosition) -> Result<Option<StreamEvent>, FetchError>;

    async fn fetch_in_partition(
        &self,
        partition: &PartitionId,
        from: StreamPosition,
        until: StreamPosition,
    ) -> Result<Option<StreamEvent>, FetchError>;

    async fn wait_for_event(
        &self,
        position: StreamPosition,
        timeout: Duration,
        cancellation: &Cancellation,
    ) -> Result<(), FetchError>;

    async fn release_before(&self, position: StreamPosition) {
        let _ = position;
    }
}

#[async_trait::async_trait]
impl<S> EventSource for Arc<S>
where
    S: EventSource + ?Sized,
{
    async fn fetch(&self, position: StreamPosition) -> Result<Option<StreamEvent>, FetchError> {
        (**self).fetch(position).await
    }

    async fn fetch_in_partition(
        &self,
        partition: &PartitionId,
        from: StreamPosition,
        until: StreamPosition,
    ) -> Result<Option<StreamEvent>, FetchError> {
        (**self).fetch_in_partition(partition, from, until).await
    }

    async fn wait_for_event(
        &self,
        position: StreamPosition,
        timeout: Duration,
        cancellation: &Cancellation,
    ) -> Result<(), FetchError> {
        (**self).wait_for_event(position, timeout, cancellation).await
    }

    async fn release_before(&self, position: StreamPosition) {
        (**self).release_before(position).await
    }
}
