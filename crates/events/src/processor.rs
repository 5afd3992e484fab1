use streamline_core::{EventProcessorId, PartitionId};

use crate::{Cancellation, CommittedEvent, ExecutionContext, ProcessingResult};

/// A registered event processor (handler, filter or projector).
///
/// The engines hand every event of the stream to `process`, in order per
/// partition, and turn the returned [`ProcessingResult`] into persisted
/// progress or failing state.
///
/// ## Failures
///
/// Implementations report failures as values (`Failed` / `Retry`). Anything
/// that goes wrong inside the processor, including its own transport to a
/// remote handler, should be mapped to one of those results rather than
/// panicking; the engines decide when the event is handed over again.
///
/// ## Cancellation
///
/// The engines race processing against the cancellation signal and drop the
/// in-flight future when it fires. Nothing is persisted for an event whose
/// processing was cut short, so it is handed over again after a restart.
#[async_trait::async_trait]
pub trait EventProcessor: Send + Sync {
    fn identifier(&self) -> EventProcessorId;

    /// Process an event for the first time.
    async fn process(
        &self,
        event: &CommittedEvent,
        partition: &PartitionId,
        context: &ExecutionContext,
        cancellation: &Cancellation,
    ) -> ProcessingResult;

    /// Process an event that failed before.
    ///
    /// `reason` is the last failure reason and `retry_count` the number of
    /// attempts so far. Defaults to [`EventProcessor::process`].
    async fn reprocess(
        &self,
        event: &CommittedEvent,
        partition: &PartitionId,
        reason: &str,
        retry_count: u32,
        context: &ExecutionContext,
        cancellation: &Cancellation,
    ) -> ProcessingResult {
        let _ = (reason, retry_count);
        self.process(event, partition, context, cancellation).await
    }
}

#[async_trait::async_trait]
impl<P> EventProcessor for std::sync::Arc<P>
where
    P: EventProcessor + ?Sized,
{
    fn identifier(&self) -> EventProcessorId {
        (**self).identifier()
    }

    async fn process(
        &self,
        event: &CommittedEvent,
        partition: &PartitionId,
        context: &ExecutionContext,
        cancellation: &Cancellation,
    ) -> ProcessingResult {
        (**self).process(event, partition, context, cancellation).await
    }

    async fn reprocess(
        &self,
        event: &CommittedEvent,
        partition: &PartitionId,
        reason: &str,
        retry_count: u32,
        context: &ExecutionContext,
        cancellation: &Cancellation,
    ) -> ProcessingResult {
        (**self)
            .reprocess(event, partition, reason, retry_count, context, cancellation)
            .await
    }
}
