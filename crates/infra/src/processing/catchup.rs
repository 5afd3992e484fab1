//! Catch-up of failing partitions.
//!
//! A failing partition's events are skipped by the main line. Once the
//! partition's retry time is due, catch-up hands its failing event to the
//! processor again and, on success, walks the rest of the partition's
//! backlog up to the main line's head one event per step.

use tracing::{debug, error, info, warn};

use streamline_core::PartitionId;
use streamline_events::{FailingPartitionState, PartitionedState, ProcessingResult};

use super::runtime::Runtime;
use crate::event_source::FetchError;

pub(crate) enum CatchUpStep {
    /// New state to persist.
    Transition(PartitionedState),
    FetchFailed(FetchError),
    Cancelled,
}

/// Run one catch-up step for `partition`.
pub(crate) async fn catch_up(
    rt: &Runtime,
    state: &PartitionedState,
    partition: &PartitionId,
    entry: &FailingPartitionState,
) -> CatchUpStep {
    let head = state.head().stream_position;
    let fetched = rt
        .fetch_in_partition(partition, entry.position().stream_position, head)
        .await;

    let event = match fetched {
        Ok(Some(event)) => event,
        Ok(None) => {
            info!(
                processor = %rt.key,
                %partition,
                attempts = entry.processing_attempts(),
                "partition caught up"
            );
            return CatchUpStep::Transition(state.remove_failing_partition(partition));
        }
        Err(FetchError::Cancelled) => return CatchUpStep::Cancelled,
        Err(err) => return CatchUpStep::FetchFailed(err),
    };

    debug!(
        processor = %rt.key,
        %partition,
        position = %event.processing_position(),
        attempts = entry.processing_attempts(),
        "retrying failing partition"
    );

    let Some(result) = rt
        .reprocess(&event, entry.reason(), entry.processing_attempts())
        .await
    else {
        return CatchUpStep::Cancelled;
    };

    let mut next = state.with_catchup_result(partition, &event, &result, rt.clock.now());
    if !result.is_success() {
        next = next.with_attempt_cap(partition, rt.config.max_processing_attempts);
        log_failure(rt, partition, &result, &next);
    }
    CatchUpStep::Transition(next)
}

fn log_failure(rt: &Runtime, partition: &PartitionId, result: &ProcessingResult, next: &PartitionedState) {
    let Some(entry) = next.failing_partition(partition) else {
        return;
    };
    warn!(
        processor = %rt.key,
        %partition,
        position = %entry.position(),
        reason = entry.reason(),
        attempts = entry.processing_attempts(),
        retry_time = ?entry.retry_time(),
        ?result,
        "failing partition retry failed"
    );
    if entry.retry_time().is_never() {
        error!(
            processor = %rt.key,
            %partition,
            "partition will not be retried automatically; remove it or skip past it to continue"
        );
    }
}
