//! Engine for partitioned processors.
//!
//! The main line walks the stream at the state's head and hands every event
//! of a healthy partition to the processor. A failure stalls only that
//! partition; its later events are passed over and delivered by catch-up.
//! Both run in this one task, so every transition is applied to the latest
//! state and persisted before the next one starts.

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use streamline_events::{PartitionedState, ProcessingResult, StreamEvent};

use super::admin::AdminCommand;
use super::catchup::{catch_up, CatchUpStep};
use super::runtime::{Runtime, Wake};
use crate::event_source::FetchError;
use crate::resilience::RetryError;

enum Step {
    Persist(PartitionedState),
    Admin(AdminCommand),
    Backoff,
    Stop,
}

pub(crate) async fn run(
    rt: &Runtime,
    mut state: PartitionedState,
    admin: &mut mpsc::Receiver<AdminCommand>,
) {
    info!(
        processor = %rt.key,
        position = %state.position(),
        head = %state.head(),
        failing_partitions = state.failing_partitions().len(),
        "partitioned stream processor started"
    );

    loop {
        rt.drain_admin(&mut state, admin).await;
        if rt.cancellation.is_cancelled() {
            break;
        }

        let due = state
            .next_due_partition(rt.clock.now())
            .map(|(partition, entry)| (partition.clone(), entry.clone()));

        let step = match due {
            Some((partition, entry)) => match catch_up(rt, &state, &partition, &entry).await {
                CatchUpStep::Transition(next) => Step::Persist(next),
                CatchUpStep::Cancelled => Step::Stop,
                CatchUpStep::FetchFailed(err) => {
                    warn!(processor = %rt.key, %partition, error = %err, "fetching failing partition event failed");
                    Step::Backoff
                }
            },
            None => match main_line(rt, &state, admin).await {
                Some(step) => step,
                None => continue,
            },
        };

        match step {
            Step::Stop => break,
            Step::Admin(command) => rt.apply_admin(&mut state, command).await,
            Step::Backoff => {
                if !rt.back_off(&mut state, admin, rt.config.infrastructure_retry_delay).await {
                    break;
                }
            }
            Step::Persist(next) => match rt.persist(&next.clone().into()).await {
                Ok(()) => {
                    let floor_moved = next.position() != state.position();
                    state = next;
                    if floor_moved {
                        rt.source.release_before(state.position().stream_position).await;
                    }
                }
                Err(RetryError::Cancelled(_)) => break,
                Err(err) => {
                    // State stays as it was; the same step runs again.
                    error!(processor = %rt.key, error = %err, "persisting state failed");
                    if !rt.back_off(&mut state, admin, rt.config.infrastructure_retry_delay).await {
                        break;
                    }
                }
            },
        }
    }

    info!(
        processor = %rt.key,
        position = %state.position(),
        head = %state.head(),
        "partitioned stream processor stopped"
    );
}

/// One main-line step at the head. `None` when the engine only waited and
/// should re-evaluate.
async fn main_line(
    rt: &Runtime,
    state: &PartitionedState,
    admin: &mut mpsc::Receiver<AdminCommand>,
) -> Option<Step> {
    let head = state.head().stream_position;
    let event = match rt.fetch(head).await {
        Ok(Some(event)) => event,
        Ok(None) => {
            let retry_in = state.try_get_timespan_to_retry(rt.clock.now());
            return match rt.idle(admin, retry_in, Some(head)).await {
                Wake::Cancelled => Some(Step::Stop),
                Wake::Admin(command) => Some(Step::Admin(command)),
                Wake::Ready => None,
            };
        }
        Err(FetchError::Cancelled) => return Some(Step::Stop),
        Err(err) => {
            warn!(processor = %rt.key, position = %head, error = %err, "fetching event failed");
            return Some(Step::Backoff);
        }
    };

    if state.should_skip(&event) {
        debug!(
            processor = %rt.key,
            partition = %event.partition(),
            position = %event.processing_position(),
            "passing over event of failing partition or before skip marker"
        );
        return Some(Step::Persist(state.skip_event(&event)));
    }

    let Some(result) = rt.process(&event).await else {
        return Some(Step::Stop);
    };

    let mut next = state.with_result(&result, &event, rt.clock.now());
    if result.is_success() {
        debug!(
            processor = %rt.key,
            partition = %event.partition(),
            position = %event.processing_position(),
            "event processed"
        );
    } else {
        next = next.with_attempt_cap(event.partition(), rt.config.max_processing_attempts);
        log_failure(rt, &event, &result, &next);
    }
    Some(Step::Persist(next))
}

fn log_failure(rt: &Runtime, event: &StreamEvent, result: &ProcessingResult, next: &PartitionedState) {
    let Some(entry) = next.failing_partition(event.partition()) else {
        return;
    };
    warn!(
        processor = %rt.key,
        partition = %event.partition(),
        position = %event.processing_position(),
        reason = entry.reason(),
        retry_time = ?entry.retry_time(),
        ?result,
        "event processing failed; partition stalled"
    );
}
