//! Engine for non-partitioned processors.
//!
//! Events are handed over strictly in stream order. A failing event blocks
//! the stream until it succeeds or an operator skips past it.

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use streamline_core::ProcessingPosition;
use streamline_events::{ProcessingResult, StreamProcessorState, UnpartitionedState};

use super::admin::AdminCommand;
use super::runtime::{Runtime, Wake};
use crate::event_source::FetchError;
use crate::resilience::RetryError;

pub(crate) async fn run(
    rt: &Runtime,
    mut state: UnpartitionedState,
    admin: &mut mpsc::Receiver<AdminCommand>,
) {
    info!(
        processor = %rt.key,
        position = %state.position(),
        failing = state.is_failing(),
        "linear stream processor started"
    );

    loop {
        rt.drain_admin(&mut state, admin).await;
        if rt.cancellation.is_cancelled() {
            break;
        }

        if let Some(wait) = state.try_get_timespan_to_retry(rt.clock.now()) {
            if !wait.is_zero() {
                match rt.idle(admin, Some(wait), None).await {
                    Wake::Cancelled => break,
                    Wake::Admin(command) => rt.apply_admin(&mut state, command).await,
                    Wake::Ready => {}
                }
                continue;
            }
        }

        let position = state.position().stream_position;
        let event = match rt.fetch(position).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                match rt.idle(admin, None, Some(position)).await {
                    Wake::Cancelled => break,
                    Wake::Admin(command) => rt.apply_admin(&mut state, command).await,
                    Wake::Ready => {}
                }
                continue;
            }
            Err(FetchError::Cancelled) => break,
            Err(err) => {
                warn!(processor = %rt.key, %position, error = %err, "fetching event failed");
                match rt.idle(admin, Some(rt.config.infrastructure_retry_delay), None).await {
                    Wake::Cancelled => break,
                    Wake::Admin(command) => rt.apply_admin(&mut state, command).await,
                    Wake::Ready => {}
                }
                continue;
            }
        };

        if state.should_skip(&event) {
            let next = state.skip_event(&event);
            debug!(processor = %rt.key, position = %event.processing_position(), "skipping event before skip marker");
            match rt.persist(&next.clone().into()).await {
                Ok(()) => state = next,
                Err(RetryError::Cancelled(_)) => break,
                Err(err) => {
                    error!(processor = %rt.key, error = %err, "persisting skipped event failed");
                    if !rt.back_off(&mut state, admin, rt.config.infrastructure_retry_delay).await {
                        break;
                    }
                }
            }
            continue;
        }

        let result = match state.failure() {
            Some(failure) => {
                rt.reprocess(&event, failure.reason(), failure.processing_attempts())
                    .await
            }
            None => rt.process(&event).await,
        };
        let Some(result) = result else {
            break;
        };

        let now = rt.clock.now();
        let next = state
            .with_result(&result, &event, now)
            .with_attempt_cap(rt.config.max_processing_attempts);
        log_result(rt, event.processing_position(), &result, &next);

        let persisted: StreamProcessorState = next.clone().into();
        match rt.persist(&persisted).await {
            Ok(()) => {
                state = next;
                rt.source.release_before(state.position().stream_position).await;
            }
            Err(RetryError::Cancelled(_)) => break,
            Err(err) => {
                // Not persisted: stay on the event and retry it like a failure.
                error!(processor = %rt.key, error = %err, "persisting state failed");
                let retry = ProcessingResult::retry(
                    format!("persisting state failed: {err}"),
                    rt.config.infrastructure_retry_delay,
                );
                state = state.with_result(&retry, &event, now);
            }
        }
    }

    info!(processor = %rt.key, position = %state.position(), "linear stream processor stopped");
}

fn log_result(rt: &Runtime, position: ProcessingPosition, result: &ProcessingResult, next: &UnpartitionedState) {
    match result {
        ProcessingResult::Succeeded => {
            debug!(processor = %rt.key, %position, "event processed");
        }
        _ => {
            warn!(
                processor = %rt.key,
                %position,
                reason = next.failure_reason(),
                attempts = next.processing_attempts(),
                retry_time = ?next.retry_time(),
                "event processing failed"
            );
            if next.retry_time().is_some_and(|t| t.is_never()) {
                error!(
                    processor = %rt.key,
                    %position,
                    "event will not be retried automatically; skip it to continue"
                );
            }
        }
    }
}
