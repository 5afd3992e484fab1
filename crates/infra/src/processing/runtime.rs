//! What a running processor task works with, shared by both engines.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use streamline_core::{PartitionId, ProcessorKey, StreamPosition};
use streamline_events::{
    Cancellation, EventProcessor, ExecutionContext, ProcessingResult, StreamEvent, StreamProcessorState,
};

use super::admin::{AdminCommand, AdminTarget};
use super::error::AdminError;
use crate::clock::Clock;
use crate::config::StreamProcessorConfig;
use crate::event_source::{EventSource, FetchError};
use crate::resilience::{retry_transient, RetryError};
use crate::state_store::{RepositoryError, StreamProcessorStateRepository};

pub(crate) struct Runtime {
    pub key: ProcessorKey,
    pub source: Arc<dyn EventSource>,
    pub processor: Arc<dyn EventProcessor>,
    pub repository: Arc<dyn StreamProcessorStateRepository>,
    pub clock: Arc<dyn Clock>,
    pub config: StreamProcessorConfig,
    pub context: ExecutionContext,
    pub cancellation: Cancellation,
}

/// Why an engine woke up from a suspension point.
pub(crate) enum Wake {
    Cancelled,
    Admin(AdminCommand),
    Ready,
}

impl Runtime {
    /// Persist `state` under the persistence policy.
    ///
    /// When cancelled, one last uncancellable attempt is made so a computed
    /// transition survives shutdown; `Cancelled` is still returned.
    pub async fn persist(&self, state: &StreamProcessorState) -> Result<(), RetryError<RepositoryError>> {
        let repository = &self.repository;
        let key = &self.key;
        let outcome = retry_transient(
            &self.config.persistence_policy,
            &self.cancellation,
            "persist_state",
            RepositoryError::is_transient,
            move || repository.persist(key, state),
        )
        .await;

        if let Err(RetryError::Cancelled(_)) = &outcome {
            if let Err(err) = self.repository.persist(&self.key, state).await {
                warn!(processor = %self.key, error = %err, "state computed before shutdown was not persisted");
            }
        }
        outcome
    }

    pub async fn fetch(&self, position: StreamPosition) -> Result<Option<StreamEvent>, FetchError> {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(FetchError::Cancelled),
            fetched = self.source.fetch(position) => fetched,
        }
    }

    pub async fn fetch_in_partition(
        &self,
        partition: &PartitionId,
        from: StreamPosition,
        until: StreamPosition,
    ) -> Result<Option<StreamEvent>, FetchError> {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(FetchError::Cancelled),
            fetched = self.source.fetch_in_partition(partition, from, until) => fetched,
        }
    }

    /// Hand `event` to the processor for the first time. `None` if cancelled.
    pub async fn process(&self, event: &StreamEvent) -> Option<ProcessingResult> {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => None,
            result = self.processor.process(
                event.event(),
                event.partition(),
                &self.context,
                &self.cancellation,
            ) => Some(result),
        }
    }

    /// Hand a previously failed `event` to the processor again. `None` if cancelled.
    pub async fn reprocess(&self, event: &StreamEvent, reason: &str, attempts: u32) -> Option<ProcessingResult> {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => None,
            result = self.processor.reprocess(
                event.event(),
                event.partition(),
                reason,
                attempts,
                &self.context,
                &self.cancellation,
            ) => Some(result),
        }
    }

    /// Suspend until cancelled, an operator command arrives, `until` elapses,
    /// or (when `event_at` is set) an event at that position may be available.
    pub async fn idle(
        &self,
        admin: &mut mpsc::Receiver<AdminCommand>,
        until: Option<Duration>,
        event_at: Option<StreamPosition>,
    ) -> Wake {
        let timer = async {
            match until {
                Some(delay) if delay != Duration::MAX => tokio::time::sleep(delay).await,
                _ => std::future::pending::<()>().await,
            }
        };
        let event = async {
            let Some(position) = event_at else {
                return std::future::pending::<()>().await;
            };
            match self
                .source
                .wait_for_event(position, self.config.event_wait_timeout, &self.cancellation)
                .await
            {
                Ok(()) => {}
                Err(FetchError::Cancelled) => std::future::pending::<()>().await,
                Err(err) => {
                    warn!(processor = %self.key, error = %err, "waiting for events failed");
                    tokio::time::sleep(self.config.infrastructure_retry_delay).await;
                }
            }
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Wake::Cancelled,
            Some(command) = admin.recv() => Wake::Admin(command),
            _ = timer => Wake::Ready,
            _ = event => Wake::Ready,
        }
    }

    /// Wait out `delay`, applying an operator command that arrives meanwhile.
    /// `false` when cancelled.
    pub async fn back_off<S: AdminTarget>(
        &self,
        state: &mut S,
        admin: &mut mpsc::Receiver<AdminCommand>,
        delay: Duration,
    ) -> bool {
        match self.idle(admin, Some(delay), None).await {
            Wake::Cancelled => false,
            Wake::Admin(command) => {
                self.apply_admin(state, command).await;
                true
            }
            Wake::Ready => true,
        }
    }

    /// Apply an operator command to the engine's state, persisting it first.
    pub async fn apply_admin<S: AdminTarget>(&self, state: &mut S, command: AdminCommand) {
        let AdminCommand { operation, reply } = command;
        let outcome = match state.apply_admin(&operation) {
            Err(err) => Err(AdminError::from(err)),
            Ok(next) => {
                let persisted: StreamProcessorState = next.clone().into();
                match self.persist(&persisted).await {
                    Ok(()) => {
                        info!(
                            processor = %self.key,
                            %operation,
                            position = %persisted.position(),
                            "applied operator command"
                        );
                        *state = next;
                        Ok(persisted)
                    }
                    Err(err) => Err(AdminError::Persist(err)),
                }
            }
        };
        let _ = reply.send(outcome);
    }

    pub async fn drain_admin<S: AdminTarget>(&self, state: &mut S, admin: &mut mpsc::Receiver<AdminCommand>) {
        while let Ok(command) = admin.try_recv() {
            self.apply_admin(state, command).await;
        }
    }
}
