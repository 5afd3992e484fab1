use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use streamline_core::{EventLogSequenceNumber, PartitionId, ProcessorKey};
use streamline_events::{
    Cancellation, EventProcessor, ExecutionContext, PartitionedState, StreamProcessorState, UnpartitionedState,
};

use super::admin::{apply_to_stored_state, AdminCommand, AdminOperation};
use super::error::{AdminError, StreamProcessorError};
use super::runtime::Runtime;
use super::{linear, partitioned};
use crate::clock::{Clock, SystemClock};
use crate::config::StreamProcessorConfig;
use crate::event_source::EventSource;
use crate::resilience::retry_transient;
use crate::state_store::{RepositoryError, StreamProcessorStateRepository};

#[derive(Debug)]
struct Running {
    admin: mpsc::Sender<AdminCommand>,
    cancellation: Cancellation,
}

/// One processor over one stream.
///
/// At most one task runs a processor at a time. That task owns the state
/// while it runs; operator commands are sent into it instead of touching the
/// repository behind its back.
pub struct StreamProcessor {
    key: ProcessorKey,
    partitioned: bool,
    source: Arc<dyn EventSource>,
    processor: Arc<dyn EventProcessor>,
    repository: Arc<dyn StreamProcessorStateRepository>,
    clock: Arc<dyn Clock>,
    config: StreamProcessorConfig,
    context: ExecutionContext,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("key", &self.key)
            .field("partitioned", &self.partitioned)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl StreamProcessor {
    pub fn new(
        key: impl Into<ProcessorKey>,
        partitioned: bool,
        source: Arc<dyn EventSource>,
        processor: Arc<dyn EventProcessor>,
        repository: Arc<dyn StreamProcessorStateRepository>,
        context: ExecutionContext,
    ) -> Self {
        Self {
            key: key.into(),
            partitioned,
            source,
            processor,
            repository,
            clock: Arc::new(SystemClock),
            config: StreamProcessorConfig::default(),
            context,
            running: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: StreamProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn key(&self) -> &ProcessorKey {
        &self.key
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    pub fn is_running(&self) -> bool {
        self.running_sender().is_some()
    }

    /// Start processing in a background task.
    ///
    /// The stored state is re-read on every start. Cancelling `cancellation`
    /// (or calling [`StreamProcessor::stop`]) stops the task after it has
    /// persisted whatever transition was in flight.
    pub async fn start(
        self: &Arc<Self>,
        cancellation: &Cancellation,
    ) -> Result<StreamProcessorHandle, StreamProcessorError> {
        let (admin_tx, mut admin_rx) = mpsc::channel(self.config.admin_queue_capacity.max(1));
        let task_cancellation = cancellation.child();
        {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            if running.as_ref().is_some_and(|r| !r.admin.is_closed()) {
                return Err(StreamProcessorError::AlreadyRunning(self.key.clone()));
            }
            *running = Some(Running {
                admin: admin_tx.clone(),
                cancellation: task_cancellation.clone(),
            });
        }

        let state = match self.load_state(&task_cancellation).await {
            Ok(state) => state,
            Err(err) => {
                self.clear_running(&admin_tx);
                return Err(err);
            }
        };

        let runtime = Runtime {
            key: self.key.clone(),
            source: self.source.clone(),
            processor: self.processor.clone(),
            repository: self.repository.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            context: self.context,
            cancellation: task_cancellation.clone(),
        };
        let this = Arc::clone(self);
        let span = info_span!("stream_processor", processor = %self.key);
        let join = tokio::spawn(
            async move {
                match state {
                    StreamProcessorState::Unpartitioned(state) => {
                        linear::run(&runtime, state, &mut admin_rx).await
                    }
                    StreamProcessorState::Partitioned(state) => {
                        partitioned::run(&runtime, state, &mut admin_rx).await
                    }
                }
                // Queued commands are answered with `Stopped` by dropping them.
                admin_rx.close();
                this.clear_running(&admin_tx);
            }
            .instrument(span),
        );

        Ok(StreamProcessorHandle {
            key: self.key.clone(),
            cancellation: task_cancellation,
            join,
        })
    }

    /// Start processing and wait until the task stops.
    pub async fn start_and_wait(self: &Arc<Self>, cancellation: &Cancellation) -> Result<(), StreamProcessorError> {
        self.start(cancellation).await?.wait().await
    }

    /// Ask the running task, if any, to stop. Returns whether one was running.
    pub fn stop(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        match running.as_ref() {
            Some(r) if !r.admin.is_closed() => {
                r.cancellation.cancel();
                true
            }
            _ => false,
        }
    }

    /// The stored state, as last persisted.
    pub async fn current_state(&self) -> Result<Option<StreamProcessorState>, RepositoryError> {
        self.repository.try_get(&self.key).await
    }

    /// Move the processor past every event before `target` in the event log.
    ///
    /// Clears a failure the skipped events were holding up.
    pub async fn skip_events_before(
        &self,
        target: EventLogSequenceNumber,
    ) -> Result<StreamProcessorState, AdminError> {
        self.administer(AdminOperation::SkipEventsBefore(target)).await
    }

    /// Give up on a failing partition. Its remaining events are not delivered.
    pub async fn remove_failing_partition(&self, partition: PartitionId) -> Result<StreamProcessorState, AdminError> {
        self.administer(AdminOperation::RemoveFailingPartition(partition)).await
    }

    async fn administer(&self, operation: AdminOperation) -> Result<StreamProcessorState, AdminError> {
        let operation = match self.running_sender() {
            Some(admin) => {
                let (reply, response) = oneshot::channel();
                match admin.send(AdminCommand { operation, reply }).await {
                    Ok(()) => {
                        return response
                            .await
                            .unwrap_or_else(|_| Err(AdminError::Stopped(self.key.clone())));
                    }
                    // Stopped in the meantime.
                    Err(mpsc::error::SendError(command)) => command.operation,
                }
            }
            None => operation,
        };

        apply_to_stored_state(
            self.repository.as_ref(),
            &self.config.persistence_policy,
            &self.key,
            self.partitioned,
            &operation,
        )
        .await
    }

    async fn load_state(&self, cancellation: &Cancellation) -> Result<StreamProcessorState, StreamProcessorError> {
        let repository = &self.repository;
        let key = &self.key;
        let stored = retry_transient(
            &self.config.persistence_policy,
            cancellation,
            "load_state",
            RepositoryError::is_transient,
            move || repository.try_get(key),
        )
        .await
        .map_err(|source| StreamProcessorError::LoadState {
            key: self.key.clone(),
            source,
        })?;

        reconcile_shape(&self.key, self.partitioned, stored)
    }

    fn running_sender(&self) -> Option<mpsc::Sender<AdminCommand>> {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running
            .as_ref()
            .filter(|r| !r.admin.is_closed())
            .map(|r| r.admin.clone())
    }

    fn clear_running(&self, admin: &mpsc::Sender<AdminCommand>) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| r.admin.same_channel(admin)) {
            *running = None;
        }
    }
}

/// Fit stored state to the processor's partitioning.
///
/// A healthy state of the other shape is converted at its position; a
/// failing one is refused since its failure cannot be carried over.
fn reconcile_shape(
    key: &ProcessorKey,
    partitioned: bool,
    stored: Option<StreamProcessorState>,
) -> Result<StreamProcessorState, StreamProcessorError> {
    let Some(stored) = stored else {
        info!(processor = %key, partitioned, "no stored state, starting from the beginning");
        return Ok(StreamProcessorState::initial(partitioned));
    };
    if stored.is_partitioned() == partitioned {
        return Ok(stored);
    }
    if stored.is_failing() {
        return Err(StreamProcessorError::StateShape {
            key: key.clone(),
            reason: format!(
                "stored state is {} and failing, processor is {}",
                shape(stored.is_partitioned()),
                shape(partitioned)
            ),
        });
    }

    warn!(
        processor = %key,
        position = %stored.position(),
        from = shape(stored.is_partitioned()),
        to = shape(partitioned),
        "converting stored state to the processor's partitioning"
    );
    let position = stored.position();
    Ok(if partitioned {
        PartitionedState::at(position).into()
    } else {
        UnpartitionedState::at(position).into()
    })
}

fn shape(partitioned: bool) -> &'static str {
    if partitioned { "partitioned" } else { "unpartitioned" }
}

/// Handle to a running processor task.
#[derive(Debug)]
pub struct StreamProcessorHandle {
    key: ProcessorKey,
    cancellation: Cancellation,
    join: JoinHandle<()>,
}

impl StreamProcessorHandle {
    pub fn key(&self) -> &ProcessorKey {
        &self.key
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task to stop.
    pub async fn wait(self) -> Result<(), StreamProcessorError> {
        self.join
            .await
            .map_err(|e| StreamProcessorError::Task(e.to_string()))
    }

    /// Request a stop and wait for it.
    pub async fn shutdown(self) -> Result<(), StreamProcessorError> {
        self.cancel();
        self.wait().await
    }
}
