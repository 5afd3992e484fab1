use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use streamline_core::{EventLogSequenceNumber, PartitionId, ProcessorKey, StreamPosition, SubscriptionId};
use streamline_events::{Cancellation, EventProcessor, ExecutionContext, StreamProcessorState};

use super::connection::{
    ConnectionError, EventHorizonConnectionFactory, MicroserviceAddress, SubscriptionResponse,
};
use super::queue::event_queue;
use super::source::EventHorizonEventSource;
use crate::clock::{Clock, SystemClock};
use crate::config::{EventHorizonConfig, StreamProcessorConfig};
use crate::processing::{apply_to_stored_state, AdminError, AdminOperation, StreamProcessor};
use crate::resilience::{retry_transient, ResiliencePolicy, RetryError};
use crate::state_store::{RepositoryError, StreamProcessorStateRepository};

/// Connection state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Connected,
    /// The reconnect policy gave up.
    Failed,
}

/// How one connection attempt ended.
enum Attempt {
    Refused,
    Ended,
    Cancelled,
}

/// A consumer's pull subscription to a producer's public stream.
///
/// Once started, the subscription connects from the position stored for it,
/// runs a stream processor over the received events while connected and
/// reconnects under the reconnect policy whenever the connection fails or ends.
pub struct Subscription {
    id: SubscriptionId,
    key: ProcessorKey,
    address: MicroserviceAddress,
    partitioned: bool,
    factory: Arc<dyn EventHorizonConnectionFactory>,
    processor: Arc<dyn EventProcessor>,
    repository: Arc<dyn StreamProcessorStateRepository>,
    clock: Arc<dyn Clock>,
    context: ExecutionContext,
    config: EventHorizonConfig,
    processor_config: StreamProcessorConfig,
    cancellation: Cancellation,
    state: watch::Sender<SubscriptionState>,
    last_response: watch::Sender<Option<SubscriptionResponse>>,
    task: Mutex<Option<JoinHandle<()>>>,
    current: Mutex<Option<Arc<StreamProcessor>>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        address: MicroserviceAddress,
        partitioned: bool,
        factory: Arc<dyn EventHorizonConnectionFactory>,
        processor: Arc<dyn EventProcessor>,
        repository: Arc<dyn StreamProcessorStateRepository>,
        context: ExecutionContext,
    ) -> Self {
        Self {
            key: ProcessorKey::Subscription(id.clone()),
            id,
            address,
            partitioned,
            factory,
            processor,
            repository,
            clock: Arc::new(SystemClock),
            context,
            config: EventHorizonConfig::default(),
            processor_config: StreamProcessorConfig::default(),
            cancellation: Cancellation::new(),
            state: watch::channel(SubscriptionState::Disconnected).0,
            last_response: watch::channel(None).0,
            task: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: EventHorizonConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_processor_config(mut self, config: StreamProcessorConfig) -> Self {
        self.processor_config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Tie the subscription's lifetime to `parent`.
    pub fn with_parent_cancellation(mut self, parent: &Cancellation) -> Self {
        self.cancellation = parent.child();
        self
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn address(&self) -> &MicroserviceAddress {
        &self.address
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Response to the latest connect call.
    pub fn last_response(&self) -> Option<SubscriptionResponse> {
        self.last_response.borrow().clone()
    }

    /// Wait for the first connect call to be answered. `None` if the
    /// subscription is stopped before that.
    pub async fn connection_response(&self) -> Option<SubscriptionResponse> {
        let mut responses = self.last_response.subscribe();
        tokio::select! {
            biased;
            answered = responses.wait_for(Option::is_some) => {
                answered.ok().and_then(|response| response.clone())
            }
            _ = self.cancellation.cancelled() => self.last_response(),
        }
    }

    /// Start connecting. Calling it again while started does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let span = info_span!("event_horizon_subscription", subscription = %self.id);
        *task = Some(tokio::spawn(async move { this.run().await }.instrument(span)));
    }

    pub fn is_stopped(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Stop receiving and processing, then wait for the connection to be released.
    pub async fn stop(&self) {
        self.cancellation.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(subscription = %self.id, error = %err, "subscription task failed");
            }
        }
    }

    pub async fn skip_events_before(
        &self,
        target: EventLogSequenceNumber,
    ) -> Result<StreamProcessorState, AdminError> {
        self.administer(AdminOperation::SkipEventsBefore(target)).await
    }

    pub async fn remove_failing_partition(&self, partition: PartitionId) -> Result<StreamProcessorState, AdminError> {
        self.administer(AdminOperation::RemoveFailingPartition(partition)).await
    }

    async fn administer(&self, operation: AdminOperation) -> Result<StreamProcessorState, AdminError> {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match (current, operation) {
            (Some(processor), AdminOperation::SkipEventsBefore(target)) => processor.skip_events_before(target).await,
            (Some(processor), AdminOperation::RemoveFailingPartition(partition)) => {
                processor.remove_failing_partition(partition).await
            }
            (None, operation) => {
                apply_to_stored_state(
                    self.repository.as_ref(),
                    &self.processor_config.persistence_policy,
                    &self.key,
                    self.partitioned,
                    &operation,
                )
                .await
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut failures = 0u32;
        loop {
            if self.cancellation.is_cancelled() {
                break;
            }
            self.state.send_replace(SubscriptionState::Connecting);

            match self.attempt().await {
                Attempt::Cancelled => break,
                Attempt::Refused => failures = failures.saturating_add(1),
                // A session that was up starts the backoff over.
                Attempt::Ended => failures = 1,
            }
            self.state.send_replace(SubscriptionState::Disconnected);

            let Some(delay) = self.config.reconnect_policy.next_delay(failures) else {
                error!(subscription = %self.id, attempts = failures, "giving up connecting to producer");
                self.state.send_replace(SubscriptionState::Failed);
                return;
            };
            info!(
                subscription = %self.id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "reconnecting to producer"
            );
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(SubscriptionState::Disconnected);
        info!(subscription = %self.id, "subscription stopped");
    }

    async fn attempt(&self) -> Attempt {
        let from = match self.start_position().await {
            Ok(from) => from,
            Err(RetryError::Cancelled(_)) => return Attempt::Cancelled,
            Err(err) => {
                warn!(subscription = %self.id, error = %err, "reading subscription state failed");
                return Attempt::Refused;
            }
        };

        let mut connection = self.factory.create(&self.address);
        let response = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => return Attempt::Cancelled,
            response = connection.connect(&self.id, from, &self.cancellation) => response,
        };
        self.last_response.send_replace(Some(response.clone()));

        let consent_id = match response {
            SubscriptionResponse::Success { consent_id } => consent_id,
            SubscriptionResponse::Failure(failure) => {
                warn!(
                    subscription = %self.id,
                    address = %self.address,
                    failure_id = %failure.id,
                    reason = %failure.reason,
                    "producer refused subscription"
                );
                return Attempt::Refused;
            }
        };

        self.state.send_replace(SubscriptionState::Connected);
        info!(subscription = %self.id, %consent_id, %from, "connected to producer");

        let session = self.cancellation.child();
        let (writer, reader) = event_queue(self.config.queue_capacity);
        let source = Arc::new(EventHorizonEventSource::new(
            reader,
            from,
            self.config.queue_capacity,
            session.clone(),
        ));
        let processor = Arc::new(
            StreamProcessor::new(
                self.key.clone(),
                self.partitioned,
                source,
                self.processor.clone(),
                self.repository.clone(),
                self.context,
            )
            .with_config(self.processor_config.clone())
            .with_clock(self.clock.clone()),
        );

        let handle = match processor.start(&session).await {
            Ok(handle) => handle,
            Err(err) => {
                error!(subscription = %self.id, error = %err, "starting subscription processor failed");
                session.cancel();
                return if self.cancellation.is_cancelled() { Attempt::Cancelled } else { Attempt::Ended };
            }
        };
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(processor);

        let received = connection.start_receiving_events_into(writer, session.clone()).await;

        session.cancel();
        if let Err(err) = handle.wait().await {
            error!(subscription = %self.id, error = %err, "subscription processor failed");
        }
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;

        if self.cancellation.is_cancelled() {
            return Attempt::Cancelled;
        }
        match received {
            Ok(()) => info!(subscription = %self.id, "producer closed the connection"),
            Err(ConnectionError::Cancelled) => info!(subscription = %self.id, "receiving cancelled"),
            Err(err) => warn!(subscription = %self.id, error = %err, "connection to producer failed"),
        }
        Attempt::Ended
    }

    /// Resume at the stored floor, or at the start of the stream.
    async fn start_position(&self) -> Result<StreamPosition, RetryError<RepositoryError>> {
        let repository = &self.repository;
        let key = &self.key;
        let stored = retry_transient(
            &self.processor_config.persistence_policy,
            &self.cancellation,
            "load_state",
            RepositoryError::is_transient,
            move || repository.try_get(key),
        )
        .await?;
        Ok(stored
            .map(|state| state.next_position_to_receive())
            .unwrap_or(StreamPosition::START))
    }
}
