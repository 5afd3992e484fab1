use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use streamline_core::{EventLogSequenceNumber, PartitionId, ProcessorKey};
use streamline_events::{Cancellation, EventProcessor, ExecutionContext, StreamProcessorState};

use super::error::{AdminError, StreamProcessorError};
use super::stream_processor::{StreamProcessor, StreamProcessorHandle};
use crate::clock::{Clock, SystemClock};
use crate::config::StreamProcessorConfig;
use crate::event_source::EventSource;
use crate::state_store::StreamProcessorStateRepository;

/// Registered stream processors of one microservice, by key.
///
/// Processors share the state repository, clock and configuration of the
/// registry.
pub struct StreamProcessors {
    repository: Arc<dyn StreamProcessorStateRepository>,
    clock: Arc<dyn Clock>,
    config: StreamProcessorConfig,
    processors: RwLock<HashMap<ProcessorKey, Arc<StreamProcessor>>>,
}

impl StreamProcessors {
    pub fn new(repository: Arc<dyn StreamProcessorStateRepository>) -> Self {
        Self {
            repository,
            clock: Arc::new(SystemClock),
            config: StreamProcessorConfig::default(),
            processors: RwLock::new(HashMap::new()),
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

    pub fn register(
        &self,
        key: impl Into<ProcessorKey>,
        partitioned: bool,
        source: Arc<dyn EventSource>,
        processor: Arc<dyn EventProcessor>,
        context: ExecutionContext,
    ) -> Result<Arc<StreamProcessor>, StreamProcessorError> {
        let key = key.into();
        let mut processors = self.processors.write().unwrap_or_else(|e| e.into_inner());
        if processors.contains_key(&key) {
            return Err(StreamProcessorError::AlreadyRegistered(key));
        }

        let stream_processor = Arc::new(
            StreamProcessor::new(key.clone(), partitioned, source, processor, self.repository.clone(), context)
                .with_config(self.config.clone())
                .with_clock(self.clock.clone()),
        );
        processors.insert(key.clone(), stream_processor.clone());
        info!(processor = %key, partitioned, "stream processor registered");
        Ok(stream_processor)
    }

    /// Remove a processor, stopping it if it runs. Its stored state is kept.
    pub fn unregister(&self, key: &ProcessorKey) -> Option<Arc<StreamProcessor>> {
        let removed = self
            .processors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)?;
        let was_running = removed.stop();
        info!(processor = %key, was_running, "stream processor unregistered");
        Some(removed)
    }

    pub fn get(&self, key: &ProcessorKey) -> Option<Arc<StreamProcessor>> {
        self.processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<ProcessorKey> {
        self.processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub async fn start(
        &self,
        key: &ProcessorKey,
        cancellation: &Cancellation,
    ) -> Result<StreamProcessorHandle, StreamProcessorError> {
        let processor = self
            .get(key)
            .ok_or_else(|| StreamProcessorError::NotRegistered(key.clone()))?;
        processor.start(cancellation).await
    }

    pub async fn start_and_wait(&self, key: &ProcessorKey, cancellation: &Cancellation) -> Result<(), StreamProcessorError> {
        self.start(key, cancellation).await?.wait().await
    }

    pub async fn skip_events_before(
        &self,
        key: &ProcessorKey,
        target: EventLogSequenceNumber,
    ) -> Result<StreamProcessorState, AdminError> {
        self.get(key)
            .ok_or_else(|| AdminError::NotRegistered(key.clone()))?
            .skip_events_before(target)
            .await
    }

    pub async fn remove_failing_partition(
        &self,
        key: &ProcessorKey,
        partition: PartitionId,
    ) -> Result<StreamProcessorState, AdminError> {
        self.get(key)
            .ok_or_else(|| AdminError::NotRegistered(key.clone()))?
            .remove_failing_partition(partition)
            .await
    }
}
