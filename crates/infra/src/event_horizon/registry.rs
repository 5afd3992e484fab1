use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use streamline_core::SubscriptionId;
use streamline_events::{Cancellation, EventProcessor, ExecutionContext};

use super::connection::{EventHorizonConnectionFactory, MicroserviceAddress};
use super::subscription::Subscription;
use crate::clock::{Clock, SystemClock};
use crate::config::{EventHorizonConfig, StreamProcessorConfig};
use crate::state_store::StreamProcessorStateRepository;

/// Active Event Horizon subscriptions of a consumer microservice.
pub struct Subscriptions {
    factory: Arc<dyn EventHorizonConnectionFactory>,
    repository: Arc<dyn StreamProcessorStateRepository>,
    clock: Arc<dyn Clock>,
    config: EventHorizonConfig,
    processor_config: StreamProcessorConfig,
    cancellation: Cancellation,
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
}

impl Subscriptions {
    pub fn new(
        factory: Arc<dyn EventHorizonConnectionFactory>,
        repository: Arc<dyn StreamProcessorStateRepository>,
    ) -> Self {
        Self {
            factory,
            repository,
            clock: Arc::new(SystemClock),
            config: EventHorizonConfig::default(),
            processor_config: StreamProcessorConfig::default(),
            cancellation: Cancellation::new(),
            subscriptions: RwLock::new(HashMap::new()),
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

    /// Subscribe and start connecting.
    ///
    /// Subscribing to an id that is already subscribed returns the existing
    /// subscription; no second connection or processor is created. Must be
    /// called from within a Tokio runtime.
    pub fn subscribe(
        &self,
        id: SubscriptionId,
        address: MicroserviceAddress,
        partitioned: bool,
        processor: Arc<dyn EventProcessor>,
        context: ExecutionContext,
    ) -> Arc<Subscription> {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = subscriptions.get(&id) {
            debug!(subscription = %id, "already subscribed");
            return existing.clone();
        }

        let subscription = Arc::new(
            Subscription::new(
                id.clone(),
                address,
                partitioned,
                self.factory.clone(),
                processor,
                self.repository.clone(),
                context,
            )
            .with_config(self.config.clone())
            .with_processor_config(self.processor_config.clone())
            .with_clock(self.clock.clone())
            .with_parent_cancellation(&self.cancellation),
        );
        subscription.start();
        subscriptions.insert(id.clone(), subscription.clone());
        info!(subscription = %id, address = %subscription.address(), "subscribed");
        subscription
    }

    /// Stop and forget a subscription. Its stored state is kept.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        let Some(subscription) = removed else {
            return false;
        };
        subscription.stop().await;
        info!(subscription = %id, "unsubscribed");
        true
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Stop every subscription.
    pub async fn shutdown(&self) {
        self.cancellation.cancel();
        let all: Vec<_> = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();
        for subscription in all {
            subscription.stop().await;
        }
    }
}
