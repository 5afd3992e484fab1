//! Boundary to the producer microservice.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use streamline_core::{StreamPosition, SubscriptionId};
use streamline_events::Cancellation;

use super::queue::EventQueueWriter;

/// Resolved network address of a producer microservice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MicroserviceAddress {
    pub host: String,
    pub port: u16,
}

impl MicroserviceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for MicroserviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Why the producer refused or could not serve a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionFailure {
    pub id: Uuid,
    pub reason: String,
}

impl ConnectionFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.id)
    }
}

/// Outcome of a connect call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriptionResponse {
    /// The producer granted the subscription under the given consent.
    Success { consent_id: Uuid },
    Failure(ConnectionFailure),
}

impl SubscriptionResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, SubscriptionResponse::Success { .. })
    }
}

/// Why receiving events stopped.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection lost: {0}")]
    Lost(String),

    #[error("receiving cancelled")]
    Cancelled,

    #[error("event queue closed")]
    QueueClosed,
}

/// One connection to a producer.
///
/// `connect` is called once. After a successful response the subscription
/// calls `start_receiving_events_into`, which pushes the producer's events in
/// stream order into the queue until the connection ends or `cancellation`
/// fires. Implementations must not enqueue after observing cancellation.
#[async_trait::async_trait]
pub trait EventHorizonConnection: Send {
    async fn connect(
        &mut self,
        subscription: &SubscriptionId,
        from: StreamPosition,
        cancellation: &Cancellation,
    ) -> SubscriptionResponse;

    async fn start_receiving_events_into(
        &mut self,
        queue: EventQueueWriter,
        cancellation: Cancellation,
    ) -> Result<(), ConnectionError>;
}

/// Opens connections. A new connection is created for every attempt.
pub trait EventHorizonConnectionFactory: Send + Sync {
    fn create(&self, address: &MicroserviceAddress) -> Box<dyn EventHorizonConnection>;
}
