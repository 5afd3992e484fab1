//! Event Horizon: consuming another microservice's public stream.
//!
//! A [`Subscription`] connects to the producer, feeds the received events
//! through a bounded queue into a stream processor keyed by the subscription
//! and reconnects under its policy when the connection fails.

pub mod connection;
pub mod queue;
pub mod registry;
pub mod source;
pub mod subscription;

pub use connection::{
    ConnectionError, ConnectionFailure, EventHorizonConnection, EventHorizonConnectionFactory,
    MicroserviceAddress, SubscriptionResponse,
};
pub use queue::{event_queue, EventQueueReader, EventQueueWriter, QueueError};
pub use registry::Subscriptions;
pub use source::EventHorizonEventSource;
pub use subscription::{Subscription, SubscriptionState};
