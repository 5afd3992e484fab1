//! `streamline-infra`: the runtime around the pure state model.
//!
//! Boundaries (event source, state repository, Event Horizon connection) are
//! traits with in-memory adapters for tests and a Postgres adapter for
//! processor state. The engines in [`processing`] and the subscriptions in
//! [`event_horizon`] are built only against those traits.

pub mod clock;
pub mod config;
pub mod event_horizon;
pub mod event_source;
pub mod processing;
pub mod resilience;
pub mod state_store;

#[cfg(test)]
mod integration_tests;

pub use clock::{Clock, SystemClock, TokioClock};
pub use config::{ConfigError, EventHorizonConfig, StreamProcessorConfig};
pub use event_horizon::{Subscription, SubscriptionState, Subscriptions};
pub use event_source::{EventSource, FetchError, InMemoryEventSource};
pub use processing::{
    AdminError, AdminOperation, StreamProcessor, StreamProcessorError, StreamProcessorHandle, StreamProcessors,
};
pub use resilience::{retry_transient, retry_with_policy, BackoffStrategy, ResiliencePolicy, RetryError, RetryPolicy};
pub use state_store::{InMemoryStateRepository, PostgresStateRepository, RepositoryError, StreamProcessorStateRepository};
