//! Event source boundary.
//!
//! Where stream processors read their events from: a local stream derived
//! from the event log, or the buffer an Event Horizon subscription fills.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventSource;
pub use r#trait::{EventSource, FetchError};
