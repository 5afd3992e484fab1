//! Stream processor state repository boundary.
//!
//! Local stream processors and Event Horizon subscriptions persist their
//! state through the same repository, keyed by `ProcessorKey`.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryStateRepository;
pub use postgres::PostgresStateRepository;
pub use r#trait::{RepositoryError, StreamProcessorStateRepository};
