//! `streamline-core`: processing primitives.
//!
//! This crate contains **pure** building blocks (no IO, no async): identifiers,
//! processor keys, the position model and the domain error.

pub mod error;
pub mod id;
pub mod key;
pub mod position;

pub use error::{DomainError, DomainResult};
pub use id::{EventProcessorId, MicroserviceId, PartitionId, ScopeId, StreamId, TenantId};
pub use key::{ProcessorKey, StreamProcessorId, SubscriptionId};
pub use position::{EventLogSequenceNumber, ProcessingPosition, StreamPosition};
