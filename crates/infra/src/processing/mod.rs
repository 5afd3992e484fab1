//! Stream processing engines.
//!
//! A [`StreamProcessor`] loads its stored state, then runs the linear engine
//! (non-partitioned streams) or the partitioned engine with its catch-up of
//! failing partitions in a single task. [`StreamProcessors`] keeps the
//! registered processors of a microservice and routes operator commands.

mod admin;
mod catchup;
mod error;
mod linear;
mod partitioned;
mod registry;
mod runtime;
mod stream_processor;

pub use admin::AdminOperation;
pub(crate) use admin::apply_to_stored_state;
pub use error::{AdminError, StreamProcessorError};
pub use registry::StreamProcessors;
pub use stream_processor::{StreamProcessor, StreamProcessorHandle};
