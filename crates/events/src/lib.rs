//! `streamline-events`: events as processors see them, processing outcomes,
//! and the persisted processor state with its pure transitions.
//!
//! Nothing here performs I/O. Runtimes (event sources, repositories, the
//! processing loops) live in `streamline-infra`.

pub mod cancellation;
pub mod context;
pub mod event;
pub mod processor;
pub mod result;
pub mod state;

pub use cancellation::Cancellation;
pub use context::ExecutionContext;
pub use event::{CommittedEvent, StreamEvent};
pub use processor::EventProcessor;
pub use result::ProcessingResult;
pub use state::{
    FailingPartitionState, Failure, PartitionedState, RetryTime, StreamProcessorState,
    UnpartitionedState,
};
