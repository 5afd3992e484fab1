use thiserror::Error;

use streamline_core::{DomainError, ProcessorKey};

use crate::resilience::RetryError;
use crate::state_store::RepositoryError;

/// Stream processor lifecycle error.
#[derive(Debug, Error)]
pub enum StreamProcessorError {
    #[error("stream processor {0} is already registered")]
    AlreadyRegistered(ProcessorKey),

    #[error("stream processor {0} is not registered")]
    NotRegistered(ProcessorKey),

    #[error("stream processor {0} is already running")]
    AlreadyRunning(ProcessorKey),

    #[error("failed to load state of {key}: {source}")]
    LoadState {
        key: ProcessorKey,
        #[source]
        source: RetryError<RepositoryError>,
    },

    #[error("stored state of {key} does not fit the processor: {reason}")]
    StateShape { key: ProcessorKey, reason: String },

    #[error("stream processor task failed: {0}")]
    Task(String),
}

/// Operator command error.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("stream processor {0} is not registered")]
    NotRegistered(ProcessorKey),

    #[error("operation rejected: {0}")]
    Rejected(#[from] DomainError),

    #[error("failed to load state: {0}")]
    Load(#[source] RetryError<RepositoryError>),

    #[error("failed to persist state: {0}")]
    Persist(#[source] RetryError<RepositoryError>),

    #[error("stream processor {0} stopped before the operation was applied")]
    Stopped(ProcessorKey),
}
