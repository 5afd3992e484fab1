use std::sync::Arc;

use thiserror::Error;

use streamline_core::{DomainError, ProcessorKey};
use streamline_events::StreamProcessorState;

/// State repository operation error.
///
/// ## Error Categories
///
/// - **Unavailable**: storage could not be reached or the write failed; worth retrying
/// - **Serialization**: the stored document is not a state at all
/// - **InvalidState**: the stored document parsed but violates the state invariants
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("state storage unavailable: {0}")]
    Unavailable(String),

    #[error("stored state for {key} could not be decoded: {reason}")]
    Serialization { key: String, reason: String },

    #[error(transparent)]
    InvalidState(#[from] DomainError),
}

impl RepositoryError {
    /// Whether retrying the same call may succeed. A stored document that
    /// cannot be decoded or validated stays broken.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}

/// Durable store of stream processor state, keyed by [`ProcessorKey`].
///
/// Implementations must:
/// - make `persist` durable before returning `Ok`
/// - validate states on `try_get` and fail with [`RepositoryError::InvalidState`]
///   instead of returning an inconsistent state
/// - return `Ok(None)` for keys that were never persisted
///
/// The engines keep exactly one writer per key, so no compare-and-swap is required.
#[async_trait::async_trait]
pub trait StreamProcessorStateRepository: Send + Sync {
    async fn try_get(&self, key: &ProcessorKey) -> Result<Option<StreamProcessorState>, RepositoryError>;

    async fn persist(&self, key: &ProcessorKey, state: &StreamProcessorState) -> Result<(), RepositoryError>;
}

#[async_trait::async_trait]
impl<R> StreamProcessorStateRepository for Arc<R>
where
    R: StreamProcessorStateRepository + ?Sized,
{
    async fn try_get(&self, key: &ProcessorKey) -> Result<Option<StreamProcessorState>, RepositoryError> {
        (**self).try_get(key).await
    }

    async fn persist(&self, key: &ProcessorKey, state: &StreamProcessorState) -> Result<(), RepositoryError> {
        (**self).persist(key, state).await
    }
}

/// Decode and validate a stored state document.
pub(crate) fn decode_state(
    key: &ProcessorKey,
    document: serde_json::Value,
) -> Result<StreamProcessorState, RepositoryError> {
    let state: StreamProcessorState =
        serde_json::from_value(document).map_err(|e| RepositoryError::Serialization {
            key: key.storage_key(),
            reason: e.to_string(),
        })?;
    state.validate()?;
    Ok(state)
}

pub(crate) fn encode_state(
    key: &ProcessorKey,
    state: &StreamProcessorState,
) -> Result<serde_json::Value, RepositoryError> {
    serde_json::to_value(state).map_err(|e| RepositoryError::Serialization {
        key: key.storage_key(),
        reason: e.to_string(),
    })
}
