//! Domain error model.

use thiserror::Error;

/// Result type used across the processing primitives.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Covers deterministic failures of the pure model (malformed identifiers,
/// inconsistent state). Infrastructure failures (storage, network) have their
/// own error types in `streamline-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A state loaded from storage is internally inconsistent.
    ///
    /// Raised at load time; the state is never coerced into shape.
    #[error("invalid stream processor state: {0}")]
    InvalidState(String),

    /// A processing invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}
