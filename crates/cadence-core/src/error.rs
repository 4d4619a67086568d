//! Cadence error taxonomy.

use thiserror::Error;

/// Every fallible Cadence operation reports one of these.
#[derive(Debug, Error)]
pub enum CadenceError {
    /// Malformed input, rejected before any state change.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lifecycle transition not permitted from the current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Optimistic concurrency check failed on a routine save.
    #[error("Version conflict on routine {routine_id}: expected {expected}, found {actual}")]
    VersionConflict {
        routine_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Store unavailable or timed out. Safe to retry.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Notification sender reported a failed delivery.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Internal invariant broken (e.g. occurrence id collision). Never retried.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CadenceError {
    /// Whether the invoking component should retry on its next pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CadenceError::Transient(_)
                | CadenceError::Delivery(_)
                | CadenceError::VersionConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
