//! Error types for the rollguard state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// The stored version did not match the caller's expectation.
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Compare-and-set kept losing; the caller may retry later.
    #[error("{operation} gave up after {attempts} conflicting attempts")]
    Contention { operation: String, attempts: u32 },
}

impl StateError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::VersionConflict { .. })
    }

    /// Whether retrying the whole operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StateError::VersionConflict { .. } | StateError::Contention { .. }
        )
    }
}
