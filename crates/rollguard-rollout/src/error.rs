//! Error types for rollback control.

use std::time::Duration;

use rollguard_core::ConfigError;
use rollguard_state::StateError;
use thiserror::Error;

pub type GuardResult<T> = Result<T, GuardError>;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid target name {0:?}: must be non-empty and contain no '/'")]
    InvalidTarget(String),

    /// Nothing to acknowledge for this target.
    #[error("no failed rollback episode awaiting acknowledgement for {0}")]
    NoOpenEpisode(String),

    /// The revert for this episode may still be running.
    #[error("rollback episode {episode_id} for {target} is still in flight")]
    EpisodeInFlight { target: String, episode_id: String },
}

impl GuardError {
    /// Contention and conflicts clear up on their own; retry later.
    pub fn is_retryable(&self) -> bool {
        match self {
            GuardError::State(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Why a revert call did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RevertError {
    #[error("no revert action configured")]
    Unconfigured,

    #[error("revert transport error: {0}")]
    Transport(String),

    /// The platform answered but refused.
    #[error("revert rejected: {0}")]
    Rejected(String),

    #[error("revert timed out after {0:?}")]
    TimedOut(Duration),
}
