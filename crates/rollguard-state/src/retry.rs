//! Bounded compare-and-set retry.
//!
//! Every read-modify-write in rollguard runs inside [`retry_cas`]: the closure
//! re-reads, recomputes, and writes with the version it just read. A
//! `VersionConflict` re-runs it after a short jittered sleep; exhausting the
//! budget becomes [`StateError::Contention`], which callers surface as a
//! retryable failure.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up.
    pub max_retries: u32,
    /// Upper bound of the random delay between attempts.
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 32,
            retry_delay_ms: 2,
        }
    }
}

pub async fn retry_cas<T, F>(policy: &RetryPolicy, operation: &str, mut attempt: F) -> StateResult<T>
where
    F: FnMut() -> StateResult<T>,
{
    let mut attempts = 0u32;
    loop {
        match attempt() {
            Err(StateError::VersionConflict { key, .. }) => {
                attempts += 1;
                if attempts >= policy.max_retries {
                    warn!(operation, %key, attempts, "compare-and-set retries exhausted");
                    return Err(StateError::Contention {
                        operation: operation.to_string(),
                        attempts,
                    });
                }
                debug!(operation, %key, attempts, "compare-and-set conflict, retrying");
                let jitter = rand::rng().random_range(0..policy.retry_delay_ms + 1);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
            other => return other,
        }
    }
}
