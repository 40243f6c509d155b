//! Guard policy — the tunables the controller and gates run under.

use std::time::Duration;

use rollguard_core::{ConfigError, GuardConfig};
use rollguard_state::RetryPolicy;

/// Default cooldown: 14 days.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(14 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardPolicy {
    /// How long deploys stay blocked after an episode.
    pub cooldown: Duration,
    /// Restart the cooldown on a new failure while an episode is open,
    /// or when an episode opens inside an active cooldown.
    pub extend_cooldown_on_failure: bool,
    /// Upper bound on one revert call.
    pub revert_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            extend_cooldown_on_failure: false,
            revert_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl TryFrom<&GuardConfig> for GuardPolicy {
    type Error = ConfigError;

    fn try_from(config: &GuardConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            cooldown: config.cooldown()?,
            extend_cooldown_on_failure: config.guard.extend_cooldown_on_failure,
            revert_timeout: config.revert_timeout()?,
            retry: RetryPolicy {
                max_retries: config.guard.cas_max_retries.max(1),
                retry_delay_ms: config.guard.cas_retry_delay_ms,
            },
        })
    }
}
