//! Cooldown gate — the global block on new deploys after a rollback.
//!
//! Expiry is computed from the stored timestamp on every read, so nothing
//! has to run when a window lapses. A manual clear neutralizes the flag
//! instead of deleting it, keeping the key's version history monotonic.

use tracing::{info, warn};

use rollguard_state::*;

use crate::gate::{BlockReason, GateDecision};
use crate::policy::GuardPolicy;

#[derive(Clone)]
pub struct CooldownGate {
    store: StateStore,
    policy: GuardPolicy,
}

impl CooldownGate {
    pub fn new(store: StateStore, policy: GuardPolicy) -> Self {
        Self { store, policy }
    }

    /// The stored window, active or not.
    pub fn state(&self) -> StateResult<Option<Versioned<CooldownWindow>>> {
        self.store.get_json::<CooldownWindow>(keys::COOLDOWN)
    }

    pub fn can_deploy(&self, now: u64) -> StateResult<GateDecision> {
        match self.state()? {
            Some(window) if window.value.is_active(now) => Ok(GateDecision::blocked(
                BlockReason::CooldownActive,
                format!(
                    "cooldown active until {} (opened by {})",
                    window.value.expires_at(),
                    window.value.target.as_deref().unwrap_or("unknown target")
                ),
            )),
            _ => Ok(GateDecision::Allowed),
        }
    }

    /// The write that opens a cooldown for `episode`, for the caller's batch.
    ///
    /// An active window is kept as-is unless the policy extends on failure,
    /// in which case it restarts at `now`. Returns `None` for the write when
    /// nothing changes.
    pub fn open_write(
        &self,
        now: u64,
        episode: &RollbackEpisode,
    ) -> StateResult<(Option<FlagWrite>, CooldownWindow)> {
        let read = self.state()?;
        match &read {
            Some(current)
                if current.value.is_active(now) && !self.policy.extend_cooldown_on_failure =>
            {
                return Ok((None, current.value.clone()));
            }
            _ => {}
        }
        let window = self.window_for(now, episode);
        let write = FlagWrite::json(keys::COOLDOWN, version_of(&read), &window)?;
        Ok((Some(write), window))
    }

    /// The cooldown write for an episode reaching a terminal state.
    ///
    /// The window the episode opened stands as-is, including a manual clear
    /// made while the revert ran. Anything else falls back to `open_write`.
    pub fn settle_write(
        &self,
        now: u64,
        episode: &RollbackEpisode,
    ) -> StateResult<(Option<FlagWrite>, CooldownWindow)> {
        if let Some(current) = self.state()? {
            if current.value.episode_id.as_deref() == Some(episode.episode_id.as_str()) {
                return Ok((None, current.value));
            }
        }
        self.open_write(now, episode)
    }

    /// Restart the window at `now` for a repeated failure.
    ///
    /// Only used when the policy extends on failure.
    pub async fn restart(&self, now: u64, episode: &RollbackEpisode) -> StateResult<CooldownWindow> {
        let window = retry_cas(&self.policy.retry, "restart cooldown", || {
            let read = self.state()?;
            let window = self.window_for(now, episode);
            self.store.apply(
                &[FlagWrite::json(keys::COOLDOWN, version_of(&read), &window)?],
                now,
            )?;
            Ok(window)
        })
        .await?;
        warn!(
            target = %episode.target,
            episode_id = %episode.episode_id,
            until = window.expires_at(),
            "cooldown extended by repeated failure"
        );
        Ok(window)
    }

    /// Operator override: end the active window now.
    ///
    /// Returns the neutralized window, or `None` when nothing was active.
    pub async fn clear(&self, now: u64) -> StateResult<Option<CooldownWindow>> {
        let cleared = retry_cas(&self.policy.retry, "clear cooldown", || {
            let Some(current) = self.state()? else {
                return Ok(None);
            };
            if !current.value.is_active(now) {
                return Ok(None);
            }
            let window = CooldownWindow {
                manually_cleared: true,
                cleared_at: Some(now),
                ..current.value
            };
            self.store.apply(
                &[FlagWrite::json(keys::COOLDOWN, current.version, &window)?],
                now,
            )?;
            Ok(Some(window))
        })
        .await?;

        match &cleared {
            Some(window) => info!(
                started_at = window.started_at,
                expires_at = window.expires_at(),
                "cooldown cleared manually"
            ),
            None => info!("cooldown clear requested, none active"),
        }
        Ok(cleared)
    }

    fn window_for(&self, now: u64, episode: &RollbackEpisode) -> CooldownWindow {
        CooldownWindow {
            started_at: now,
            duration_secs: self.policy.cooldown.as_secs(),
            manually_cleared: false,
            cleared_at: None,
            episode_id: Some(episode.episode_id.clone()),
            target: Some(episode.target.clone()),
        }
    }
}
