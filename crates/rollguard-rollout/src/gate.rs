//! Deployment gate — the one call a pipeline makes before deploying.
//!
//! Checked in order: cooldown, open rollback episode, target health. The
//! gate fails closed: if state cannot be read, the answer is `Blocked`.

use std::fmt;

use serde::Serialize;
use tracing::{debug, error};

use rollguard_state::*;

use crate::cooldown::CooldownGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    CooldownActive,
    RollbackUnresolved,
    HealthNotClear,
    StateUnavailable,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::CooldownActive => "cooldown_active",
            BlockReason::RollbackUnresolved => "rollback_unresolved",
            BlockReason::HealthNotClear => "health_not_clear",
            BlockReason::StateUnavailable => "state_unavailable",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Allowed,
    Blocked { reason: BlockReason, detail: String },
}

impl GateDecision {
    pub fn blocked(reason: BlockReason, detail: impl Into<String>) -> Self {
        GateDecision::Blocked {
            reason,
            detail: detail.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed)
    }

    pub fn reason(&self) -> Option<BlockReason> {
        match self {
            GateDecision::Allowed => None,
            GateDecision::Blocked { reason, .. } => Some(*reason),
        }
    }
}

#[derive(Clone)]
pub struct DeploymentGate {
    store: StateStore,
    cooldown: CooldownGate,
}

impl DeploymentGate {
    pub fn new(store: StateStore, cooldown: CooldownGate) -> Self {
        Self { store, cooldown }
    }

    /// May `target` be deployed at `now`?
    ///
    /// Pipelines call this before starting and again right before the
    /// irreversible step.
    pub fn authorize(&self, target: &str, now: u64) -> GateDecision {
        let decision = match self.evaluate(target, now) {
            Ok(decision) => decision,
            Err(e) => {
                error!(%target, error = %e, "authorize could not read state, blocking");
                GateDecision::blocked(BlockReason::StateUnavailable, e.to_string())
            }
        };
        match &decision {
            GateDecision::Allowed => debug!(%target, "deploy authorized"),
            GateDecision::Blocked { reason, detail } => {
                debug!(%target, %reason, %detail, "deploy blocked")
            }
        }
        decision
    }

    fn evaluate(&self, target: &str, now: u64) -> StateResult<GateDecision> {
        let cooldown = self.cooldown.can_deploy(now)?;
        if !cooldown.is_allowed() {
            return Ok(cooldown);
        }

        if let Some(episode) = self.store.get_json::<RollbackEpisode>(&keys::episode(target))? {
            let episode = episode.value;
            if episode.is_open() {
                let detail = match &episode.error {
                    Some(error) => format!("rollback {} failed: {error}", episode.episode_id),
                    None => format!("rollback {} in progress", episode.episode_id),
                };
                return Ok(GateDecision::blocked(BlockReason::RollbackUnresolved, detail));
            }
        }

        let status = self
            .store
            .get_json::<HealthRecord>(&keys::health_status(target))?
            .map(|r| r.value.status)
            .unwrap_or_default();
        if !status.is_clear() {
            return Ok(GateDecision::blocked(
                BlockReason::HealthNotClear,
                format!("{target} is {status}"),
            ));
        }

        Ok(GateDecision::Allowed)
    }
}
