//! Rollback controller — turns a `Failed` verdict into at most one revert.
//!
//! The episode flag under `rollback_episode/{target}` is the only
//! mutual-exclusion device. Opening one is a compare-and-set; whoever loses
//! re-reads, finds it open, and reports `AlreadyHandled`. No lock is held
//! across the revert call itself.
//!
//! # Lifecycle
//!
//! ```text
//! Failed observed ──► open episode (Pending) + cooldown ──► revert(last known good)
//!                            │                                  │
//!                            │ no known-good                    ├─ ok  ──► Succeeded, version reset
//!                            ▼                                  └─ err ──► Failed (open until acknowledged)
//!                     Failed: no_known_good_version
//!
//! every terminal state: archived to the ledger
//! ```
//!
//! The cooldown opens in the same batch as the episode, so a process that
//! dies mid-revert still leaves deploys blocked.

use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use rollguard_core::Clock;
use rollguard_health::reset_writes;
use rollguard_state::*;

use crate::cooldown::CooldownGate;
use crate::error::{GuardError, GuardResult, RevertError};
use crate::policy::GuardPolicy;
use crate::revert::RevertAction;

/// Error recorded on an episode that had nothing safe to revert to.
pub const NO_KNOWN_GOOD_VERSION: &str = "no_known_good_version";

/// What a status change led to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// The new status is not `Failed`.
    NotTriggered,
    /// An episode already covers this failure.
    AlreadyHandled { episode_id: Option<String> },
    Reverted {
        episode: RollbackEpisode,
        cooldown: CooldownWindow,
    },
    RevertFailed {
        episode: RollbackEpisode,
        cooldown: CooldownWindow,
    },
    /// No version was ever proven healthy; nothing was reverted.
    NoRollbackTarget {
        episode: RollbackEpisode,
        cooldown: CooldownWindow,
    },
}

impl RollbackOutcome {
    /// The episode this call opened, if it opened one.
    pub fn episode(&self) -> Option<&RollbackEpisode> {
        match self {
            RollbackOutcome::Reverted { episode, .. }
            | RollbackOutcome::RevertFailed { episode, .. }
            | RollbackOutcome::NoRollbackTarget { episode, .. } => Some(episode),
            _ => None,
        }
    }
}

enum Opening {
    Opened {
        episode: RollbackEpisode,
        cooldown: CooldownWindow,
    },
    Handled {
        current: Option<RollbackEpisode>,
    },
    /// The persisted verdict has already moved on.
    Stale,
}

#[derive(Clone)]
pub struct RollbackController {
    store: StateStore,
    reverter: Arc<dyn RevertAction>,
    cooldown: CooldownGate,
    policy: GuardPolicy,
    clock: Arc<dyn Clock>,
}

impl RollbackController {
    pub fn new(
        store: StateStore,
        reverter: Arc<dyn RevertAction>,
        cooldown: CooldownGate,
        policy: GuardPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            reverter,
            cooldown,
            policy,
            clock,
        }
    }

    /// React to a verdict change observed for `target`.
    ///
    /// Triggers when `new` is `Failed`, `previous` is not, and no episode is
    /// open. A `previous` of `Failed` only triggers when no episode answered
    /// the current failure streak, which covers an opener that lost its
    /// write to contention.
    pub async fn on_status_change(
        &self,
        target: &str,
        previous: HealthStatus,
        new: HealthStatus,
    ) -> GuardResult<RollbackOutcome> {
        if new != HealthStatus::Failed {
            return Ok(RollbackOutcome::NotTriggered);
        }

        let now = self.clock.now();
        let opening = retry_cas(&self.policy.retry, "open rollback episode", || {
            self.try_open(target, previous, now)
        })
        .await?;

        let (episode, cooldown) = match opening {
            Opening::Stale => return Ok(RollbackOutcome::NotTriggered),
            Opening::Handled { current } => {
                if let Some(episode) = &current {
                    if episode.is_open() && self.policy.extend_cooldown_on_failure {
                        self.cooldown.restart(now, episode).await?;
                    }
                }
                let episode_id = current.map(|e| e.episode_id);
                debug!(%target, ?episode_id, "failure already handled");
                return Ok(RollbackOutcome::AlreadyHandled { episode_id });
            }
            Opening::Opened { episode, cooldown } => (episode, cooldown),
        };

        warn!(
            %target,
            episode_id = %episode.episode_id,
            failing_version = ?episode.failing_version,
            revert_to = ?episode.revert_to,
            "health failed, rollback episode opened"
        );

        let Some(revert_to) = episode.revert_to.clone() else {
            error!(
                %target,
                episode_id = %episode.episode_id,
                "no known-good version to revert to, deploys blocked"
            );
            return Ok(RollbackOutcome::NoRollbackTarget { episode, cooldown });
        };

        let result = match tokio::time::timeout(
            self.policy.revert_timeout,
            self.reverter.revert(target, &revert_to),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RevertError::TimedOut(self.policy.revert_timeout)),
        };

        let now = self.clock.now();
        let (episode, cooldown) = retry_cas(&self.policy.retry, "close rollback episode", || {
            self.try_close(&episode, &result, now)
        })
        .await?;

        match result {
            Ok(()) => {
                info!(
                    %target,
                    episode_id = %episode.episode_id,
                    version = %revert_to,
                    cooldown_until = cooldown.expires_at(),
                    "rollback succeeded"
                );
                Ok(RollbackOutcome::Reverted { episode, cooldown })
            }
            Err(e) => {
                error!(
                    %target,
                    episode_id = %episode.episode_id,
                    version = %revert_to,
                    error = %e,
                    "rollback failed, operator attention required"
                );
                Ok(RollbackOutcome::RevertFailed { episode, cooldown })
            }
        }
    }

    fn try_open(&self, target: &str, previous: HealthStatus, now: u64) -> StateResult<Opening> {
        let episode_key = keys::episode(target);
        let current = self.store.get_json::<RollbackEpisode>(&episode_key)?;
        if let Some(episode) = &current {
            if episode.value.is_open() {
                return Ok(Opening::Handled {
                    current: Some(episode.value.clone()),
                });
            }
        }

        let record = self
            .store
            .get_json::<HealthRecord>(&keys::health_status(target))?
            .map(|r| r.value);
        let stale = match &record {
            Some(record) => record.status != HealthStatus::Failed,
            None => previous == HealthStatus::Failed,
        };
        if stale {
            return Ok(Opening::Stale);
        }
        let streak = record.and_then(|r| r.failed_streak);
        // Only a failed -> failed observation can be a repeat of a streak an
        // earlier episode already answered.
        let answered = previous == HealthStatus::Failed
            && streak.is_some()
            && current
                .as_ref()
                .is_some_and(|e| e.value.failed_streak == streak);
        if answered {
            return Ok(Opening::Handled {
                current: current.map(|e| e.value),
            });
        }

        let failing_version = self
            .store
            .get_json::<LiveVersion>(&keys::live_version(target))?
            .map(|l| l.value.version_id);

        let known_good_key = keys::known_good(target);
        let known_good_read = self.store.get_json::<KnownGoodLedger>(&known_good_key)?;
        let mut known_good = known_good_read
            .as_ref()
            .map(|l| l.value.clone())
            .unwrap_or_default();
        let revert_to = known_good
            .rollback_candidate(failing_version.as_deref())
            .map(|e| e.version_id.clone());
        let revoked = failing_version
            .as_deref()
            .is_some_and(|v| known_good.revoke(v));

        let mut episode = RollbackEpisode {
            episode_id: new_episode_id(now),
            target: target.to_string(),
            triggered_at: now,
            failed_streak: streak,
            failing_version,
            revert_to,
            status: EpisodeStatus::Pending,
            completed_at: None,
            error: None,
            acknowledged_at: None,
        };

        let mut writes = Vec::new();
        if revoked {
            writes.push(FlagWrite::json(
                known_good_key,
                version_of(&known_good_read),
                &known_good,
            )?);
        }

        if episode.revert_to.is_none() {
            episode.status = EpisodeStatus::Failed;
            episode.completed_at = Some(now);
            episode.error = Some(NO_KNOWN_GOOD_VERSION.to_string());
            writes.push(FlagWrite::json(
                keys::ledger_entry(target, &episode.episode_id),
                ABSENT,
                &episode,
            )?);
        }
        let (write, cooldown) = self.cooldown.open_write(now, &episode)?;
        writes.extend(write);
        writes.push(FlagWrite::json(episode_key, version_of(&current), &episode)?);

        self.store.apply(&writes, now)?;
        Ok(Opening::Opened { episode, cooldown })
    }

    fn try_close(
        &self,
        pending: &RollbackEpisode,
        result: &Result<(), RevertError>,
        now: u64,
    ) -> StateResult<(RollbackEpisode, CooldownWindow)> {
        let target = pending.target.as_str();
        let episode_key = keys::episode(target);
        let current = self.store.get_json::<RollbackEpisode>(&episode_key)?;

        let mut closed = pending.clone();
        closed.completed_at = Some(now);
        match result {
            Ok(()) => closed.status = EpisodeStatus::Succeeded,
            Err(e) => {
                closed.status = EpisodeStatus::Failed;
                closed.error = Some(e.to_string());
            }
        }

        let mut writes = Vec::new();
        let still_ours = current.as_ref().is_some_and(|c| {
            c.value.episode_id == pending.episode_id && c.value.status == EpisodeStatus::Pending
        });
        if still_ours {
            writes.push(FlagWrite::json(&episode_key, version_of(&current), &closed)?);
            writes.push(FlagWrite::json(
                keys::ledger_entry(target, &closed.episode_id),
                ABSENT,
                &closed,
            )?);
            if let (Ok(()), Some(version)) = (result, &closed.revert_to) {
                writes.extend(reset_writes(&self.store, target, version, now)?);
            }
        } else {
            // An operator abandoned the episode while the revert ran.
            warn!(
                %target,
                episode_id = %pending.episode_id,
                "episode closed elsewhere, recording cooldown only"
            );
            if let Some(current) = current {
                closed = current.value;
            }
        }

        let (write, cooldown) = self.cooldown.settle_write(now, &closed)?;
        writes.extend(write);
        self.store.apply(&writes, now)?;
        Ok((closed, cooldown))
    }

    /// Operator acknowledgement of a failed episode, so a later failure can
    /// trigger again.
    ///
    /// A pending episode older than the revert timeout is one whose revert
    /// never reported back; it is closed as failed and acknowledged.
    pub async fn acknowledge_episode(&self, target: &str) -> GuardResult<RollbackEpisode> {
        let now = self.clock.now();
        let episode = retry_cas(&self.policy.retry, "acknowledge rollback episode", || {
            self.try_acknowledge(target, now)
        })
        .await??;
        info!(%target, episode_id = %episode.episode_id, "rollback episode acknowledged");
        Ok(episode)
    }

    fn try_acknowledge(&self, target: &str, now: u64) -> StateResult<GuardResult<RollbackEpisode>> {
        let episode_key = keys::episode(target);
        let Some(current) = self.store.get_json::<RollbackEpisode>(&episode_key)? else {
            return Ok(Err(GuardError::NoOpenEpisode(target.to_string())));
        };

        let mut episode = current.value.clone();
        let mut abandoned = false;
        match episode.status {
            EpisodeStatus::Failed if episode.acknowledged_at.is_none() => {}
            EpisodeStatus::Pending => {
                let stale_at = episode
                    .triggered_at
                    .saturating_add(self.policy.revert_timeout.as_secs());
                if now <= stale_at {
                    return Ok(Err(GuardError::EpisodeInFlight {
                        target: target.to_string(),
                        episode_id: episode.episode_id,
                    }));
                }
                episode.status = EpisodeStatus::Failed;
                episode.completed_at = Some(now);
                episode.error = Some("abandoned: revert outcome unknown".to_string());
                abandoned = true;
            }
            _ => return Ok(Err(GuardError::NoOpenEpisode(target.to_string()))),
        }
        episode.acknowledged_at = Some(now);

        let ledger_key = keys::ledger_entry(target, &episode.episode_id);
        let ledger_read = self.store.get(&ledger_key)?;
        let mut writes = vec![
            FlagWrite::json(&episode_key, current.version, &episode)?,
            FlagWrite::json(ledger_key, ledger_read.map_or(ABSENT, |f| f.version), &episode)?,
        ];
        if abandoned {
            // A failed revert blocks deploys, whether or not it reported back.
            let (write, _) = self.cooldown.settle_write(now, &episode)?;
            writes.extend(write);
        }
        self.store.apply(&writes, now)?;
        Ok(Ok(episode))
    }

    /// The episode currently guarding `target`, open or not.
    pub fn current_episode(&self, target: &str) -> StateResult<Option<RollbackEpisode>> {
        Ok(self
            .store
            .get_json::<RollbackEpisode>(&keys::episode(target))?
            .map(|e| e.value))
    }

    /// Episode history for `target`, oldest first, including one in flight.
    pub fn episodes(&self, target: &str) -> StateResult<Vec<RollbackEpisode>> {
        let mut episodes = self
            .store
            .list_prefix(&keys::ledger_prefix(target))?
            .iter()
            .map(|flag| flag.decode::<RollbackEpisode>().map(|e| e.value))
            .collect::<StateResult<Vec<_>>>()?;

        if let Some(current) = self.current_episode(target)? {
            if !episodes.iter().any(|e| e.episode_id == current.episode_id) {
                episodes.push(current);
            }
        }
        episodes.sort_by(|a, b| {
            a.triggered_at
                .cmp(&b.triggered_at)
                .then_with(|| a.episode_id.cmp(&b.episode_id))
        });
        Ok(episodes)
    }
}

fn new_episode_id(now: u64) -> String {
    format!("{now}-{:08x}", rand::rng().random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use rollguard_core::ManualClock;
    use rollguard_health::{HealthEvaluator, ProbeResult};

    use crate::revert::RevertFuture;
    use crate::revert::tests::RecordingRevert;

    const T0: u64 = 1_700_000_000;

    struct Harness {
        store: StateStore,
        clock: Arc<ManualClock>,
        evaluator: HealthEvaluator,
        controller: RollbackController,
    }

    fn harness(reverter: Arc<dyn RevertAction>, policy: GuardPolicy) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let evaluator = HealthEvaluator::new(store.clone(), policy.retry, clock.clone());
        let cooldown = CooldownGate::new(store.clone(), policy.clone());
        let controller =
            RollbackController::new(store.clone(), reverter, cooldown, policy, clock.clone());
        Harness {
            store,
            clock,
            evaluator,
            controller,
        }
    }

    impl Harness {
        /// Record one probe and feed the transition to the controller.
        async fn probe(&self, target: &str, passed: bool) -> RollbackOutcome {
            self.clock.advance(Duration::from_secs(60));
            let now = self.clock.now();
            let probe = if passed {
                ProbeResult::pass(target, now)
            } else {
                ProbeResult::fail(target, now)
            };
            let eval = self.evaluator.record(&probe).await.unwrap();
            self.controller
                .on_status_change(target, eval.previous, eval.status)
                .await
                .unwrap()
        }

        /// Deploy `version` and prove it healthy.
        async fn deploy_healthy(&self, target: &str, version: &str) {
            self.evaluator.record_deploy(target, version).await.unwrap();
            for _ in 0..3 {
                self.probe(target, true).await;
            }
        }

        async fn fail_three(&self, target: &str) -> Vec<RollbackOutcome> {
            let mut outcomes = Vec::new();
            for _ in 0..3 {
                outcomes.push(self.probe(target, false).await);
            }
            outcomes
        }
    }

    #[tokio::test]
    async fn reverts_to_last_known_good() {
        let reverter = RecordingRevert::succeeding();
        let h = harness(reverter.clone(), GuardPolicy::default());
        h.deploy_healthy("api", "v1").await;
        h.evaluator.record_deploy("api", "v2").await.unwrap();

        let outcomes = h.fail_three("api").await;
        assert_eq!(outcomes[0], RollbackOutcome::NotTriggered);
        assert_eq!(outcomes[1], RollbackOutcome::NotTriggered);
        let RollbackOutcome::Reverted { episode, cooldown } = &outcomes[2] else {
            panic!("expected a revert, got {:?}", outcomes[2]);
        };

        assert_eq!(episode.failing_version.as_deref(), Some("v2"));
        assert_eq!(episode.revert_to.as_deref(), Some("v1"));
        assert_eq!(episode.status, EpisodeStatus::Succeeded);
        assert_eq!(cooldown.duration_secs, 14 * 24 * 3600);
        assert_eq!(
            *reverter.calls.lock().unwrap(),
            vec![("api".to_string(), "v1".to_string())]
        );

        // v1 is live again with a fresh, healthy window.
        let health = h.evaluator.health("api").unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.window.is_empty());
        assert_eq!(health.live_version.unwrap().version_id, "v1");
        assert!(!health.known_good.entries.iter().any(|e| e.version_id == "v2"));
    }

    #[tokio::test]
    async fn repeated_failures_never_revert_twice() {
        let reverter = RecordingRevert::failing();
        let h = harness(reverter.clone(), GuardPolicy::default());
        h.deploy_healthy("api", "v1").await;
        h.evaluator.record_deploy("api", "v2").await.unwrap();

        let outcomes = h.fail_three("api").await;
        let RollbackOutcome::RevertFailed { episode, .. } = &outcomes[2] else {
            panic!("expected a failed revert, got {:?}", outcomes[2]);
        };
        assert!(episode.is_open());

        for _ in 0..5 {
            let outcome = h.probe("api", false).await;
            assert_eq!(
                outcome,
                RollbackOutcome::AlreadyHandled {
                    episode_id: Some(episode.episode_id.clone())
                }
            );
        }
        assert_eq!(reverter.call_count(), 1);
        assert_eq!(h.controller.episodes("api").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn a_pass_and_new_failure_during_open_episode_does_not_retrigger() {
        let reverter = RecordingRevert::failing();
        let h = harness(reverter.clone(), GuardPolicy::default());
        h.deploy_healthy("api", "v1").await;
        h.evaluator.record_deploy("api", "v2").await.unwrap();
        h.fail_three("api").await;

        // failed -> degraded -> failed again while the episode is still open.
        h.probe("api", true).await;
        let outcome = h.fail_three("api").await.pop().unwrap();
        assert!(matches!(outcome, RollbackOutcome::AlreadyHandled { .. }));
        assert_eq!(reverter.call_count(), 1);
    }

    #[tokio::test]
    async fn first_deploy_failing_has_no_rollback_target() {
        let reverter = RecordingRevert::succeeding();
        let h = harness(reverter.clone(), GuardPolicy::default());
        h.evaluator.record_deploy("api", "v1").await.unwrap();

        let outcome = h.fail_three("api").await.pop().unwrap();
        let RollbackOutcome::NoRollbackTarget { episode, cooldown } = outcome else {
            panic!("expected no rollback target, got {outcome:?}");
        };
        assert_eq!(episode.status, EpisodeStatus::Failed);
        assert_eq!(episode.error.as_deref(), Some(NO_KNOWN_GOOD_VERSION));
        assert!(cooldown.is_active(h.clock.now()));
        assert_eq!(reverter.call_count(), 0);

        // Archived immediately since it is already terminal.
        let history = h.controller.episodes("api").unwrap();
        assert_eq!(history, vec![episode]);
    }

    #[tokio::test]
    async fn known_good_never_includes_the_failing_version() {
        let reverter = RecordingRevert::succeeding();
        let h = harness(reverter.clone(), GuardPolicy::default());
        h.deploy_healthy("api", "v1").await;
        // v2 was proven healthy once, then degrades in place.
        h.deploy_healthy("api", "v2").await;

        let outcome = h.fail_three("api").await.pop().unwrap();
        let episode = outcome.episode().unwrap();
        assert_eq!(episode.failing_version.as_deref(), Some("v2"));
        assert_eq!(episode.revert_to.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn revert_timeout_is_a_failure() {
        let reverter = RecordingRevert::hanging(Duration::from_secs(60));
        let policy = GuardPolicy {
            revert_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness(reverter, policy);
        h.deploy_healthy("api", "v1").await;
        h.evaluator.record_deploy("api", "v2").await.unwrap();

        let outcome = h.fail_three("api").await.pop().unwrap();
        let RollbackOutcome::RevertFailed { episode, .. } = outcome else {
            panic!("expected a failed revert, got {outcome:?}");
        };
        assert!(episode.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn acknowledge_reopens_triggering() {
        let reverter = RecordingRevert::failing();
        let h = harness(reverter.clone(), GuardPolicy::default());
        h.deploy_healthy("api", "v1").await;
        h.evaluator.record_deploy("api", "v2").await.unwrap();
        h.fail_three("api").await;

        let acked = h.controller.acknowledge_episode("api").await.unwrap();
        assert!(!acked.is_open());
        assert!(matches!(
            h.controller.acknowledge_episode("api").await,
            Err(GuardError::NoOpenEpisode(_))
        ));

        // The same failure streak is not answered twice.
        let outcome = h.probe("api", false).await;
        assert!(matches!(outcome, RollbackOutcome::AlreadyHandled { .. }));
        assert_eq!(reverter.call_count(), 1);

        // A new streak after recovery is.
        for _ in 0..3 {
            h.probe("api", true).await;
        }
        let outcome = h.fail_three("api").await.pop().unwrap();
        assert!(matches!(outcome, RollbackOutcome::RevertFailed { .. }));
        assert_eq!(reverter.call_count(), 2);

        // Ledger holds both, the first one acknowledged.
        let history = h.controller.episodes("api").unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].acknowledged_at.is_some());
    }

    #[tokio::test]
    async fn pending_episode_cannot_be_acknowledged_until_stale() {
        let h = harness(RecordingRevert::succeeding(), GuardPolicy::default());
        let pending = RollbackEpisode {
            episode_id: "ep-1".to_string(),
            target: "api".to_string(),
            triggered_at: T0,
            failed_streak: Some(3),
            failing_version: Some("v2".to_string()),
            revert_to: Some("v1".to_string()),
            status: EpisodeStatus::Pending,
            completed_at: None,
            error: None,
            acknowledged_at: None,
        };
        h.store
            .apply(
                &[FlagWrite::json(keys::episode("api"), ABSENT, &pending).unwrap()],
                T0,
            )
            .unwrap();

        assert!(matches!(
            h.controller.acknowledge_episode("api").await,
            Err(GuardError::EpisodeInFlight { .. })
        ));

        h.clock.advance(Duration::from_secs(31));
        let episode = h.controller.acknowledge_episode("api").await.unwrap();
        assert_eq!(episode.status, EpisodeStatus::Failed);
        assert!(episode.acknowledged_at.is_some());
        assert_eq!(h.controller.episodes("api").unwrap().len(), 1);

        // The abandoned revert still blocks deploys.
        let window = h
            .store
            .get_json::<CooldownWindow>(keys::COOLDOWN)
            .unwrap()
            .unwrap()
            .value;
        assert!(window.is_active(h.clock.now()));
        assert_eq!(window.episode_id.as_deref(), Some("ep-1"));
    }

    /// Captures the cooldown flag as it stands while the revert runs.
    struct CooldownSnapshotRevert {
        store: StateStore,
        seen: std::sync::Mutex<Option<CooldownWindow>>,
    }

    impl RevertAction for CooldownSnapshotRevert {
        fn revert<'a>(&'a self, _target: &'a str, _version_id: &'a str) -> RevertFuture<'a> {
            Box::pin(async move {
                let window = self
                    .store
                    .get_json::<CooldownWindow>(keys::COOLDOWN)
                    .map_err(|e| RevertError::Transport(e.to_string()))?
                    .map(|w| w.value);
                *self.seen.lock().unwrap() = window;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn cooldown_is_open_before_the_revert_runs() {
        let store = StateStore::open_in_memory().unwrap();
        let reverter = Arc::new(CooldownSnapshotRevert {
            store: store.clone(),
            seen: std::sync::Mutex::new(None),
        });
        let policy = GuardPolicy::default();
        let clock = Arc::new(ManualClock::new(T0));
        let h = Harness {
            evaluator: HealthEvaluator::new(store.clone(), policy.retry, clock.clone()),
            controller: RollbackController::new(
                store.clone(),
                reverter.clone(),
                CooldownGate::new(store.clone(), policy.clone()),
                policy,
                clock.clone(),
            ),
            store,
            clock,
        };
        h.deploy_healthy("api", "v1").await;
        h.evaluator.record_deploy("api", "v2").await.unwrap();

        let RollbackOutcome::Reverted { episode, cooldown } = h.fail_three("api").await.pop().unwrap()
        else {
            panic!("expected a revert");
        };
        let seen = reverter.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.episode_id.as_deref(), Some(episode.episode_id.as_str()));
        assert!(seen.is_active(h.clock.now()));
        // Closing the episode keeps the window it opened with.
        assert_eq!(cooldown, seen);
    }

    #[tokio::test]
    async fn new_streak_triggers_even_when_timestamps_repeat() {
        let reverter = RecordingRevert::succeeding();
        let h = harness(reverter.clone(), GuardPolicy::default());

        // The scheduler stamps every result with the same time.
        let fixture = &h;
        let record = move |passed: bool| {
            let probe = if passed {
                ProbeResult::pass("api", 1_000)
            } else {
                ProbeResult::fail("api", 1_000)
            };
            let h = fixture;
            async move {
                let eval = h.evaluator.record(&probe).await.unwrap();
                h.controller
                    .on_status_change("api", eval.previous, eval.status)
                    .await
                    .unwrap()
            }
        };

        h.evaluator.record_deploy("api", "v1").await.unwrap();
        for _ in 0..3 {
            record(true).await;
        }
        h.evaluator.record_deploy("api", "v2").await.unwrap();
        record(false).await;
        record(false).await;
        let first = record(false).await;
        assert!(matches!(first, RollbackOutcome::Reverted { .. }));

        // v1 is live again; prove it, then a new failing deploy.
        for _ in 0..3 {
            record(true).await;
        }
        h.evaluator.record_deploy("api", "v3").await.unwrap();
        record(false).await;
        record(false).await;
        let second = record(false).await;
        let RollbackOutcome::Reverted { episode, .. } = second else {
            panic!("second failure was not reverted: {second:?}");
        };
        assert_eq!(episode.failing_version.as_deref(), Some("v3"));
        assert_eq!(episode.revert_to.as_deref(), Some("v1"));
        assert_eq!(reverter.call_count(), 2);
        assert_eq!(h.controller.episodes("api").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missed_transition_is_reconciled_once() {
        let reverter = RecordingRevert::succeeding();
        let h = harness(reverter.clone(), GuardPolicy::default());
        h.deploy_healthy("api", "v1").await;
        h.evaluator.record_deploy("api", "v2").await.unwrap();

        // Reach failed without telling the controller.
        for _ in 0..3 {
            h.clock.advance(Duration::from_secs(60));
            let now = h.clock.now();
            h.evaluator.record(&ProbeResult::fail("api", now)).await.unwrap();
        }

        // The next failed observation sees failed -> failed and still triggers.
        let outcome = h.probe("api", false).await;
        assert!(matches!(outcome, RollbackOutcome::Reverted { .. }));
        assert_eq!(reverter.call_count(), 1);
    }

    #[tokio::test]
    async fn extension_policy_restarts_cooldown_on_repeat_failures() {
        let policy = GuardPolicy {
            extend_cooldown_on_failure: true,
            cooldown: Duration::from_secs(600),
            ..Default::default()
        };
        let h = harness(RecordingRevert::failing(), policy);
        h.deploy_healthy("api", "v1").await;
        h.evaluator.record_deploy("api", "v2").await.unwrap();

        let RollbackOutcome::RevertFailed { cooldown, .. } = h.fail_three("api").await.pop().unwrap()
        else {
            panic!("expected a failed revert");
        };
        h.probe("api", false).await;

        let window = h
            .store
            .get_json::<CooldownWindow>(keys::COOLDOWN)
            .unwrap()
            .unwrap()
            .value;
        assert!(window.started_at > cooldown.started_at);
    }

    #[tokio::test]
    async fn default_policy_keeps_cooldown_on_repeat_failures() {
        let h = harness(RecordingRevert::failing(), GuardPolicy::default());
        h.deploy_healthy("api", "v1").await;
        h.evaluator.record_deploy("api", "v2").await.unwrap();

        let RollbackOutcome::RevertFailed { cooldown, .. } = h.fail_three("api").await.pop().unwrap()
        else {
            panic!("expected a failed revert");
        };
        h.probe("api", false).await;

        let window = h
            .store
            .get_json::<CooldownWindow>(keys::COOLDOWN)
            .unwrap()
            .unwrap()
            .value;
        assert_eq!(window, cooldown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_observers_open_one_episode() {
        let reverter = RecordingRevert::hanging(Duration::from_millis(100));
        let h = harness(reverter.clone(), GuardPolicy::default());
        h.deploy_healthy("api", "v1").await;
        h.evaluator.record_deploy("api", "v2").await.unwrap();
        for _ in 0..3 {
            h.clock.advance(Duration::from_secs(60));
            let now = h.clock.now();
            h.evaluator.record(&ProbeResult::fail("api", now)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let controller = h.controller.clone();
            handles.push(tokio::spawn(async move {
                controller
                    .on_status_change("api", HealthStatus::Degraded, HealthStatus::Failed)
                    .await
                    .unwrap()
            }));
        }
        let mut opened = 0;
        for handle in handles {
            match handle.await.unwrap() {
                RollbackOutcome::AlreadyHandled { .. } => {}
                RollbackOutcome::Reverted { .. } => opened += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(opened, 1);
        assert_eq!(reverter.call_count(), 1);
    }
}
