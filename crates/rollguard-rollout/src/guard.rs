//! The `Guard` — everything a probe scheduler, pipeline, or operator calls.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use rollguard_core::{Clock, GuardConfig, SystemClock};
use rollguard_health::{Evaluation, HealthEvaluator, ProbeResult, TargetHealth};
use rollguard_state::*;

use crate::controller::{RollbackController, RollbackOutcome};
use crate::cooldown::CooldownGate;
use crate::error::{GuardError, GuardResult};
use crate::gate::{DeploymentGate, GateDecision};
use crate::policy::GuardPolicy;
use crate::revert::{self, RevertAction};

/// Result of recording one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub target: TargetId,
    pub previous: HealthStatus,
    pub status: HealthStatus,
    pub rollback: RollbackOutcome,
}

#[derive(Clone)]
pub struct Guard {
    store: StateStore,
    evaluator: HealthEvaluator,
    controller: RollbackController,
    cooldown: CooldownGate,
    gate: DeploymentGate,
    clock: Arc<dyn Clock>,
}

impl Guard {
    pub fn new(
        store: StateStore,
        reverter: Arc<dyn RevertAction>,
        policy: GuardPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let evaluator = HealthEvaluator::new(store.clone(), policy.retry, clock.clone());
        let cooldown = CooldownGate::new(store.clone(), policy.clone());
        let controller = RollbackController::new(
            store.clone(),
            reverter,
            cooldown.clone(),
            policy,
            clock.clone(),
        );
        let gate = DeploymentGate::new(store.clone(), cooldown.clone());
        Self {
            store,
            evaluator,
            controller,
            cooldown,
            gate,
            clock,
        }
    }

    /// Build a guard on the system clock with the configured revert action.
    pub fn from_config(store: StateStore, config: &GuardConfig) -> GuardResult<Self> {
        let policy = GuardPolicy::try_from(config)?;
        let reverter = revert::from_config(config.revert.as_ref());
        Ok(Self::new(store, reverter, policy, Arc::new(SystemClock)))
    }

    /// Fold a probe result in and react to the resulting verdict.
    ///
    /// A contention error after the result was persisted leaves the trigger
    /// to the next failed probe, which reconciles the missed transition.
    pub async fn record(&self, probe: &ProbeResult) -> GuardResult<ProbeReport> {
        check_target(&probe.target)?;
        let Evaluation {
            target,
            previous,
            status,
            ..
        } = self.evaluator.record(probe).await?;
        let rollback = match self.controller.on_status_change(&target, previous, status).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%target, error = %e, "rollback check failed after recording probe");
                return Err(e);
            }
        };
        Ok(ProbeReport {
            target,
            previous,
            status,
            rollback,
        })
    }

    /// Version metadata from the pipeline: `version_id` is now live.
    pub async fn record_deploy(&self, target: &str, version_id: &str) -> GuardResult<()> {
        check_target(target)?;
        Ok(self.evaluator.record_deploy(target, version_id).await?)
    }

    pub fn authorize(&self, target: &str) -> GateDecision {
        self.gate.authorize(target, self.clock.now())
    }

    /// Operator override; returns the window it ended, if one was active.
    ///
    /// This ends the cooldown only. A target whose revert failed stays
    /// blocked as `rollback_unresolved` until its episode is acknowledged.
    pub async fn clear_cooldown(&self) -> GuardResult<Option<CooldownWindow>> {
        Ok(self.cooldown.clear(self.clock.now()).await?)
    }

    pub fn cooldown(&self) -> GuardResult<Option<CooldownWindow>> {
        Ok(self.cooldown.state()?.map(|w| w.value))
    }

    pub fn is_cooldown_active(&self) -> GuardResult<bool> {
        let now = self.clock.now();
        Ok(self.cooldown()?.is_some_and(|w| w.is_active(now)))
    }

    /// Read-only status query: the raw flag behind any key.
    pub fn flag(&self, key: &str) -> GuardResult<Option<Flag>> {
        Ok(self.store.get(key)?)
    }

    pub fn health(&self, target: &str) -> GuardResult<TargetHealth> {
        Ok(self.evaluator.health(target)?)
    }

    pub fn episodes(&self, target: &str) -> GuardResult<Vec<RollbackEpisode>> {
        Ok(self.controller.episodes(target)?)
    }

    pub async fn acknowledge_episode(&self, target: &str) -> GuardResult<RollbackEpisode> {
        self.controller.acknowledge_episode(target).await
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }
}

fn check_target(target: &str) -> GuardResult<()> {
    if keys::is_valid_target(target) {
        Ok(())
    } else {
        Err(GuardError::InvalidTarget(target.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use rollguard_core::ManualClock;

    use crate::gate::BlockReason;
    use crate::revert::tests::RecordingRevert;

    const T0: u64 = 1_700_000_000;
    const FOURTEEN_DAYS: u64 = 14 * 24 * 3600;

    fn guard(reverter: Arc<RecordingRevert>) -> (Guard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let guard = Guard::new(
            StateStore::open_in_memory().unwrap(),
            reverter,
            GuardPolicy::default(),
            clock.clone(),
        );
        (guard, clock)
    }

    async fn probe(guard: &Guard, clock: &ManualClock, target: &str, passed: bool) -> ProbeReport {
        clock.advance(Duration::from_secs(60));
        let now = clock.now();
        let result = if passed {
            ProbeResult::pass(target, now)
        } else {
            ProbeResult::fail(target, now)
        };
        guard.record(&result).await.unwrap()
    }

    #[tokio::test]
    async fn failure_to_revert_to_cooldown_to_manual_clear() {
        let reverter = RecordingRevert::succeeding();
        let (guard, clock) = guard(reverter.clone());

        // v1 proven healthy, then v2 goes out.
        guard.record_deploy("api", "v1").await.unwrap();
        for _ in 0..3 {
            probe(&guard, &clock, "api", true).await;
        }
        guard.record_deploy("api", "v2").await.unwrap();
        assert!(guard.authorize("api").is_allowed());

        let mut statuses = Vec::new();
        let mut last = None;
        for _ in 0..3 {
            let report = probe(&guard, &clock, "api", false).await;
            statuses.push(report.status);
            last = Some(report);
        }
        assert_eq!(
            statuses,
            vec![HealthStatus::Degraded, HealthStatus::Degraded, HealthStatus::Failed]
        );
        let RollbackOutcome::Reverted { cooldown, .. } = last.unwrap().rollback else {
            panic!("expected a revert");
        };
        assert_eq!(reverter.call_count(), 1);
        assert_eq!(reverter.calls.lock().unwrap()[0].1, "v1");
        assert_eq!(cooldown.duration_secs, FOURTEEN_DAYS);

        assert_eq!(
            guard.authorize("api").reason(),
            Some(BlockReason::CooldownActive)
        );
        // The cooldown is global.
        assert_eq!(
            guard.authorize("web").reason(),
            Some(BlockReason::CooldownActive)
        );

        guard.clear_cooldown().await.unwrap().unwrap();
        probe(&guard, &clock, "api", true).await;
        assert!(guard.authorize("api").is_allowed());
    }

    #[tokio::test]
    async fn one_fail_then_passes_never_reverts() {
        let reverter = RecordingRevert::succeeding();
        let (guard, clock) = guard(reverter.clone());

        let mut statuses = Vec::new();
        for passed in [false, true, true] {
            let report = probe(&guard, &clock, "api", passed).await;
            assert_eq!(report.rollback, RollbackOutcome::NotTriggered);
            statuses.push(report.status);
        }
        // The fail is still inside the window after two passes.
        assert_eq!(
            statuses,
            vec![HealthStatus::Degraded, HealthStatus::Degraded, HealthStatus::Degraded]
        );
        let report = probe(&guard, &clock, "api", true).await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(reverter.call_count(), 0);
    }

    #[tokio::test]
    async fn cooldown_blocks_exactly_its_duration() {
        let reverter = RecordingRevert::succeeding();
        let (guard, clock) = guard(reverter);
        guard.record_deploy("api", "v1").await.unwrap();
        for _ in 0..3 {
            probe(&guard, &clock, "api", true).await;
        }
        guard.record_deploy("api", "v2").await.unwrap();
        for _ in 0..3 {
            probe(&guard, &clock, "api", false).await;
        }
        let start = guard.cooldown().unwrap().unwrap().started_at;

        clock.set(start + FOURTEEN_DAYS - 1);
        assert_eq!(
            guard.authorize("api").reason(),
            Some(BlockReason::CooldownActive)
        );
        assert!(guard.is_cooldown_active().unwrap());

        clock.set(start + FOURTEEN_DAYS + 1);
        assert!(guard.authorize("api").is_allowed());
        assert!(!guard.is_cooldown_active().unwrap());
    }

    #[tokio::test]
    async fn failed_revert_keeps_blocking_after_clear() {
        let reverter = RecordingRevert::failing();
        let (guard, clock) = guard(reverter);
        guard.record_deploy("api", "v1").await.unwrap();
        for _ in 0..3 {
            probe(&guard, &clock, "api", true).await;
        }
        guard.record_deploy("api", "v2").await.unwrap();
        for _ in 0..3 {
            probe(&guard, &clock, "api", false).await;
        }

        guard.clear_cooldown().await.unwrap();
        assert_eq!(
            guard.authorize("api").reason(),
            Some(BlockReason::RollbackUnresolved)
        );

        guard.acknowledge_episode("api").await.unwrap();
        assert_eq!(
            guard.authorize("api").reason(),
            Some(BlockReason::HealthNotClear)
        );
        assert_eq!(guard.episodes("api").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn three_passes_always_recover() {
        let (guard, clock) = guard(RecordingRevert::succeeding());
        for passed in [false, false, true, false] {
            probe(&guard, &clock, "api", passed).await;
        }
        for _ in 0..3 {
            probe(&guard, &clock, "api", true).await;
        }
        assert_eq!(guard.health("api").unwrap().status, HealthStatus::Healthy);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failing_probes_revert_once() {
        // Slow enough that every probe lands while the episode is pending.
        let reverter = RecordingRevert::hanging(Duration::from_millis(200));
        let (guard, clock) = guard(reverter.clone());
        guard.record_deploy("api", "v1").await.unwrap();
        for _ in 0..3 {
            probe(&guard, &clock, "api", true).await;
        }
        guard.record_deploy("api", "v2").await.unwrap();

        let now = clock.now();
        let mut handles = Vec::new();
        for i in 0..8 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard.record(&ProbeResult::fail("api", now + i)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(reverter.call_count(), 1);
        assert_eq!(guard.episodes("api").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nested_target_names_are_rejected() {
        let (guard, clock) = guard(RecordingRevert::succeeding());
        let err = guard
            .record(&ProbeResult::fail("api/x", clock.now()))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::InvalidTarget(_)));
        assert!(matches!(
            guard.record_deploy("api/x", "v1").await,
            Err(GuardError::InvalidTarget(_))
        ));
        assert!(guard.flag(&keys::health_window("api/x")).unwrap().is_none());
    }

    #[tokio::test]
    async fn flag_query_exposes_raw_state() {
        let (guard, clock) = guard(RecordingRevert::succeeding());
        assert!(guard.flag(keys::COOLDOWN).unwrap().is_none());

        probe(&guard, &clock, "api", false).await;
        let flag = guard.flag(&keys::health_status("api")).unwrap().unwrap();
        assert_eq!(flag.version, 1);
        assert!(flag.value.contains("degraded"));
    }
}
