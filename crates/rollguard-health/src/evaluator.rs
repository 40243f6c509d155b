//! Health evaluator — folds probe results into per-target verdicts.
//!
//! Each `record` is one compare-and-set batch over the target's window,
//! verdict, and known-good ledger. Concurrent probes for the same target
//! serialize on the window's version; the loser re-reads and re-applies
//! its result, so no result is dropped short of retry exhaustion.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use rollguard_core::Clock;
use rollguard_state::*;

use crate::probe::ProbeResult;
use crate::window::{HealthWindow, WindowEntry};

/// What one `record` call changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub target: TargetId,
    /// Verdict persisted before this result was folded in.
    pub previous: HealthStatus,
    pub status: HealthStatus,
    pub window: HealthWindow,
    /// Live version the result was attributed to.
    pub version_id: Option<VersionId>,
    /// Set when this result completed a known-good window for a new version.
    pub promoted_known_good: Option<VersionId>,
}

impl Evaluation {
    /// The verdict moved into `Failed` with this result.
    pub fn entered_failed(&self) -> bool {
        self.status == HealthStatus::Failed && self.previous != HealthStatus::Failed
    }
}

/// Persisted health of one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetHealth {
    pub target: TargetId,
    pub status: HealthStatus,
    pub record: Option<HealthRecord>,
    pub window: HealthWindow,
    pub live_version: Option<LiveVersion>,
    pub known_good: KnownGoodLedger,
}

#[derive(Clone)]
pub struct HealthEvaluator {
    store: StateStore,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl HealthEvaluator {
    pub fn new(store: StateStore, retry: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { store, retry, clock }
    }

    /// Fold one probe result into its target's window and persist the verdict.
    pub async fn record(&self, probe: &ProbeResult) -> StateResult<Evaluation> {
        let evaluation = retry_cas(&self.retry, "record probe", || self.try_record(probe)).await?;

        if evaluation.status != evaluation.previous {
            info!(
                target = %evaluation.target,
                from = %evaluation.previous,
                to = %evaluation.status,
                "health verdict changed"
            );
        } else {
            debug!(
                target = %evaluation.target,
                status = %evaluation.status,
                passed = probe.passed,
                "probe recorded"
            );
        }
        if let Some(version) = &evaluation.promoted_known_good {
            info!(target = %evaluation.target, %version, "version proven healthy");
        }
        Ok(evaluation)
    }

    fn try_record(&self, probe: &ProbeResult) -> StateResult<Evaluation> {
        let target = probe.target.as_str();
        let window_key = keys::health_window(target);
        let status_key = keys::health_status(target);

        let window_read = self.store.get_json::<HealthWindow>(&window_key)?;
        let status_read = self.store.get_json::<HealthRecord>(&status_key)?;
        let version_id = self
            .store
            .get_json::<LiveVersion>(&keys::live_version(target))?
            .map(|live| live.value.version_id);

        let mut window = window_read
            .as_ref()
            .map(|w| w.value.clone())
            .unwrap_or_default();
        window.push(WindowEntry {
            passed: probe.passed,
            observed_at: probe.timestamp,
            version_id: version_id.clone(),
        });
        let status = window.status();
        let previous = status_read
            .as_ref()
            .map(|r| r.value.status)
            .unwrap_or_default();

        // Streaks are numbered by the window's own counter; probe timestamps
        // come from the caller and may repeat.
        let failed_streak = match (status, previous) {
            (HealthStatus::Failed, HealthStatus::Failed) => status_read
                .as_ref()
                .and_then(|r| r.value.failed_streak)
                .or(Some(window.total_recorded())),
            (HealthStatus::Failed, _) => Some(window.total_recorded()),
            _ => None,
        };
        let record = HealthRecord {
            status,
            evaluated_at: probe.timestamp,
            version_id: version_id.clone(),
            failed_streak,
        };
        let mut writes = vec![
            FlagWrite::json(window_key, version_of(&window_read), &window)?,
            FlagWrite::json(status_key, version_of(&status_read), &record)?,
        ];

        let mut promoted_known_good = None;
        if let Some(proven) = window.proven_version() {
            let key = keys::known_good(target);
            let ledger_read = self.store.get_json::<KnownGoodLedger>(&key)?;
            let mut ledger = ledger_read
                .as_ref()
                .map(|l| l.value.clone())
                .unwrap_or_default();
            if ledger.promote(proven, probe.timestamp) {
                writes.push(FlagWrite::json(key, version_of(&ledger_read), &ledger)?);
                promoted_known_good = Some(proven.to_string());
            }
        }

        self.store.apply(&writes, self.clock.now())?;

        Ok(Evaluation {
            target: probe.target.clone(),
            previous,
            status,
            window,
            version_id,
            promoted_known_good,
        })
    }

    /// Version metadata intake: `version_id` is now live on `target`.
    ///
    /// The window restarts empty so the new version is judged on its own probes.
    pub async fn record_deploy(&self, target: &str, version_id: &str) -> StateResult<()> {
        retry_cas(&self.retry, "record deploy", || {
            let now = self.clock.now();
            let writes = reset_writes(&self.store, target, version_id, now)?;
            self.store.apply(&writes, now).map(|_| ())
        })
        .await?;
        info!(%target, version = %version_id, "live version recorded");
        Ok(())
    }

    /// Current verdict; a target never probed is `Healthy`.
    pub fn status(&self, target: &str) -> StateResult<HealthStatus> {
        Ok(self
            .store
            .get_json::<HealthRecord>(&keys::health_status(target))?
            .map(|r| r.value.status)
            .unwrap_or_default())
    }

    pub fn health(&self, target: &str) -> StateResult<TargetHealth> {
        let record = self
            .store
            .get_json::<HealthRecord>(&keys::health_status(target))?
            .map(|r| r.value);
        let window = self
            .store
            .get_json::<HealthWindow>(&keys::health_window(target))?
            .map(|w| w.value)
            .unwrap_or_default();
        let live_version = self
            .store
            .get_json::<LiveVersion>(&keys::live_version(target))?
            .map(|l| l.value);
        let known_good = self
            .store
            .get_json::<KnownGoodLedger>(&keys::known_good(target))?
            .map(|l| l.value)
            .unwrap_or_default();

        Ok(TargetHealth {
            target: target.to_string(),
            status: record.as_ref().map(|r| r.status).unwrap_or_default(),
            record,
            window,
            live_version,
            known_good,
        })
    }
}

/// Guarded writes that mark `version_id` live and restart the target's window.
///
/// Callers add their own writes and commit the batch under [`retry_cas`].
pub fn reset_writes(
    store: &StateStore,
    target: &str,
    version_id: &str,
    now: u64,
) -> StateResult<Vec<FlagWrite>> {
    let live_key = keys::live_version(target);
    let window_key = keys::health_window(target);
    let status_key = keys::health_status(target);

    let live_read = store.get_json::<LiveVersion>(&live_key)?;
    let window_read = store.get_json::<HealthWindow>(&window_key)?;
    let status_read = store.get_json::<HealthRecord>(&status_key)?;

    let mut window = window_read
        .as_ref()
        .map(|w| w.value.clone())
        .unwrap_or_default();
    if !window.is_empty() && window.status() != HealthStatus::Healthy {
        warn!(%target, status = %window.status(), "discarding unhealthy window on version change");
    }
    window.reset();

    Ok(vec![
        FlagWrite::json(
            live_key,
            version_of(&live_read),
            &LiveVersion {
                version_id: version_id.to_string(),
                since: now,
            },
        )?,
        FlagWrite::json(window_key, version_of(&window_read), &window)?,
        FlagWrite::json(
            status_key,
            version_of(&status_read),
            &HealthRecord {
                status: window.status(),
                evaluated_at: now,
                version_id: Some(version_id.to_string()),
                failed_streak: None,
            },
        )?,
    ])
}
