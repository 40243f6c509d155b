//! Domain types for the rollguard state store.
//!
//! Every piece of runtime state is a [`Flag`]: a versioned row whose value
//! is a JSON document. The typed records below are what those documents
//! hold under the well-known keys in [`keys`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Identifier of a monitored target (a service, site, or URL group).
pub type TargetId = String;

/// Identifier of a deployed version, as reported by the pipeline.
pub type VersionId = String;

// ── Flag ──────────────────────────────────────────────────────────

/// The generic persisted unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Flag {
    pub key: String,
    /// Opaque value; rollguard itself always stores JSON here.
    pub value: String,
    /// Starts at 1 and increases by one on every write.
    pub version: u64,
    /// Unix timestamp (seconds) of the last write.
    pub updated_at: u64,
}

impl Flag {
    /// Decode the value as a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> StateResult<Versioned<T>> {
        let value = serde_json::from_str(&self.value)
            .map_err(|e| StateError::Deserialize(format!("{}: {e}", self.key)))?;
        Ok(Versioned {
            value,
            version: self.version,
            updated_at: self.updated_at,
        })
    }
}

/// A typed flag value together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
    pub updated_at: u64,
}

/// Version to pass as `expected` when a key must not exist yet.
pub const ABSENT: u64 = 0;

/// Expected version for a possibly-missing read.
pub fn version_of<T>(read: &Option<Versioned<T>>) -> u64 {
    read.as_ref().map_or(ABSENT, |v| v.version)
}

/// One guarded write in an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagWrite {
    pub key: String,
    pub expected_version: u64,
    pub value: String,
}

impl FlagWrite {
    pub fn new(key: impl Into<String>, expected_version: u64, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            expected_version,
            value: value.into(),
        }
    }

    /// Serialize a typed record into a guarded write.
    pub fn json<T: Serialize>(
        key: impl Into<String>,
        expected_version: u64,
        value: &T,
    ) -> StateResult<Self> {
        let key = key.into();
        let value = serde_json::to_string(value)
            .map_err(|e| StateError::Serialize(format!("{key}: {e}")))?;
        Ok(Self {
            key,
            expected_version,
            value,
        })
    }
}

// ── Well-known keys ───────────────────────────────────────────────

pub mod keys {
    /// The global cooldown window.
    pub const COOLDOWN: &str = "deployment_cooldown_state";

    pub const HEALTH_WINDOW_PREFIX: &str = "health_window/";
    pub const HEALTH_STATUS_PREFIX: &str = "deployment_health_status/";
    pub const LIVE_VERSION_PREFIX: &str = "live_version/";
    pub const KNOWN_GOOD_PREFIX: &str = "last_known_good/";
    pub const EPISODE_PREFIX: &str = "rollback_episode/";
    pub const LEDGER_PREFIX: &str = "rollback_ledger/";

    pub fn health_window(target: &str) -> String {
        format!("{HEALTH_WINDOW_PREFIX}{target}")
    }

    pub fn health_status(target: &str) -> String {
        format!("{HEALTH_STATUS_PREFIX}{target}")
    }

    pub fn live_version(target: &str) -> String {
        format!("{LIVE_VERSION_PREFIX}{target}")
    }

    pub fn known_good(target: &str) -> String {
        format!("{KNOWN_GOOD_PREFIX}{target}")
    }

    pub fn episode(target: &str) -> String {
        format!("{EPISODE_PREFIX}{target}")
    }

    /// Prefix under which a target's archived episodes live.
    pub fn ledger_prefix(target: &str) -> String {
        format!("{LEDGER_PREFIX}{target}/")
    }

    pub fn ledger_entry(target: &str, episode_id: &str) -> String {
        format!("{LEDGER_PREFIX}{target}/{episode_id}")
    }

    /// Target names become key segments; `/` would let one target's keys
    /// fall under another's prefix.
    pub fn is_valid_target(target: &str) -> bool {
        !target.trim().is_empty() && !target.contains('/')
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Tri-state health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No failure in the window.
    #[default]
    Healthy,
    /// Some, but not all three, of the last results failed.
    Degraded,
    /// The last three results all failed.
    Failed,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failed => "failed",
        }
    }

    pub fn is_clear(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted verdict under `deployment_health_status/{target}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthRecord {
    pub status: HealthStatus,
    /// Unix timestamp of the probe that produced this verdict.
    pub evaluated_at: u64,
    /// Version that was live when the verdict was computed.
    pub version_id: Option<VersionId>,
    /// Window sequence number of the result that began the current
    /// `Failed` streak. Assigned by the evaluator, never by the caller.
    #[serde(default)]
    pub failed_streak: Option<u64>,
}

/// Version metadata under `live_version/{target}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveVersion {
    pub version_id: VersionId,
    pub since: u64,
}

/// A version observed with a full window of passing probes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnownGoodEntry {
    pub version_id: VersionId,
    pub recorded_at: u64,
}

/// Versions proven healthy for a target, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KnownGoodLedger {
    pub entries: Vec<KnownGoodEntry>,
}

impl KnownGoodLedger {
    pub const MAX_ENTRIES: usize = 8;

    /// Record `version_id` as the most recent known-good version.
    ///
    /// Returns false when it already was the most recent entry.
    pub fn promote(&mut self, version_id: &str, now: u64) -> bool {
        if self.latest().is_some_and(|e| e.version_id == version_id) {
            return false;
        }
        self.entries.retain(|e| e.version_id != version_id);
        self.entries.push(KnownGoodEntry {
            version_id: version_id.to_string(),
            recorded_at: now,
        });
        if self.entries.len() > Self::MAX_ENTRIES {
            let excess = self.entries.len() - Self::MAX_ENTRIES;
            self.entries.drain(..excess);
        }
        true
    }

    /// Drop a version that has since been proven bad.
    pub fn revoke(&mut self, version_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.version_id != version_id);
        self.entries.len() != before
    }

    pub fn latest(&self) -> Option<&KnownGoodEntry> {
        self.entries.last()
    }

    /// Most recent known-good version other than `failing`.
    pub fn rollback_candidate(&self, failing: Option<&str>) -> Option<&KnownGoodEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| Some(e.version_id.as_str()) != failing)
    }
}

// ── Rollback ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    /// Revert call in flight.
    Pending,
    Succeeded,
    Failed,
}

/// One triggered revert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackEpisode {
    pub episode_id: String,
    pub target: TargetId,
    pub triggered_at: u64,
    /// The `Failed` streak this episode answers; one episode per streak.
    pub failed_streak: Option<u64>,
    /// Version that was live and failing when the episode opened.
    pub failing_version: Option<VersionId>,
    /// Version the revert was asked to restore.
    pub revert_to: Option<VersionId>,
    pub status: EpisodeStatus,
    pub completed_at: Option<u64>,
    /// Why the episode failed, for operator attention.
    pub error: Option<String>,
    /// Set when an operator closes a failed episode.
    pub acknowledged_at: Option<u64>,
}

impl RollbackEpisode {
    /// An open episode blocks any further trigger for its target.
    pub fn is_open(&self) -> bool {
        match self.status {
            EpisodeStatus::Pending => true,
            EpisodeStatus::Failed => self.acknowledged_at.is_none(),
            EpisodeStatus::Succeeded => false,
        }
    }
}

// ── Cooldown ──────────────────────────────────────────────────────

/// Global block on new deploys following a rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CooldownWindow {
    pub started_at: u64,
    pub duration_secs: u64,
    pub manually_cleared: bool,
    pub cleared_at: Option<u64>,
    /// Episode that opened this window.
    pub episode_id: Option<String>,
    pub target: Option<TargetId>,
}

impl CooldownWindow {
    pub fn expires_at(&self) -> u64 {
        self.started_at.saturating_add(self.duration_secs)
    }

    /// Expiry is computed at read time; nothing ever rewrites the flag for it.
    pub fn is_active(&self, now: u64) -> bool {
        !self.manually_cleared && now < self.expires_at()
    }
}
