//! Sliding health window and the verdict derived from it.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use rollguard_state::{HealthStatus, VersionId};

/// Number of most recent probe results a verdict is computed from.
pub const WINDOW_SIZE: usize = 3;

/// One folded probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub passed: bool,
    pub observed_at: u64,
    /// Version that was live when the probe ran.
    pub version_id: Option<VersionId>,
}

/// Most recent probe results for one target, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HealthWindow {
    entries: VecDeque<WindowEntry>,
    /// Every result ever folded into this window, including evicted ones.
    #[serde(default)]
    total_recorded: u64,
}

impl HealthWindow {
    pub fn push(&mut self, entry: WindowEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > WINDOW_SIZE {
            self.entries.pop_front();
        }
        self.total_recorded += 1;
    }

    /// Drop all entries, keeping the lifetime counter.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> impl Iterator<Item = &WindowEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    pub fn status(&self) -> HealthStatus {
        derive_status(self.entries.iter().map(|e| e.passed))
    }

    /// The version this window proves healthy, if any.
    ///
    /// Requires a full window of passes, all observed on the same version.
    pub fn proven_version(&self) -> Option<&str> {
        if self.entries.len() < WINDOW_SIZE || self.entries.iter().any(|e| !e.passed) {
            return None;
        }
        let first = self.entries.front()?.version_id.as_deref()?;
        self.entries
            .iter()
            .all(|e| e.version_id.as_deref() == Some(first))
            .then_some(first)
    }

    /// Version of the newest entry.
    pub fn latest_version(&self) -> Option<&str> {
        self.entries.back()?.version_id.as_deref()
    }
}

/// Verdict for a sequence of pass/fail results, oldest first.
///
/// Only the last [`WINDOW_SIZE`] results count. Missing slots are treated
/// as "not failed", so fewer than three results can never be `Failed`.
pub fn derive_status<I>(results: I) -> HealthStatus
where
    I: IntoIterator<Item = bool>,
{
    let results: Vec<bool> = results.into_iter().collect();
    let recent = &results[results.len().saturating_sub(WINDOW_SIZE)..];
    let failures = recent.iter().filter(|passed| !**passed).count();

    if failures == 0 {
        HealthStatus::Healthy
    } else if failures == WINDOW_SIZE {
        HealthStatus::Failed
    } else {
        HealthStatus::Degraded
    }
}
