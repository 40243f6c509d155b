//! StateStore — redb-backed versioned flag table.
//!
//! Reads go through redb read transactions and never wait on writers.
//! Every mutation is a compare-and-set: the caller names the version it
//! read (or [`ABSENT`]) and the write commits only if that still holds.
//! Batches of guarded writes commit atomically in one write transaction.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::error::{StateError, StateResult};
use crate::tables::FLAGS;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe flag store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(FLAGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Read a flag. `None` is the NotFound case.
    pub fn get(&self, key: &str) -> StateResult<Option<Flag>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FLAGS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode_row(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Read a flag and decode its value.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<Versioned<T>>> {
        self.get(key)?.map(|flag| flag.decode()).transpose()
    }

    /// All flags whose key starts with `prefix`, in key order.
    pub fn list_prefix(&self, prefix: &str) -> StateResult<Vec<Flag>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FLAGS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(decode_row(value.value())?);
        }
        Ok(results)
    }

    // ── Compare-and-set ───────────────────────────────────────────

    /// Write `value` under `key` if the stored version equals `expected_version`.
    ///
    /// Returns the committed flag, or [`StateError::VersionConflict`].
    pub fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
        now: u64,
    ) -> StateResult<Flag> {
        let mut flags = self.apply(&[FlagWrite::new(key, expected_version, value)], now)?;
        flags
            .pop()
            .ok_or_else(|| StateError::Write(format!("{key}: empty batch result")))
    }

    /// Commit a batch of guarded writes atomically.
    ///
    /// If any write's expected version does not match, nothing is written.
    pub fn apply(&self, writes: &[FlagWrite], now: u64) -> StateResult<Vec<Flag>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match apply_in_txn(&txn, writes, now) {
            Ok(flags) => {
                txn.commit().map_err(map_err!(Transaction))?;
                trace!(count = flags.len(), "flag batch committed");
                Ok(flags)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }
}

fn apply_in_txn(txn: &WriteTransaction, writes: &[FlagWrite], now: u64) -> StateResult<Vec<Flag>> {
    let mut table = txn.open_table(FLAGS).map_err(map_err!(Table))?;
    let mut committed = Vec::with_capacity(writes.len());
    for write in writes {
        let actual = match table.get(write.key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => decode_row(guard.value())?.version,
            None => ABSENT,
        };
        if actual != write.expected_version {
            return Err(StateError::VersionConflict {
                key: write.key.clone(),
                expected: write.expected_version,
                actual,
            });
        }
        let flag = Flag {
            key: write.key.clone(),
            value: write.value.clone(),
            version: actual + 1,
            updated_at: now,
        };
        let row = serde_json::to_vec(&flag).map_err(map_err!(Serialize))?;
        table
            .insert(write.key.as_str(), row.as_slice())
            .map_err(map_err!(Write))?;
        committed.push(flag);
    }
    Ok(committed)
}

fn decode_row(bytes: &[u8]) -> StateResult<Flag> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}
