//! rollguard-state — versioned flag store for rollguard.
//!
//! Backed by [redb](https://docs.rs/redb), holds every piece of state that
//! must survive between invocations: health windows and verdicts, version
//! metadata, the rollback episode ledger, and the cooldown window.
//!
//! # Architecture
//!
//! One table of [`Flag`] rows `(key, value, version, updated_at)`. Values
//! are JSON documents; the typed records in [`types`] describe what lives
//! under each well-known key in [`keys`].
//!
//! There is no raw put. Writers pass the version they read and the write
//! commits only if nobody got there first; [`retry_cas`] wraps the
//! read-modify-write loop. Readers use redb read transactions and never
//! block on writers.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod retry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use retry::{retry_cas, RetryPolicy};
pub use store::StateStore;
pub use types::*;
