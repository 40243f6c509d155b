//! rollguard-health — probe results, health windows, and verdicts.
//!
//! # Architecture
//!
//! ```text
//! ProbeMonitor (optional, one task per target)
//!   └── http_probe() → ProbeResult → sink
//!
//! HealthEvaluator::record(ProbeResult)
//!   ├── read window / verdict / live version flags
//!   ├── push into HealthWindow (last 3), derive_status()
//!   └── one compare-and-set batch: window + verdict (+ known-good ledger)
//! ```
//!
//! # Verdicts
//!
//! `healthy` when none of the last three results failed (a fresh window is
//! healthy), `failed` when all three failed, `degraded` otherwise. The
//! verdict is recomputed from the window on every result and never patched.
//!
//! A version becomes *known good* once a full window of passes has been
//! observed on it; that ledger is what the rollback controller reverts to.

pub mod evaluator;
pub mod monitor;
pub mod probe;
pub mod window;

pub use evaluator::{reset_writes, Evaluation, HealthEvaluator, TargetHealth};
pub use monitor::{ProbeMonitor, ProbeSink, ProbeSpec};
pub use probe::{http_probe, ProbeResult};
pub use window::{derive_status, HealthWindow, WindowEntry, WINDOW_SIZE};
