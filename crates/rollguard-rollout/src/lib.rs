//! rollguard rollback control — episodes, revert actions, and the gates
//! a deployment pipeline asks before shipping.
//!
//! # Components
//!
//! - **`controller`** — opens at most one rollback episode per failure
//!   streak and calls the revert action once
//! - **`cooldown`** — global deploy block opened by every episode
//! - **`gate`** — `authorize(target)`: cooldown, open episode, then health
//! - **`revert`** — the platform seam (webhook, command)
//! - **`guard`** — facade wiring the evaluator, controller, and gates
//!
//! # Flow
//!
//! ```text
//! Guard::record(probe)
//!   ├── HealthEvaluator::record → (previous, status)
//!   └── RollbackController::on_status_change
//!         └── Failed, no episode → CAS open → revert → close + cooldown
//!
//! Guard::authorize(target)
//!   └── cooldown_active | rollback_unresolved | health_not_clear | allowed
//! ```

pub mod controller;
pub mod cooldown;
pub mod error;
pub mod gate;
pub mod guard;
pub mod policy;
pub mod revert;

pub use controller::{RollbackController, RollbackOutcome, NO_KNOWN_GOOD_VERSION};
pub use cooldown::CooldownGate;
pub use error::{GuardError, GuardResult, RevertError};
pub use gate::{BlockReason, DeploymentGate, GateDecision};
pub use guard::{Guard, ProbeReport};
pub use policy::GuardPolicy;
pub use revert::{
    CommandRevert, RevertAction, RevertFuture, UnconfiguredRevert, WebhookRevert,
};
