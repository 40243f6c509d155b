pub mod config;
pub mod time;

pub use config::{ConfigError, GuardConfig, GuardSection, RevertConfig, TargetConfig};
pub use time::{epoch_secs, parse_duration, Clock, ManualClock, SystemClock};
