//! rollguard.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::parse_duration;

/// Default cooldown after a rollback: 14 days.
pub const DEFAULT_COOLDOWN: &str = "14d";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration for `{field}`: {value:?}")]
    Duration { field: String, value: String },

    #[error("invalid target `{name}`: {reason}")]
    Target { name: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub guard: GuardSection,
    pub revert: Option<RevertConfig>,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSection {
    /// How long deploys stay blocked after a rollback (e.g. "14d").
    pub cooldown: String,
    /// Restart the cooldown when a target fails again while a rollback is open.
    pub extend_cooldown_on_failure: bool,
    /// Upper bound on a single revert call.
    pub revert_timeout: String,
    /// Compare-and-set attempts before reporting contention.
    pub cas_max_retries: u32,
    /// Upper bound of the jittered delay between CAS attempts.
    pub cas_retry_delay_ms: u64,
}

impl Default for GuardSection {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN.to_string(),
            extend_cooldown_on_failure: false,
            revert_timeout: "30s".to_string(),
            cas_max_retries: 32,
            cas_retry_delay_ms: 2,
        }
    }
}

/// How the hosting platform's revert is invoked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RevertConfig {
    /// POST to an HTTP endpoint with a bearer token.
    Webhook {
        url: String,
        /// Name of the environment variable holding the token.
        token_env: Option<String>,
    },
    /// Run a local program; target and version are passed via environment.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// One monitored target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    pub name: String,
    /// Health endpoint, e.g. `http://127.0.0.1:8080/healthz`.
    pub url: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

fn default_interval() -> String {
    "60s".to_string()
}

fn default_timeout() -> String {
    "10s".to_string()
}

impl GuardConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GuardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every duration and target up front so the daemon fails at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cooldown()?;
        self.revert_timeout()?;
        for target in &self.targets {
            if target.name.trim().is_empty() {
                return Err(ConfigError::Target {
                    name: target.name.clone(),
                    reason: "name must not be empty".to_string(),
                });
            }
            if target.name.contains('/') {
                return Err(ConfigError::Target {
                    name: target.name.clone(),
                    reason: "name must not contain '/'".to_string(),
                });
            }
            if !target.url.starts_with("http://") {
                return Err(ConfigError::Target {
                    name: target.name.clone(),
                    reason: format!("unsupported url {}", target.url),
                });
            }
            target.interval()?;
            target.timeout()?;
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Result<Duration, ConfigError> {
        field_duration("guard.cooldown", &self.guard.cooldown)
    }

    pub fn revert_timeout(&self) -> Result<Duration, ConfigError> {
        field_duration("guard.revert_timeout", &self.guard.revert_timeout)
    }
}

impl TargetConfig {
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        field_duration(&format!("targets.{}.interval", self.name), &self.interval)
    }

    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        field_duration(&format!("targets.{}.timeout", self.name), &self.timeout)
    }
}

fn field_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field: field.to_string(),
        value: value.to_string(),
    })
}
