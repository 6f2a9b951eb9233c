//! Configuration management for Gatekeeper.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::LockArgs;
use crate::error::{Result, ThrottleError};

/// Process-wide throttle settings.
///
/// These are read once when a throttle is built or a call is wrapped,
/// never per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleSettings {
    /// When false, wrapped calls pass straight through unthrottled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Emit retry/timeout log lines through `tracing`.
    #[serde(default)]
    pub logging: bool,

    /// Prefix prepended to the logger name of throttle log lines.
    #[serde(default)]
    pub log_prefix: String,

    /// Defaults for the shared lock.
    #[serde(default)]
    pub lock: LockSettings,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            logging: false,
            log_prefix: String::new(),
            lock: LockSettings::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Lock parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// How long a held lock lives before the backend may expire it.
    #[serde(default = "default_lock_timeout")]
    pub timeout_secs: f64,

    /// How long to wait for the lock. Defaults to the throttle timeout.
    #[serde(default)]
    pub blocking_timeout_secs: Option<f64>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout(),
            blocking_timeout_secs: None,
        }
    }
}

fn default_lock_timeout() -> f64 {
    1.0
}

impl LockSettings {
    /// Resolve into lock arguments, falling back to `throttle_timeout` for
    /// the blocking timeout.
    pub fn to_lock_args(&self, throttle_timeout: Duration) -> Result<LockArgs> {
        let timeout = secs_to_duration("lock.timeout_secs", self.timeout_secs)?;
        let blocking_timeout = match self.blocking_timeout_secs {
            Some(secs) => secs_to_duration("lock.blocking_timeout_secs", secs)?,
            None => throttle_timeout,
        };
        Ok(LockArgs {
            timeout,
            blocking_timeout,
        })
    }
}

fn secs_to_duration(field: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ThrottleError::Config(format!("Invalid {}: {} ({})", field, secs, e)))
}

impl ThrottleSettings {
    /// Load settings from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle settings");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse throttle settings: {}", e)))
    }

    /// Load settings from an optional file layered under `THROTTLE__*`
    /// environment variables (e.g. `THROTTLE__ENABLED=false`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder
            .add_source(Environment::with_prefix("THROTTLE").separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| ThrottleError::Config(format!("Failed to load throttle settings: {}", e)))
    }
}
