//! Engine configuration
//!
//! Loaded from YAML, overridable from `DATAHUB_*` environment variables.
//! Connection strings for sources live on the source definitions, never
//! here, and are never logged.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Process-wide cap on concurrent executions
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Seconds between due-task scans
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Dispatch queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Event bus capacity (drop-oldest beyond this)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Seconds a cancelled execution gets to reach a terminal state
    #[serde(default = "default_graceful_shutdown")]
    pub graceful_shutdown_timeout_secs: u64,

    /// Directory for per-execution event logs (None disables)
    #[serde(default)]
    pub event_log_dir: Option<String>,

    /// SQLite store path; None keeps everything in memory
    #[serde(default)]
    pub store_path: Option<String>,
}

fn default_max_workers() -> usize {
    4
}

fn default_check_interval() -> u64 {
    1
}

fn default_queue_capacity() -> usize {
    64
}

fn default_event_capacity() -> usize {
    8192
}

fn default_graceful_shutdown() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            check_interval_secs: default_check_interval(),
            queue_capacity: default_queue_capacity(),
            event_capacity: default_event_capacity(),
            graceful_shutdown_timeout_secs: default_graceful_shutdown(),
            event_log_dir: None,
            store_path: None,
        }
    }
}

impl EngineConfig {
    /// Load from a YAML file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.as_ref().display())))?;
        let mut config: EngineConfig =
            serde_yaml::from_str(&raw).map_err(|e| SyncError::Config(format!("bad engine config: {e}")))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for configless startup
    pub fn from_env() -> Result<Self, SyncError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("DATAHUB_MAX_WORKERS") {
            if let Ok(n) = v.parse() {
                self.max_workers = n;
            }
        }
        if let Ok(v) = std::env::var("DATAHUB_CHECK_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.check_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("DATAHUB_STORE_PATH") {
            self.store_path = Some(v);
        }
        if let Ok(v) = std::env::var("DATAHUB_EVENT_LOG_DIR") {
            self.event_log_dir = Some(v);
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_workers == 0 {
            return Err(SyncError::Config("max_workers must be > 0".into()));
        }
        if self.check_interval_secs == 0 {
            return Err(SyncError::Config("check_interval_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            check_interval: Duration::from_secs(self.check_interval_secs),
            max_workers: self.max_workers,
            queue_capacity: self.queue_capacity,
            graceful_shutdown_timeout: Duration::from_secs(self.graceful_shutdown_timeout_secs),
        }
    }
}
