//! # Tasker Cluster Configuration
//!
//! YAML-based configuration for drivers and controllers.
//!
//! ## Architecture
//!
//! - **Single file**: `tasker-config.yaml` in the configuration directory
//! - **Environment awareness**: `development` / `test` / `production` sections
//!   are deep-merged over the base values
//! - **Defaults everywhere**: every field has a default, so a partial file is
//!   enough
//! - **Explicit validation**: zero intervals and empty paths are rejected at load
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_cluster::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let interval = manager.config().driver.check_interval();
//! let root = &manager.config().execution.workdir_root;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::{timing, workdir};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskerConfig {
    /// Set by the loader from the detected environment
    pub environment: String,
    pub database: DatabaseConfig,
    pub execution: ExecutionConfig,
    pub scheduler: SchedulerConfig,
    pub driver: DriverConfig,
    pub activity: ActivityConfig,
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://tasker.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Cluster execution controller settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Root of the sharded work directory tree
    pub workdir_root: PathBuf,
    /// Walltime hint when the tool declares none
    pub default_walltime_seconds: u64,
    pub staleness_window_seconds: u64,
    pub post_process_grace_seconds: u64,
    pub max_post_process_deferral_seconds: u64,
    /// Deepest subtask level a running job may spawn
    pub max_subtask_level: i32,
    /// Tool configuration id to the endpoint it runs on, for subtasks that
    /// name a `tool-config-id`
    pub tool_config_endpoints: BTreeMap<i64, i64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workdir_root: std::env::temp_dir().join("tasker-work"),
            default_walltime_seconds: timing::DEFAULT_WALLTIME_SECS,
            staleness_window_seconds: timing::STALENESS_WINDOW_SECS, // 8 hours
            post_process_grace_seconds: timing::POST_PROCESS_GRACE_SECS,
            max_post_process_deferral_seconds: timing::MAX_POST_PROCESS_DEFERRAL_SECS,
            max_subtask_level: 10,
            tool_config_endpoints: BTreeMap::new(),
        }
    }
}

impl ExecutionConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_seconds)
    }

    pub fn post_process_grace(&self) -> Duration {
        Duration::from_secs(self.post_process_grace_seconds)
    }

    pub fn max_post_process_deferral(&self) -> Duration {
        Duration::from_secs(self.max_post_process_deferral_seconds)
    }

    pub fn default_walltime(&self) -> Duration {
        Duration::from_secs(self.default_walltime_seconds)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Local,
    Slurm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    /// SLURM partition, cluster default when unset
    pub partition: Option<String>,
    pub extra_submit_args: Vec<String>,
    pub command_timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::Local,
            partition: None,
            extra_submit_args: Vec::new(),
            command_timeout_seconds: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

/// Task driver settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Execution endpoint this driver serves
    pub endpoint_id: i64,
    pub check_interval_seconds: u64,
    /// Liveness file holding the driver PID; removing it stops the driver
    pub heartbeat_file: Option<PathBuf>,
    pub single_task_bursts: u32,
    pub single_task_burst_pause_ms: u64,
    /// A task lock older than this is considered abandoned
    pub stale_lock_seconds: u64,
    /// Tasks updated more recently than this are left alone for one round
    pub recent_update_skip_seconds: u64,
    /// Consecutive idle rounds before asking for an extended sleep
    pub idle_rounds_before_sleep: u32,
    pub idle_sleep_seconds: u64,
    /// Cap on active tasks for the endpoint, unlimited when unset
    pub task_limit_total: Option<usize>,
    /// Cap on active tasks per user, unlimited when unset
    pub task_limit_user: Option<usize>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            endpoint_id: 1,
            check_interval_seconds: timing::DEFAULT_CHECK_INTERVAL_SECS,
            heartbeat_file: None,
            single_task_bursts: timing::SINGLE_TASK_BURSTS,
            single_task_burst_pause_ms: timing::SINGLE_TASK_BURST_PAUSE_MS,
            stale_lock_seconds: 3600, // 1 hour
            recent_update_skip_seconds: 5,
            idle_rounds_before_sleep: 3,
            idle_sleep_seconds: 3600,
            task_limit_total: None,
            task_limit_user: None,
        }
    }
}

impl DriverConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn burst_pause(&self) -> Duration {
        Duration::from_millis(self.single_task_burst_pause_ms)
    }

    pub fn stale_lock(&self) -> Duration {
        Duration::from_secs(self.stale_lock_seconds)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_secs(self.idle_sleep_seconds)
    }
}

/// Background activity driver settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub check_interval_seconds: u64,
    /// How long one activity is worked on before yielding
    pub time_slice_seconds: u64,
    /// An in-progress activity idle for longer is presumed crashed
    pub crashed_after_seconds: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: timing::DEFAULT_CHECK_INTERVAL_SECS,
            time_slice_seconds: timing::ACTIVITY_SLICE_SECS,
            crashed_after_seconds: timing::CRASHED_ACTIVITY_SECS, // 12 hours
        }
    }
}

impl ActivityConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn time_slice(&self) -> Duration {
        Duration::from_secs(self.time_slice_seconds)
    }

    pub fn crashed_after(&self) -> Duration {
        Duration::from_secs(self.crashed_after_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Name of the cooperative marker file present during archival
    pub marker_name: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            marker_name: workdir::ARCHIVE_MARKER.to_string(),
        }
    }
}

impl TaskerConfig {
    /// Reject values no driver can run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigurationError::missing_field(
                "url",
                "database",
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                "0",
                "at least one connection is required",
            ));
        }
        if self.execution.workdir_root.as_os_str().is_empty() {
            return Err(ConfigurationError::missing_field(
                "workdir_root",
                "execution",
            ));
        }

        let positive = [
            ("driver.check_interval_seconds", self.driver.check_interval_seconds),
            ("activity.check_interval_seconds", self.activity.check_interval_seconds),
            ("activity.time_slice_seconds", self.activity.time_slice_seconds),
            ("execution.staleness_window_seconds", self.execution.staleness_window_seconds),
            ("scheduler.command_timeout_seconds", self.scheduler.command_timeout_seconds),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    "0",
                    "must be greater than zero",
                ));
            }
        }

        if self.archive.marker_name.trim().is_empty() {
            return Err(ConfigurationError::missing_field(
                "marker_name",
                "archive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = TaskerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.driver.check_interval(), Duration::from_secs(10));
        assert_eq!(config.execution.staleness_window(), Duration::from_secs(8 * 3600));
        assert_eq!(config.activity.time_slice(), Duration::from_secs(15));
        assert_eq!(config.archive.marker_name, ".archiving_in_progress");
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let mut config = TaskerConfig::default();
        config.driver.check_interval_seconds = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_empty_workdir_root_is_rejected() {
        let mut config = TaskerConfig::default();
        config.execution.workdir_root = PathBuf::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::MissingField { .. })
        ));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: TaskerConfig = serde_yaml::from_str(
            "scheduler:\n  kind: slurm\n  partition: short\ndriver:\n  endpoint_id: 4\nexecution:\n  tool_config_endpoints:\n    12: 2\n",
        )
        .unwrap();
        assert_eq!(config.execution.tool_config_endpoints.get(&12), Some(&2));
        assert_eq!(config.execution.max_subtask_level, 10);
        assert_eq!(config.scheduler.kind, SchedulerKind::Slurm);
        assert_eq!(config.scheduler.partition.as_deref(), Some("short"));
        assert_eq!(config.driver.endpoint_id, 4);
        assert_eq!(config.driver.single_task_bursts, 5);
    }
}
