//! # Cluster Scheduler Adapters
//!
//! The controller talks to an execution endpoint's batch system through the
//! [`ClusterScheduler`] trait: submit a script, query a job, and send the
//! control signals. Raw scheduler states are folded into [`RemoteState`].
//!
//! An adapter handle is built once per endpoint from [`SchedulerConfig`] and
//! passed into the controller; there is no process-wide session.
//!
//! ## Adapters
//!
//! - [`LocalScheduler`]: runs the wrapper script with `bash` in its own
//!   process group on the driver's host. The job handle is the PID.
//! - [`SlurmScheduler`]: `sbatch`, `squeue`, `scancel` and `scontrol`.

pub mod local;
pub mod slurm;

use crate::config::{SchedulerConfig, SchedulerKind};
use crate::error::{Result, TaskerError};
use crate::state_machine::TaskStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub use local::LocalScheduler;
pub use slurm::SlurmScheduler;

/// Job state as seen by the scheduler, folded into a small set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteState {
    Queued,
    Held,
    Running,
    Suspended,
    /// Finished, failed, cancelled or never known: the scheduler cannot say
    NotFound,
}

impl RemoteState {
    /// Task status mirroring this remote state; `None` for not-found
    pub fn task_status(self) -> Option<TaskStatus> {
        match self {
            Self::Queued => Some(TaskStatus::Queued),
            Self::Held => Some(TaskStatus::OnHold),
            Self::Running => Some(TaskStatus::OnCpu),
            Self::Suspended => Some(TaskStatus::Suspended),
            Self::NotFound => None,
        }
    }
}

/// Resource estimates passed along with a submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    pub walltime: Option<Duration>,
    pub memory_mb: Option<u64>,
    pub cores: Option<u32>,
}

/// Everything an adapter needs to submit one wrapper script
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Scheduler-visible job name
    pub name: String,
    pub script: PathBuf,
    pub workdir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub hints: ResourceHints,
}

#[async_trait]
pub trait ClusterScheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Submit the job and return its handle
    async fn submit(&self, job: &JobSpec) -> Result<String>;

    async fn query_status(
        &self,
        job_handle: &str,
        last_known_update: DateTime<Utc>,
    ) -> Result<RemoteState>;

    async fn terminate(&self, job_handle: &str) -> Result<()>;

    async fn suspend(&self, job_handle: &str) -> Result<()>;

    async fn resume(&self, job_handle: &str) -> Result<()>;

    async fn hold(&self, job_handle: &str) -> Result<()>;

    async fn release(&self, job_handle: &str) -> Result<()>;
}

/// Build the adapter selected in configuration
pub fn build_scheduler(config: &SchedulerConfig) -> Arc<dyn ClusterScheduler> {
    match config.kind {
        SchedulerKind::Local => Arc::new(LocalScheduler::new(config.command_timeout())),
        SchedulerKind::Slurm => Arc::new(SlurmScheduler::new(config.clone())),
    }
}

/// Captured result of a scheduler command
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a short scheduler command with a bounded wait
pub(crate) async fn run_command<I, S>(
    program: &str,
    args: I,
    timeout: Duration,
) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    debug!(?command, "running scheduler command");

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| {
            TaskerError::Timeout(format!(
                "'{program}' did not return within {}s",
                timeout.as_secs()
            ))
        })?
        .map_err(|e| TaskerError::SchedulerError(format!("Cannot run '{program}': {e}")))?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
