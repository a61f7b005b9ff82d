//! Local "cluster": wrapper scripts run as background `bash` processes on
//! the driver's own host. Each job gets its own process group so signals
//! reach the whole tree the script spawned.

use super::{run_command, ClusterScheduler, JobSpec, RemoteState};
use crate::error::{Result, TaskerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct LocalScheduler {
    command_timeout: Duration,
}

impl LocalScheduler {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    fn parse_pid(job_handle: &str) -> Result<u32> {
        job_handle
            .trim()
            .parse()
            .map_err(|_| TaskerError::SchedulerError(format!("Invalid local job handle '{job_handle}'")))
    }

    /// Signal the job's whole process group; a vanished group is not an error
    async fn signal(&self, job_handle: &str, signal: &str) -> Result<()> {
        let pid = Self::parse_pid(job_handle)?;
        let group = format!("-{pid}");
        let out = run_command("kill", [signal, "--", group.as_str()], self.command_timeout).await?;
        if !out.success {
            debug!(pid, signal, stderr = %out.stderr.trim(), "kill reported an error");
        }
        Ok(())
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Fold a `ps` STAT column into a remote state
fn state_from_ps(stat: &str) -> RemoteState {
    match stat.trim().chars().next() {
        None => RemoteState::NotFound,
        Some('T') | Some('t') => RemoteState::Suspended,
        Some('Z') | Some('X') => RemoteState::NotFound,
        Some(_) => RemoteState::Running,
    }
}

#[async_trait]
impl ClusterScheduler for LocalScheduler {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit(&self, job: &JobSpec) -> Result<String> {
        let stdout = File::create(&job.stdout)?;
        let stderr = File::create(&job.stderr)?;

        let mut command = Command::new("bash");
        command
            .arg(&job.script)
            .current_dir(&job.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            TaskerError::SchedulerError(format!("Cannot start '{}': {e}", job.script.display()))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| TaskerError::SchedulerError("Job exited before getting a PID".into()))?;

        // Reap the child so a finished job does not linger as a zombie.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        info!(pid, job = %job.name, "Local job started");
        Ok(pid.to_string())
    }

    async fn query_status(
        &self,
        job_handle: &str,
        _last_known_update: DateTime<Utc>,
    ) -> Result<RemoteState> {
        let pid = Self::parse_pid(job_handle)?;
        let out = run_command("ps", ["-o", "stat=", "-p", &pid.to_string()], self.command_timeout)
            .await?;
        if !out.success {
            return Ok(RemoteState::NotFound);
        }
        Ok(state_from_ps(&out.stdout))
    }

    async fn terminate(&self, job_handle: &str) -> Result<()> {
        self.signal(job_handle, "-TERM").await
    }

    async fn suspend(&self, job_handle: &str) -> Result<()> {
        self.signal(job_handle, "-STOP").await
    }

    async fn resume(&self, job_handle: &str) -> Result<()> {
        self.signal(job_handle, "-CONT").await
    }

    // Holding only makes sense for queued jobs; local jobs start immediately.
    async fn hold(&self, _job_handle: &str) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _job_handle: &str) -> Result<()> {
        Ok(())
    }
}
