//! SLURM adapter.

use super::{run_command, ClusterScheduler, JobSpec, RemoteState};
use crate::config::SchedulerConfig;
use crate::error::{Result, TaskerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    config: SchedulerConfig,
}

impl SlurmScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    fn sbatch_args(&self, job: &JobSpec) -> Vec<String> {
        let mut args = vec![
            "--parsable".to_string(),
            "--no-requeue".to_string(),
            format!("--chdir={}", job.workdir.display()),
            format!("--job-name={}", job.name),
            format!("--output={}", job.stdout.display()),
            format!("--error={}", job.stderr.display()),
        ];
        if let Some(partition) = &self.config.partition {
            args.push(format!("--partition={partition}"));
        }
        if let Some(walltime) = job.hints.walltime {
            // minutes, rounded up with a minute of slack
            args.push(format!("--time={}", (walltime.as_secs() + 60).div_ceil(60)));
        }
        if let Some(memory_mb) = job.hints.memory_mb {
            args.push(format!("--mem={memory_mb}M"));
        }
        if let Some(cores) = job.hints.cores {
            args.push(format!("--cpus-per-task={cores}"));
        }
        args.extend(self.config.extra_submit_args.iter().cloned());
        args.push(job.script.display().to_string());
        args
    }

    async fn control(&self, program: &str, args: &[&str]) -> Result<()> {
        let out = run_command(program, args, self.config.command_timeout()).await?;
        if !out.success {
            return Err(TaskerError::SchedulerError(format!(
                "'{program} {}' failed: {}",
                args.join(" "),
                out.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Job id from `sbatch --parsable` output (`"1234"` or `"1234;cluster"`)
fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_')).then(|| id.to_string())
}

/// Fold `squeue -o "%t %r"` output into a remote state
fn state_from_squeue(line: &str) -> RemoteState {
    let mut parts = line.split_whitespace();
    let code = parts.next().unwrap_or_default();
    let reason = parts.next().unwrap_or_default();
    match code {
        "R" | "CG" => RemoteState::Running,
        "PD" | "CF" if reason.contains("Held") => RemoteState::Held,
        "PD" | "CF" => RemoteState::Queued,
        "S" | "ST" => RemoteState::Suspended,
        _ => RemoteState::NotFound,
    }
}

#[async_trait]
impl ClusterScheduler for SlurmScheduler {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn submit(&self, job: &JobSpec) -> Result<String> {
        let args = self.sbatch_args(job);
        let out = run_command("sbatch", &args, self.config.command_timeout()).await?;
        if !out.success {
            return Err(TaskerError::SchedulerError(format!(
                "sbatch failed: {}",
                out.stderr.trim()
            )));
        }
        let job_id = parse_job_id(&out.stdout).ok_or_else(|| {
            TaskerError::SchedulerError(format!(
                "Cannot find job ID from sbatch output: {}",
                out.stdout.trim()
            ))
        })?;
        info!(job_id = %job_id, job = %job.name, "Submitted to SLURM");
        Ok(job_id)
    }

    async fn query_status(
        &self,
        job_handle: &str,
        _last_known_update: DateTime<Utc>,
    ) -> Result<RemoteState> {
        let out = run_command(
            "squeue",
            ["-h", "-j", job_handle, "-o", "%t %r"],
            self.config.command_timeout(),
        )
        .await?;
        if !out.success {
            if out.stderr.contains("Invalid job id") {
                return Ok(RemoteState::NotFound);
            }
            warn!(job_id = job_handle, stderr = %out.stderr.trim(), "squeue failed");
            return Err(TaskerError::SchedulerError(format!(
                "squeue failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(out
            .stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .map(state_from_squeue)
            .unwrap_or(RemoteState::NotFound))
    }

    async fn terminate(&self, job_handle: &str) -> Result<()> {
        self.control("scancel", &[job_handle]).await
    }

    async fn suspend(&self, job_handle: &str) -> Result<()> {
        self.control("scontrol", &["suspend", job_handle]).await
    }

    async fn resume(&self, job_handle: &str) -> Result<()> {
        self.control("scontrol", &["resume", job_handle]).await
    }

    async fn hold(&self, job_handle: &str) -> Result<()> {
        self.control("scontrol", &["hold", job_handle]).await
    }

    async fn release(&self, job_handle: &str) -> Result<()> {
        self.control("scontrol", &["release", job_handle]).await
    }
}
