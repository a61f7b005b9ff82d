//! # Cluster Execution Controller
//!
//! Drives one task through setup, remote submission, remote polling and
//! post-processing, plus the control operations (terminate, suspend, resume,
//! hold, release) and deletion.
//!
//! ## Boundary
//!
//! Tool steps run inside [`guarded`]: a `false` return, an `Err` or even a
//! panic becomes a status transition plus an entry in the task's own log.
//! Only persistence and configuration problems come back to the caller as a
//! [`TaskerError`].
//!
//! ## Persistence
//!
//! Log entries are collected on the in-memory task while a step runs and
//! written with [`TaskStore::save_task`] at the end, so one call persists the
//! fields and the new entries together. Status changes always go through the
//! [`StatusTransitionEngine`].

use super::script::{capture_job_out_err, CapturedOutput, JobFiles};
use super::workdir::{directory_size, WorkdirLayout};
use crate::config::{ArchiveConfig, ExecutionConfig};
use crate::error::{Result, TaskerError};
use crate::logging::log_task_operation;
use crate::models::Task;
use crate::scheduler::{ClusterScheduler, JobSpec, RemoteState};
use crate::state_machine::{StatusTransitionEngine, TaskStatus};
use crate::storage::StorageCollaborator;
use crate::store::TaskStore;
use crate::tools::{ToolContext, ToolHandler, ToolRegistry};
use anyhow::{anyhow, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Run a tool step, turning a panic into an error
pub async fn guarded<F, T>(step: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(step).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub(crate) fn older_than(instant: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> bool {
    ChronoDuration::from_std(window)
        .map(|window| now.signed_duration_since(instant) > window)
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct ClusterController {
    engine: StatusTransitionEngine,
    scheduler: Arc<dyn ClusterScheduler>,
    storage: Arc<dyn StorageCollaborator>,
    tools: Arc<ToolRegistry>,
    layout: WorkdirLayout,
    config: ExecutionConfig,
    pub(super) archive: ArchiveConfig,
}

impl std::fmt::Debug for ClusterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterController")
            .field("scheduler", &self.scheduler.name())
            .field("layout", &self.layout)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl ClusterController {
    pub fn new(
        engine: StatusTransitionEngine,
        scheduler: Arc<dyn ClusterScheduler>,
        storage: Arc<dyn StorageCollaborator>,
        tools: Arc<ToolRegistry>,
        config: ExecutionConfig,
        archive: ArchiveConfig,
    ) -> Self {
        let layout = WorkdirLayout::new(config.workdir_root.clone());
        Self {
            engine,
            scheduler,
            storage,
            tools,
            layout,
            config,
            archive,
        }
    }

    pub fn engine(&self) -> &StatusTransitionEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        self.engine.store()
    }

    pub fn scheduler(&self) -> &Arc<dyn ClusterScheduler> {
        &self.scheduler
    }

    pub fn storage(&self) -> &Arc<dyn StorageCollaborator> {
        &self.storage
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn layout(&self) -> &WorkdirLayout {
        &self.layout
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Absolute work directory of `task`, whether owned or shared
    pub fn workdir_of(&self, task: &Task) -> Option<PathBuf> {
        self.layout.task_workdir(task)
    }

    /// Work directory that exists on disk, if any
    pub fn existing_workdir(&self, task: &Task) -> Option<PathBuf> {
        self.workdir_of(task).filter(|path| path.is_dir())
    }

    pub fn tool_for(&self, task: &Task) -> Result<Arc<dyn ToolHandler>> {
        self.tools.get(&task.tool_class)
    }

    /// Find or create the work directory of `task`, borrowing the owner's
    /// directory when `share_workdir_with` is set.
    pub async fn make_workdir(&self, task: &mut Task) -> anyhow::Result<PathBuf> {
        if let Some(existing) = self.existing_workdir(task) {
            return Ok(existing);
        }
        task.cluster_workdir = None;

        if let Some(owner_id) = task.share_workdir_with {
            let owner = self.store().find_task(owner_id).await?.ok_or_else(|| {
                anyhow!(
                    "Task '{}' is supposed to use the workdir of task '{owner_id}' which doesn't exist.",
                    task.task_id
                )
            })?;
            if owner.endpoint_id != task.endpoint_id {
                bail!("Cannot use the work directory of a task that belongs to another endpoint.");
            }
            let owner_dir = self
                .existing_workdir(&owner)
                .ok_or_else(|| anyhow!("The work directory of task '{owner_id}' does not exist."))?;
            task.cluster_workdir = owner.cluster_workdir.clone();
            task.addlog(format!(
                "Using workdir '{}' of task '{}'.",
                owner_dir.display(),
                owner_id
            ));
            return Ok(owner_dir);
        }

        let relative = self.layout.create_owned(task).await?;
        let full = self.layout.full_path(&relative);
        task.cluster_workdir = Some(relative.to_string_lossy().into_owned());
        task.addlog(format!("Created workdir '{}'.", full.display()));
        Ok(full)
    }

    /// `Setting Up` to `Queued` (or `Data Ready`/`Configured`), or to
    /// `Failed To Setup` when anything goes wrong.
    #[instrument(skip(self, task), fields(task_id = task.task_id))]
    pub async fn setup_and_submit(&self, task: &mut Task) -> Result<()> {
        if task.status != TaskStatus::SettingUp {
            return Err(TaskerError::InvalidState(format!(
                "Expected task {} to be in 'Setting Up', found '{}'",
                task.task_id, task.status
            )));
        }
        let mark = task.log.len();
        task.addlog("Setting Up.");

        match guarded(self.try_setup_and_submit(task)).await {
            Ok(true) => {
                task.addlog("Setup and submit process successful.");
                log_task_operation(
                    "setup_and_submit",
                    Some(task.task_id),
                    Some(task.name()),
                    task.status.as_str(),
                    None,
                );
            }
            Ok(false) => {
                self.engine
                    .transition(task, TaskStatus::SettingUp, TaskStatus::FailedToSetup)
                    .await?;
            }
            Err(e) => {
                task.addlog_error("Exception raised while setting up", &e);
                warn!(task_id = task.task_id, error = %e, "Setup raised an error");
                self.engine
                    .transition(task, TaskStatus::SettingUp, TaskStatus::FailedToSetup)
                    .await?;
            }
        }

        self.store().save_task(task, mark).await
    }

    async fn try_setup_and_submit(&self, task: &mut Task) -> anyhow::Result<bool> {
        let tool = self.tool_for(task)?;
        let workdir = self.make_workdir(task).await?;
        let files = JobFiles::for_task(task, &workdir);

        if task.flags.submit_without_setup {
            task.flags.submit_without_setup = false;
            task.addlog("Resubmitting after cluster recovery; setup skipped.");
        } else {
            let mut ctx = ToolContext {
                task: &mut *task,
                workdir: &workdir,
                files: &files,
            };
            if !tool.prepare(&mut ctx).await? {
                task.addlog("Failed to setup: 'false' returned by setup().");
                return Ok(false);
            }
        }

        if !self.submit_cluster_job(task, tool.as_ref(), &workdir).await? {
            task.addlog("Failed to start: 'false' returned by submit_cluster_job().");
            return Ok(false);
        }
        Ok(true)
    }

    /// Write the scripts for the current run and hand them to the scheduler.
    ///
    /// The task moves from its current status to `Queued`, or to
    /// `Data Ready` when the tool has no remote commands, or to `Configured`
    /// for configure-only tasks.
    pub async fn submit_cluster_job(
        &self,
        task: &mut Task,
        tool: &dyn ToolHandler,
        workdir: &Path,
    ) -> anyhow::Result<bool> {
        task.addlog("Launching job on cluster.");
        let from = task.status;
        let files = JobFiles::for_task(task, workdir);

        let commands = {
            let mut ctx = ToolContext {
                task: &mut *task,
                workdir,
                files: &files,
            };
            tool.build_remote_commands(&mut ctx).await?
        };

        if commands.iter().all(|line| line.trim().is_empty()) {
            task.addlog("No BASH commands associated with this task. Jumping to state 'Data Ready'.");
            self.engine.transition(task, from, TaskStatus::DataReady).await?;
            return Ok(true);
        }

        files.write_scripts(task, &commands).await?;
        files.remove_stale_outputs().await?;

        if task.flags.configure_only {
            task.addlog("This task is meant to be configured but not actually submitted.");
            self.engine.transition(task, from, TaskStatus::Configured).await?;
            return Ok(true);
        }

        let mut hints = tool.resource_hints(task);
        hints.walltime.get_or_insert(self.config.default_walltime());
        let spec = JobSpec {
            name: format!("{}-{}", task.name(), task.task_id),
            script: files.wrapper_script(),
            workdir: workdir.to_path_buf(),
            stdout: files.wrapper_stdout(),
            stderr: files.wrapper_stderr(),
            hints,
        };

        let handle = self.scheduler.submit(&spec).await?;
        task.cluster_jobid = Some(handle.clone());
        // The handle must be visible before any poller sees `Queued`
        self.store().update_task(task).await?;

        if self.engine.transition(task, from, TaskStatus::Queued).await? {
            task.addlog(format!("Queued as job ID '{handle}'."));
            info!(task_id = task.task_id, job = %handle, scheduler = self.scheduler.name(), "Job submitted");
        } else {
            warn!(task_id = task.task_id, job = %handle, "Task moved on while its job was submitted");
        }
        Ok(true)
    }

    /// Fold the scheduler's view into the task status.
    ///
    /// Only on-remote statuses are queried. A job the scheduler no longer
    /// knows moves to `Data Ready`; whether it succeeded is decided at
    /// post-processing. Query errors leave the status alone.
    #[instrument(skip(self, task), fields(task_id = task.task_id, status = %task.status))]
    pub async fn update_status(&self, task: &mut Task) -> Result<TaskStatus> {
        let current = task.status;
        if !current.is_on_remote() {
            return Ok(current);
        }

        let remote = match task.cluster_jobid.as_deref() {
            Some(handle) => match self.scheduler.query_status(handle, task.updated_at).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(task_id = task.task_id, error = %e, "Scheduler could not report job status");
                    return Ok(current);
                }
            },
            None => RemoteState::NotFound,
        };

        let target = remote.task_status().unwrap_or(TaskStatus::DataReady);
        if target != current && self.engine.transition(task, current, target).await? {
            debug!(task_id = task.task_id, from = %current, to = %target, "Remote status changed");
        }
        Ok(task.status)
    }

    /// Whether a `Data Ready` task should be post-processed now.
    ///
    /// The job's captured output may become visible after the scheduler
    /// already forgot the job. Without the end-of-job marker post-processing
    /// waits out the grace period when output exists, and the full deferral
    /// bound when it does not.
    pub async fn ready_to_post_process(&self, task: &Task) -> Result<bool> {
        if task.status != TaskStatus::DataReady || task.flags.no_end_marker_check {
            return Ok(task.status == TaskStatus::DataReady);
        }
        let Some(workdir) = self.existing_workdir(task) else {
            return Ok(true);
        };
        let files = JobFiles::for_task(task, &workdir);
        if !files.wrapper_script().exists() || files.has_end_marker().await? {
            return Ok(true);
        }

        let since = task.data_ready_at.unwrap_or(task.updated_at);
        let now = Utc::now();
        let wait = if files.wrapper_stdout().exists() {
            self.config.post_process_grace()
        } else {
            self.config.max_post_process_deferral()
        };
        let ready = older_than(since, wait, now);
        if !ready {
            debug!(task_id = task.task_id, "Deferring post-processing until job output appears");
        }
        Ok(ready)
    }

    /// `Post Processing` to `Completed`, `Failed On Cluster` or
    /// `Failed To PostProcess`
    #[instrument(skip(self, task), fields(task_id = task.task_id))]
    pub async fn post_process(&self, task: &mut Task) -> Result<()> {
        if task.status != TaskStatus::PostProcessing {
            return Err(TaskerError::InvalidState(format!(
                "Expected task {} to be in 'Post Processing', found '{}'",
                task.task_id, task.status
            )));
        }
        let mark = task.log.len();
        task.addlog("Starting asynchronous postprocessing.");
        self.update_workdir_size(task);

        match guarded(self.try_collect_results(task)).await {
            Ok(true) => {
                task.addlog("Asynchronous postprocessing completed.");
                self.engine
                    .transition(task, TaskStatus::PostProcessing, TaskStatus::Completed)
                    .await?;
            }
            Ok(false) => {
                task.addlog("Data processing failed on the cluster.");
                self.engine
                    .transition(task, TaskStatus::PostProcessing, TaskStatus::FailedOnCluster)
                    .await?;
            }
            Err(e) => {
                task.addlog_error("Exception raised while post processing results", &e);
                warn!(task_id = task.task_id, error = %e, "Post-processing raised an error");
                self.engine
                    .transition(task, TaskStatus::PostProcessing, TaskStatus::FailedToPostProcess)
                    .await?;
            }
        }
        task.flags.no_end_marker_check = false;
        log_task_operation(
            "post_process",
            Some(task.task_id),
            Some(task.name()),
            task.status.as_str(),
            None,
        );

        self.store().save_task(task, mark).await
    }

    async fn try_collect_results(&self, task: &mut Task) -> anyhow::Result<bool> {
        let tool = self.tool_for(task)?;
        let workdir = self
            .existing_workdir(task)
            .ok_or_else(|| anyhow!("Work directory of task '{}' does not exist.", task.task_id))?;
        let files = JobFiles::for_task(task, &workdir);
        if !task.flags.no_end_marker_check
            && files.wrapper_script().exists()
            && !files.has_end_marker().await?
        {
            task.addlog("Warning: end-of-job marker not found in the job's captured output.");
        }
        let mut ctx = ToolContext {
            task,
            workdir: &workdir,
            files: &files,
        };
        tool.collect_results(&mut ctx).await
    }

    /// Record the work directory size; shared directories count as zero
    pub fn update_workdir_size(&self, task: &mut Task) {
        if !task.owns_workdir() {
            task.cluster_workdir_size = Some(0);
            return;
        }
        task.cluster_workdir_size = None;
        let Some(workdir) = self.existing_workdir(task) else {
            return;
        };
        match directory_size(&workdir) {
            Ok(size) => {
                let size = i64::try_from(size).unwrap_or(i64::MAX);
                task.cluster_workdir_size = Some(size);
                task.addlog(format!("Size of work directory: {size} bytes."));
            }
            Err(e) => debug!(task_id = task.task_id, error = %e, "Could not size work directory"),
        }
    }

    /// Force a task stuck in local code past the staleness window into the
    /// matching failed state. Returns whether the task was moved.
    pub async fn fail_if_stuck(&self, task: &mut Task) -> Result<bool> {
        self.force_fail_stuck(task, |original, target| {
            format!("Worker detects that task is too old and stuck at '{original}'; status reset to '{target}'")
        })
        .await
    }

    async fn force_fail_stuck(
        &self,
        task: &mut Task,
        describe: impl Fn(TaskStatus, TaskStatus) -> String,
    ) -> Result<bool> {
        let original = task.status;
        let Some(target) = original.stuck_failure_status() else {
            return Ok(false);
        };
        if !older_than(task.updated_at, self.config.staleness_window(), Utc::now()) {
            return Ok(false);
        }
        if !self.engine.transition(task, original, target).await? {
            return Ok(false);
        }
        self.store().record_log(task, &describe(original, target)).await?;
        info!(task_id = task.task_id, from = %original, to = %target, "Stuck task force-terminated");
        Ok(true)
    }

    /// Terminate the task if its state allows it
    #[instrument(skip(self, task), fields(task_id = task.task_id, status = %task.status))]
    pub async fn terminate(&self, task: &mut Task) -> Result<bool> {
        let current = task.status;

        if current.is_on_remote() {
            if let Some(handle) = task.cluster_jobid.as_deref() {
                if let Err(e) = self.scheduler.terminate(handle).await {
                    warn!(task_id = task.task_id, error = %e, "Scheduler refused to terminate job");
                    return Ok(false);
                }
            }
            return self.transition_and_log(task, current, TaskStatus::Terminated).await;
        }

        if matches!(current, TaskStatus::New | TaskStatus::Configured) {
            return self.transition_and_log(task, current, TaskStatus::Terminated).await;
        }

        if current.is_local_code_stage() {
            return self
                .force_fail_stuck(task, |original, target| {
                    format!("Terminating a task that is too old and stuck at '{original}'; now at '{target}'")
                })
                .await;
        }
        Ok(false)
    }

    pub async fn suspend(&self, task: &mut Task) -> Result<bool> {
        self.control(task, TaskStatus::OnCpu, TaskStatus::Suspended).await
    }

    pub async fn resume(&self, task: &mut Task) -> Result<bool> {
        self.control(task, TaskStatus::Suspended, TaskStatus::OnCpu).await
    }

    pub async fn hold(&self, task: &mut Task) -> Result<bool> {
        self.control(task, TaskStatus::Queued, TaskStatus::OnHold).await
    }

    pub async fn release(&self, task: &mut Task) -> Result<bool> {
        self.control(task, TaskStatus::OnHold, TaskStatus::Queued).await
    }

    /// Scheduler signal plus transition, valid only from `from`
    async fn control(&self, task: &mut Task, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        if task.status != from {
            return Ok(false);
        }
        let Some(handle) = task.cluster_jobid.clone() else {
            return Ok(false);
        };
        let signalled = match to {
            TaskStatus::Suspended => self.scheduler.suspend(&handle).await,
            TaskStatus::OnCpu => self.scheduler.resume(&handle).await,
            TaskStatus::OnHold => self.scheduler.hold(&handle).await,
            _ => self.scheduler.release(&handle).await,
        };
        if let Err(e) = signalled {
            warn!(task_id = task.task_id, error = %e, to = %to, "Scheduler control call failed");
            return Ok(false);
        }
        self.transition_and_log(task, from, to).await
    }

    async fn transition_and_log(&self, task: &mut Task, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        if !self.engine.transition(task, from, to).await? {
            return Ok(false);
        }
        self.store()
            .record_log(task, &format!("Status changed from '{from}' to '{to}' on request."))
            .await?;
        Ok(true)
    }

    /// Terminate, remove the owned work directory, drop any archive file,
    /// then delete the record. Refused while another task depends on it.
    #[instrument(skip(self, task), fields(task_id = task.task_id))]
    pub async fn destroy(&self, mut task: Task) -> Result<()> {
        let dependents = self.store().find_dependents(task.task_id).await?;
        if let Some(dependent) = dependents.first() {
            return Err(TaskerError::ValidationError(format!(
                "Task {} is a prerequisite of task {} and cannot be deleted",
                task.task_id, dependent.task_id
            )));
        }

        if task.status.is_on_remote() {
            if let Some(handle) = task.cluster_jobid.as_deref() {
                if let Err(e) = self.scheduler.terminate(handle).await {
                    debug!(task_id = task.task_id, error = %e, "Ignoring terminate failure during delete");
                }
            }
        }
        if task.owns_workdir() {
            if let Some(file_id) = task.workdir_archive_file_id.take() {
                self.storage.delete_file(file_id).await?;
            }
        }
        self.layout.remove_owned(&task).await?;
        self.store().delete_task(task.task_id).await?;
        log_task_operation("destroy", Some(task.task_id), Some(task.name()), "deleted", None);
        Ok(())
    }

    /// Tails of the captured outputs of a run (the current one by default)
    pub async fn capture_job_out_err(
        &self,
        task: &Task,
        run_number: Option<i32>,
    ) -> Result<Option<CapturedOutput>> {
        let Some(workdir) = self.existing_workdir(task) else {
            return Ok(None);
        };
        let files = JobFiles::for_run(task, workdir, run_number.unwrap_or(task.run_number));
        Ok(Some(capture_job_out_err(&files).await?))
    }
}
