//! # Recovery and Restart
//!
//! Two user-initiated ways back into the pipeline.
//!
//! ## Recovery
//!
//! From a stage-specific failed state the task is marked `Recover X`. A
//! driver later moves it to `Recovering X` and runs the tool's recovery hook.
//! Success re-enters the failed stage at its entry point without touching
//! `run_number`; failure returns the task to the failed state. Failed
//! prerequisite checks need no hook: the task is simply reset to the gate it
//! failed at.
//!
//! ## Restart
//!
//! From `Completed`, `Terminated` or `Duplicated` the task is marked
//! `Restart X` and `run_number` is bumped right away, so every generated file
//! of the new run gets a fresh name. The driver then moves it to
//! `Restarting X` and runs the tool's restart hook. On failure the task goes
//! back to the terminal state it was restarted from.

use crate::error::Result;
use crate::execution::{guarded, ClusterController, JobFiles};
use crate::models::Task;
use crate::scheduler::RemoteState;
use crate::state_machine::{Stage, TaskStatus};
use crate::store::TaskStore;
use crate::tools::{recovery_hook_name, restart_hook_name, run_recovery_hook, run_restart_hook, ToolContext};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct RecoveryController {
    cluster: ClusterController,
}

impl RecoveryController {
    pub fn new(cluster: ClusterController) -> Self {
        Self { cluster }
    }

    fn store(&self) -> &Arc<dyn TaskStore> {
        self.cluster.store()
    }

    /// Ask for recovery of a failed task. `Ok(false)` when its status has
    /// nothing to recover from, or another process moved it first.
    #[instrument(skip(self, task), fields(task_id = task.task_id, status = %task.status))]
    pub async fn request_recovery(&self, task: &mut Task) -> Result<bool> {
        let current = task.status;
        let (target, message) = match current {
            TaskStatus::FailedSetupPrerequisites => (
                TaskStatus::New,
                "Resetting prerequisites checking for 'Setup'.".to_string(),
            ),
            TaskStatus::FailedPostProcessPrerequisites => (
                TaskStatus::DataReady,
                "Resetting prerequisites checking for 'PostProcess'.".to_string(),
            ),
            _ => match current.failed_stage() {
                Some(stage) => (
                    stage.recover_status(),
                    format!("Scheduling recovery from '{current}'."),
                ),
                None => return Ok(false),
            },
        };

        if !self.cluster.engine().transition(task, current, target).await? {
            return Ok(false);
        }
        self.store().record_log(task, &message).await?;
        Ok(true)
    }

    /// Ask for a restart at `stage`. `Terminated` and `Duplicated` tasks
    /// always restart at setup.
    #[instrument(skip(self, task), fields(task_id = task.task_id, status = %task.status))]
    pub async fn request_restart(&self, task: &mut Task, stage: Stage) -> Result<bool> {
        let current = task.status;
        let stage = match current {
            TaskStatus::Completed => stage,
            TaskStatus::Terminated | TaskStatus::Duplicated => Stage::Setup,
            _ => return Ok(false),
        };

        if !self
            .cluster
            .engine()
            .transition(task, current, stage.restart_status())
            .await?
        {
            return Ok(false);
        }
        let mark = task.log.len();
        task.run_number += 1;
        task.restart_return_status = Some(current);
        task.addlog(format!("Scheduling restart at '{stage}'."));
        self.store().save_task(task, mark).await?;
        info!(task_id = task.task_id, stage = %stage, run = task.run_number, "Restart scheduled");
        Ok(true)
    }

    /// Advance a task sitting in `Recover X`
    #[instrument(skip(self, task), fields(task_id = task.task_id, status = %task.status))]
    pub async fn process_recovery(&self, task: &mut Task) -> Result<()> {
        let Some(stage) = task.status.recover_stage().filter(|_| task.status.is_recover()) else {
            return Ok(());
        };
        let engine = self.cluster.engine();
        let requested = stage.recover_status();
        let recovering = stage.recovering_status();
        let failed = stage.failed_status();

        if !engine.transition(task, requested, recovering).await? {
            return Ok(());
        }
        let mark = task.log.len();

        if matches!(stage, Stage::Cluster | Stage::PostProcess) {
            if let Some(handle) = task.cluster_jobid.clone() {
                match self.cluster.scheduler().query_status(&handle, task.updated_at).await {
                    Err(e) => {
                        // Scheduler unreachable: try again on a later pass
                        debug!(task_id = task.task_id, error = %e, "Deferring recovery");
                        engine.transition(task, recovering, requested).await?;
                        return self.store().save_task(task, mark).await;
                    }
                    Ok(RemoteState::NotFound) => {}
                    Ok(state) => {
                        let remote = state.task_status().unwrap_or(TaskStatus::DataReady);
                        task.addlog(format!(
                            "While attempting recovery from '{failed}' failure we found a cluster task still running! Resetting to '{remote}'."
                        ));
                        engine.transition(task, recovering, remote).await?;
                        return self.store().save_task(task, mark).await;
                    }
                }
            }
        }

        let outcome = match self.cluster.existing_workdir(task) {
            None if stage == Stage::Setup => {
                task.addlog(
                    "Work directory is missing. But since this was a setup failure, we will simply assume we can move on to 'New'.",
                );
                Ok(true)
            }
            None => {
                task.addlog("Work directory is missing; recovery is not possible.");
                Ok(false)
            }
            Some(workdir) => {
                task.addlog(format!("Triggering recovery method '{}'.", recovery_hook_name(stage)));
                guarded(self.run_hook(task, &workdir, stage, HookKind::Recovery)).await
            }
        };

        let target = match outcome {
            Ok(true) => {
                task.addlog(format!("Successful recovery from '{failed}' failure, now we retry it."));
                match stage {
                    Stage::Setup => TaskStatus::New,
                    Stage::Cluster => {
                        task.flags.submit_without_setup = true;
                        self.store().update_task(task).await?;
                        TaskStatus::New
                    }
                    Stage::PostProcess => TaskStatus::DataReady,
                }
            }
            Ok(false) => {
                task.addlog(format!(
                    "Cannot recover from '{failed}' failure. Returning task to Failed state."
                ));
                failed
            }
            Err(e) => {
                task.addlog_error(&format!("Exception raised while recovering from '{failed}' failure"), &e);
                task.addlog(format!(
                    "Cannot recover from '{failed}' failure. Returning task to Failed state."
                ));
                warn!(task_id = task.task_id, error = %e, "Recovery hook raised an error");
                failed
            }
        };

        engine.transition(task, recovering, target).await?;
        self.store().save_task(task, mark).await
    }

    /// Advance a task sitting in `Restart X`
    #[instrument(skip(self, task), fields(task_id = task.task_id, status = %task.status))]
    pub async fn process_restart(&self, task: &mut Task) -> Result<()> {
        let Some(stage) = task.status.restart_stage().filter(|_| task.status.is_restart()) else {
            return Ok(());
        };
        let engine = self.cluster.engine();
        let restarting = stage.restarting_status();
        let return_to = task.restart_return_status.unwrap_or(TaskStatus::Completed);

        if !engine.transition(task, stage.restart_status(), restarting).await? {
            return Ok(());
        }
        let mark = task.log.len();

        let workdir = self.cluster.existing_workdir(task);
        let outcome = match &workdir {
            None => {
                task.addlog("Work directory is missing; restart is not possible.");
                Ok(false)
            }
            Some(workdir) => {
                task.addlog(format!(
                    "Triggering restart preparation method '{}'.",
                    restart_hook_name(stage)
                ));
                guarded(self.run_hook(task, workdir, stage, HookKind::Restart)).await
            }
        };

        match (outcome, workdir) {
            (Ok(true), Some(workdir)) => {
                task.addlog(format!(
                    "Preparation for restarting at '{stage}' succeeded, now we restart it."
                ));
                task.restart_return_status = None;
                match stage {
                    Stage::Setup => {
                        engine.transition(task, restarting, TaskStatus::New).await?;
                    }
                    Stage::PostProcess => {
                        task.flags.no_end_marker_check = true;
                        self.store().update_task(task).await?;
                        engine.transition(task, restarting, TaskStatus::DataReady).await?;
                    }
                    Stage::Cluster => self.resubmit(task, &workdir).await?,
                }
            }
            (outcome, _) => {
                if let Err(e) = outcome {
                    task.addlog_error(&format!("Exception raised while preparing restart at '{stage}'"), &e);
                    warn!(task_id = task.task_id, error = %e, "Restart hook raised an error");
                }
                task.addlog(format!(
                    "Cannot restart at '{stage}'. Returning task status to '{return_to}'."
                ));
                task.restart_return_status = None;
                engine.transition(task, restarting, return_to).await?;
            }
        }
        self.store().save_task(task, mark).await
    }

    async fn resubmit(&self, task: &mut Task, workdir: &Path) -> Result<()> {
        let tool = self.cluster.tool_for(task)?;
        match guarded(self.cluster.submit_cluster_job(task, tool.as_ref(), workdir)).await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                task.addlog("Failed to start: 'false' returned by submit_cluster_job().");
            }
            Err(e) => {
                task.addlog_error("Exception raised while resubmitting job", &e);
            }
        }
        let current = task.status;
        self.cluster
            .engine()
            .transition(task, current, TaskStatus::FailedOnCluster)
            .await?;
        Ok(())
    }

    async fn run_hook(
        &self,
        task: &mut Task,
        workdir: &Path,
        stage: Stage,
        kind: HookKind,
    ) -> anyhow::Result<bool> {
        let tool = self.cluster.tool_for(task)?;
        let files = JobFiles::for_task(task, workdir);
        let mut ctx = ToolContext {
            task,
            workdir,
            files: &files,
        };
        match kind {
            HookKind::Recovery => run_recovery_hook(tool.as_ref(), stage, &mut ctx).await,
            HookKind::Restart => run_restart_hook(tool.as_ref(), stage, &mut ctx).await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum HookKind {
    Recovery,
    Restart,
}
