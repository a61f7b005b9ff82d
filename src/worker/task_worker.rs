//! # Task Worker
//!
//! The [`WorkUnit`] that advances the tasks of one execution endpoint.
//!
//! ## One round
//!
//! 1. Force-fail tasks stuck in local code past the staleness window.
//! 2. List the tasks a driver can move forward, leaving out those touched in
//!    the last few seconds.
//! 3. Tasks that can only lower cluster activity (polling, post-processing)
//!    go first. Tasks that start new work (`New`, recover and restart
//!    requests) follow, subject to the endpoint and per-user limits on
//!    active tasks.
//!
//! Every task is handled under its store lock, keyed by this worker's UUID.
//! When exactly one task is actionable the lock is kept over several short
//! bursts so a quickly progressing job does not wait a full check interval
//! between steps; the worker gives up the burst as soon as another task
//! shows up.
//!
//! Errors for one task are logged and never stop the round.

use super::{DriverContext, WorkUnit};
use crate::config::DriverConfig;
use crate::error::{Result, TaskerError};
use crate::execution::ClusterController;
use crate::logging::{log_error, log_task_operation};
use crate::models::{GatingPoint, Task, TaskId};
use crate::prerequisites::{PrerequisiteEvaluator, Verdict};
use crate::recovery::RecoveryController;
use crate::state_machine::{StateMachineError, TaskStatus};
use crate::store::{TaskFilter, TaskStore};
use crate::subtasks::SubtaskSubmitter;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub struct TaskWorker {
    name: String,
    holder: String,
    cluster: ClusterController,
    recovery: RecoveryController,
    subtasks: SubtaskSubmitter,
    evaluator: PrerequisiteEvaluator,
    config: DriverConfig,
    idle_rounds: u32,
}

impl std::fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWorker")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .field("endpoint_id", &self.config.endpoint_id)
            .finish_non_exhaustive()
    }
}

impl TaskWorker {
    pub fn new(cluster: ClusterController, config: DriverConfig) -> Self {
        let holder = Uuid::new_v4().to_string();
        Self {
            name: format!("task-worker-{}", config.endpoint_id),
            holder,
            recovery: RecoveryController::new(cluster.clone()),
            subtasks: SubtaskSubmitter::new(cluster.clone()),
            evaluator: PrerequisiteEvaluator::new(Arc::clone(cluster.store())),
            cluster,
            config,
            idle_rounds: 0,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn store(&self) -> &Arc<dyn TaskStore> {
        self.cluster.store()
    }

    fn endpoint_filter(&self, statuses: impl IntoIterator<Item = TaskStatus>) -> TaskFilter {
        TaskFilter {
            endpoint_id: Some(self.config.endpoint_id),
            ..TaskFilter::with_statuses(statuses)
        }
    }

    /// Tasks a driver can advance, optionally leaving out recently updated ones
    pub async fn actionable_tasks(&self, skip_recent: bool) -> Result<Vec<Task>> {
        let mut filter = self.endpoint_filter(
            TaskStatus::ALL
                .into_iter()
                .filter(TaskStatus::is_ready_for_driver),
        );
        if skip_recent && self.config.recent_update_skip_seconds > 0 {
            let skip = ChronoDuration::seconds(
                i64::try_from(self.config.recent_update_skip_seconds).unwrap_or(i64::MAX),
            );
            filter.updated_before = Some(Utc::now() - skip);
        }
        let mut tasks = self.store().list_tasks(&filter).await?;
        tasks.sort_by_key(|t| t.task_id);
        Ok(tasks)
    }

    /// Force-fail tasks stuck in local code; returns how many were moved
    pub async fn reap_stuck_tasks(&self) -> Result<usize> {
        let cutoff = ChronoDuration::from_std(self.cluster.config().staleness_window())
            .map(|window| Utc::now() - window)
            .map_err(|e| TaskerError::ValidationError(format!("bad staleness window: {e}")))?;
        let filter = TaskFilter {
            updated_before: Some(cutoff),
            ..self.endpoint_filter(
                TaskStatus::ALL
                    .into_iter()
                    .filter(TaskStatus::is_local_code_stage),
            )
        };

        let mut reaped = 0;
        for task in self.store().list_tasks(&filter).await? {
            if !self
                .store()
                .acquire_lock(task.task_id, &self.holder, self.config.stale_lock())
                .await?
            {
                continue;
            }
            let outcome = match self.store().find_task(task.task_id).await? {
                Some(mut current) => self.cluster.fail_if_stuck(&mut current).await,
                None => Ok(false),
            };
            self.store().release_lock(task.task_id, &self.holder).await?;
            if outcome? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Split into activity-lowering tasks and the admitted activity-raising ones
    pub async fn plan_round(&self, tasks: Vec<Task>) -> Result<Vec<Task>> {
        let (raising, mut plan): (Vec<Task>, Vec<Task>) =
            tasks.into_iter().partition(|t| t.status.increases_activity());
        if raising.is_empty() {
            return Ok(plan);
        }

        let active = self
            .store()
            .list_tasks(&self.endpoint_filter(TaskStatus::ALL.into_iter().filter(TaskStatus::is_active)))
            .await?;
        let admitted = admit_within_limits(
            raising,
            &active,
            self.config.task_limit_total,
            self.config.task_limit_user,
        );
        plan.extend(admitted);
        Ok(plan)
    }

    /// Whether the next step of `task_id` fits within the task limits
    async fn still_admitted(&self, task_id: TaskId) -> Result<bool> {
        let Some(task) = self.store().find_task(task_id).await? else {
            return Ok(false);
        };
        if !task.status.increases_activity() {
            return Ok(true);
        }
        Ok(!self.plan_round(vec![task]).await?.is_empty())
    }

    /// Lock, process, unlock. Returns whether the lock was obtained.
    async fn lock_and_process(&self, task_id: TaskId) -> Result<bool> {
        if !self
            .store()
            .acquire_lock(task_id, &self.holder, self.config.stale_lock())
            .await?
        {
            debug!(task_id, "Task locked by another driver");
            return Ok(false);
        }
        let result = self.process_task(task_id).await;
        self.store().release_lock(task_id, &self.holder).await?;
        self.report(task_id, result);
        Ok(true)
    }

    fn report(&self, task_id: TaskId, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(TaskerError::StateMachine(e)) if e.is_race() => {
                debug!(task_id, error = %e, "Task moved on under us");
            }
            Err(e) => {
                log_error(
                    &self.name,
                    "process_task",
                    &e.to_string(),
                    Some(&format!("task_id={task_id}")),
                );
            }
        }
    }

    /// Advance one task by one step
    #[instrument(skip(self))]
    pub async fn process_task(&self, task_id: TaskId) -> Result<()> {
        let Some(mut task) = self.store().find_task(task_id).await? else {
            return Ok(());
        };
        if task.endpoint_id != self.config.endpoint_id || !task.status.is_ready_for_driver() {
            return Ok(());
        }
        let initial = task.status;
        debug!(task_id, status = %initial, "Got task");

        if !initial.is_recover() && !initial.is_restart() {
            self.cluster.update_status(&mut task).await?;
            self.subtasks.submit_subtasks(&mut task).await?;
            let updated = task.status;

            if initial == TaskStatus::OnCpu && updated == TaskStatus::OnCpu {
                return Ok(());
            }
            if initial == TaskStatus::Queued
                && matches!(updated, TaskStatus::OnCpu | TaskStatus::DataReady)
            {
                self.store()
                    .record_log(&mut task, &format!("State updated to {updated}"))
                    .await?;
            }
        }

        match task.status {
            TaskStatus::New => self.start_task(&mut task).await,
            TaskStatus::DataReady => self.start_post_processing(&mut task).await,
            status if status.is_recover() => self.recovery.process_recovery(&mut task).await,
            status if status.is_restart() => self.recovery.process_restart(&mut task).await,
            _ => Ok(()),
        }
    }

    async fn start_task(&self, task: &mut Task) -> Result<()> {
        if let Some(owner_id) = task.share_workdir_with {
            match self.store().find_task(owner_id).await? {
                None => {
                    task.addlog(format!(
                        "Cannot find task '{owner_id}' whose work directory this task should use."
                    ));
                    let mark = task.log.len() - 1;
                    self.cluster
                        .engine()
                        .transition(task, TaskStatus::New, TaskStatus::FailedToSetup)
                        .await?;
                    return self.store().save_task(task, mark).await;
                }
                Some(owner) if self.cluster.existing_workdir(&owner).is_none() => {
                    debug!(task_id = task.task_id, owner_id, "Waiting for shared work directory");
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        match self.evaluator.fulfilled(task, GatingPoint::BeforeSetup).await? {
            Verdict::Wait => Ok(()),
            Verdict::Fail => {
                self.cluster
                    .engine()
                    .transition(task, TaskStatus::New, TaskStatus::FailedSetupPrerequisites)
                    .await?;
                Ok(())
            }
            Verdict::Go => {
                self.cluster
                    .engine()
                    .transition_strict(task, TaskStatus::New, TaskStatus::SettingUp)
                    .await?;
                log_task_operation("setup", Some(task.task_id), Some(task.name()), "started", None);
                self.cluster.setup_and_submit(task).await
            }
        }
    }

    async fn start_post_processing(&self, task: &mut Task) -> Result<()> {
        if !self.cluster.ready_to_post_process(task).await? {
            return Ok(());
        }
        match self
            .evaluator
            .fulfilled(task, GatingPoint::BeforePostProcessing)
            .await?
        {
            Verdict::Wait => Ok(()),
            Verdict::Fail => {
                self.cluster
                    .engine()
                    .transition(
                        task,
                        TaskStatus::DataReady,
                        TaskStatus::FailedPostProcessPrerequisites,
                    )
                    .await?;
                Ok(())
            }
            Verdict::Go => {
                self.cluster
                    .engine()
                    .transition_strict(task, TaskStatus::DataReady, TaskStatus::PostProcessing)
                    .await?;
                self.cluster.post_process(task).await
            }
        }
    }

    /// Keep the lock of a lone task over several short bursts
    async fn burst_single_task(&self, ctx: &DriverContext, task_id: TaskId) -> Result<()> {
        if !self
            .store()
            .acquire_lock(task_id, &self.holder, self.config.stale_lock())
            .await?
        {
            return Ok(());
        }

        let mut outcome = Ok(());
        for burst in 0..self.config.single_task_bursts.max(1) {
            let result = self.process_task(task_id).await;
            self.report(task_id, result);
            if ctx.is_stopping() || burst + 1 == self.config.single_task_bursts {
                break;
            }

            tokio::time::sleep(self.config.burst_pause()).await;
            match self.actionable_tasks(false).await {
                Ok(tasks) => {
                    let still_alone = tasks.len() == 1 && tasks[0].task_id == task_id;
                    if !still_alone {
                        debug!(task_id, others = tasks.len(), "Leaving single-task mode");
                        break;
                    }
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
            match self.still_admitted(task_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(task_id, "Task limits reached, leaving single-task mode");
                    break;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        self.store().release_lock(task_id, &self.holder).await?;
        outcome
    }
}

#[async_trait]
impl WorkUnit for TaskWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self, _ctx: &DriverContext) -> Result<()> {
        info!(
            driver = %self.name,
            holder = %self.holder,
            endpoint_id = self.config.endpoint_id,
            "Task worker ready"
        );
        Ok(())
    }

    async fn do_regular_work(&mut self, ctx: &DriverContext) -> Result<()> {
        let reaped = self.reap_stuck_tasks().await?;
        if reaped > 0 {
            info!(driver = %self.name, reaped, "Stuck tasks force-failed");
        }

        let tasks = self.actionable_tasks(true).await?;
        if tasks.is_empty() {
            self.idle_rounds += 1;
            if self.idle_rounds >= self.config.idle_rounds_before_sleep {
                debug!(driver = %self.name, "Nothing to do, requesting sleep mode");
                ctx.request_sleep_mode(self.config.idle_sleep());
                self.idle_rounds = 0;
            }
            return Ok(());
        }
        self.idle_rounds = 0;

        let lone = tasks.len() == 1;
        let plan = self.plan_round(tasks).await?;
        if lone && plan.len() == 1 && self.config.single_task_bursts > 1 {
            return self.burst_single_task(ctx, plan[0].task_id).await;
        }

        for task in plan {
            if ctx.is_stopping() {
                break;
            }
            self.lock_and_process(task.task_id).await?;
        }
        Ok(())
    }
}

/// Pick activity-raising tasks while the limits allow. Users with the fewest
/// active tasks go first and take turns; within one user, recover and
/// restart requests come before `New` tasks.
pub fn admit_within_limits(
    candidates: Vec<Task>,
    active: &[Task],
    limit_total: Option<usize>,
    limit_user: Option<usize>,
) -> Vec<Task> {
    let mut total = active.len();
    let mut per_user: HashMap<i64, usize> = HashMap::new();
    for task in active {
        *per_user.entry(task.user_id).or_default() += 1;
    }

    let mut queues: BTreeMap<i64, VecDeque<Task>> = BTreeMap::new();
    for task in candidates {
        queues.entry(task.user_id).or_default().push_back(task);
    }
    for queue in queues.values_mut() {
        queue
            .make_contiguous()
            .sort_by_key(|t| (t.status == TaskStatus::New, t.task_id));
    }
    let mut users: Vec<i64> = queues.keys().copied().collect();
    users.sort_by_key(|u| (per_user.get(u).copied().unwrap_or(0), *u));

    let mut admitted = Vec::new();
    loop {
        let mut progressed = false;
        for user in &users {
            if limit_total.is_some_and(|limit| total >= limit) {
                return admitted;
            }
            let count = per_user.entry(*user).or_default();
            if limit_user.is_some_and(|limit| *count >= limit) {
                continue;
            }
            if let Some(task) = queues.get_mut(user).and_then(VecDeque::pop_front) {
                *count += 1;
                total += 1;
                admitted.push(task);
                progressed = true;
            }
        }
        if !progressed {
            return admitted;
        }
    }
}
