//! # Durable Task Record Store
//!
//! Persistence seam for task records and background activities.
//!
//! ## Architecture
//!
//! Everything the drivers coordinate on lives behind these traits:
//!
//! - **Compare-and-set status**: the only way a status changes. The update
//!   succeeds iff the persisted status still equals the expected one.
//! - **Field updates**: `update_task` writes every field except the status,
//!   keeps `run_number` monotonic and never changes a `batch_id` once set.
//! - **Per-row handler locks**: a holder string plus an acquisition time, so a
//!   lock left behind by a crashed driver can be reclaimed after a timeout.
//!
//! Two implementations are provided: [`MemoryStore`] for tests and
//! single-process runs, and [`SqliteStore`] backed by `sqlx`.

pub mod memory;
pub mod sqlite;

use crate::error::{Result, TaskerError};
use crate::models::{
    ActivityId, ActivityStatus, BackgroundActivity, NewTask, Task, TaskId, TaskLogEntry,
};
use crate::state_machine::TaskStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Result of a compare-and-set on a status column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The row held another status; nothing was written
    Conflict(TaskStatus),
}

/// Filter for listing tasks
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub endpoint_id: Option<i64>,
    pub user_id: Option<i64>,
    pub statuses: Vec<TaskStatus>,
    /// Only tasks last updated before this instant
    pub updated_before: Option<DateTime<Utc>>,
    /// Leave out tasks whose work directory is archived
    pub exclude_archived: bool,
}

impl TaskFilter {
    pub fn with_statuses(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn on_endpoint(mut self, endpoint_id: i64) -> Self {
        self.endpoint_id = Some(endpoint_id);
        self
    }

    pub fn for_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn updated_before(mut self, instant: DateTime<Utc>) -> Self {
        self.updated_before = Some(instant);
        self
    }

    pub fn not_archived(mut self) -> Self {
        self.exclude_archived = true;
        self
    }

    /// In-memory evaluation shared by implementations that scan
    pub fn matches(&self, task: &Task) -> bool {
        self.endpoint_id.map_or(true, |e| task.endpoint_id == e)
            && self.user_id.map_or(true, |u| task.user_id == u)
            && (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && self.updated_before.map_or(true, |t| task.updated_at < t)
            && !(self.exclude_archived && task.workdir_archived)
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new record; the store assigns the id and timestamps
    async fn create_task(&self, new_task: NewTask) -> Result<Task>;

    async fn find_task(&self, task_id: TaskId) -> Result<Option<Task>>;

    async fn get_task(&self, task_id: TaskId) -> Result<Task> {
        self.find_task(task_id)
            .await?
            .ok_or(TaskerError::TaskNotFound(task_id))
    }

    /// Atomically move `from` to `to`, stamping `updated_at` (and
    /// `data_ready_at` when entering `Data Ready`)
    async fn compare_and_set_status(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<CasOutcome>;

    /// Persist every field except the status
    async fn update_task(&self, task: &Task) -> Result<()>;

    async fn append_log(&self, task_id: TaskId, entry: &TaskLogEntry) -> Result<()>;

    /// Add a log entry to `task` and persist it right away
    async fn record_log(&self, task: &mut Task, message: &str) -> Result<()> {
        let entry = task.addlog(message);
        self.append_log(task.task_id, &entry).await
    }

    /// Persist the fields of `task` plus every log entry from `log_mark` on
    async fn save_task(&self, task: &Task, log_mark: usize) -> Result<()> {
        self.update_task(task).await?;
        for entry in task.log.iter().skip(log_mark) {
            self.append_log(task.task_id, entry).await?;
        }
        Ok(())
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<()>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn count_tasks(&self, filter: &TaskFilter) -> Result<usize> {
        Ok(self.list_tasks(filter).await?.len())
    }

    /// Tasks whose prerequisites reference `task_id` at any gating point
    async fn find_dependents(&self, task_id: TaskId) -> Result<Vec<Task>>;

    /// Current status of each id that exists
    async fn statuses_of(&self, task_ids: &[TaskId]) -> Result<HashMap<TaskId, TaskStatus>>;

    /// Take the handler lock of a task. Re-entrant for the same holder; a lock
    /// older than `stale_after` is reclaimed.
    async fn acquire_lock(&self, task_id: TaskId, holder: &str, stale_after: Duration)
        -> Result<bool>;

    /// Release the lock if `holder` owns it
    async fn release_lock(&self, task_id: TaskId, holder: &str) -> Result<bool>;
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn create_activity(&self, activity: BackgroundActivity) -> Result<BackgroundActivity>;

    async fn find_activity(&self, activity_id: ActivityId) -> Result<Option<BackgroundActivity>>;

    async fn get_activity(&self, activity_id: ActivityId) -> Result<BackgroundActivity> {
        self.find_activity(activity_id).await?.ok_or_else(|| {
            TaskerError::InvalidState(format!("Background activity {activity_id} does not exist"))
        })
    }

    /// Persist progress fields; status and lock are left alone
    async fn save_activity(&self, activity: &BackgroundActivity) -> Result<()>;

    async fn compare_and_set_activity_status(
        &self,
        activity_id: ActivityId,
        from: ActivityStatus,
        to: ActivityStatus,
    ) -> Result<bool>;

    async fn list_activities(
        &self,
        endpoint_id: i64,
        statuses: &[ActivityStatus],
    ) -> Result<Vec<BackgroundActivity>>;

    async fn acquire_activity_lock(&self, activity_id: ActivityId, holder: &str) -> Result<bool>;

    async fn release_activity_lock(&self, activity_id: ActivityId, holder: &str) -> Result<bool>;

    /// Drop a lock regardless of holder (crash cleanup)
    async fn clear_activity_lock(&self, activity_id: ActivityId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;

    #[test]
    fn test_filter_matches_on_every_criterion() {
        let mut task = NewTask::new(4, 2, "Shell").into_task(1, Utc::now());
        task.status = TaskStatus::Queued;

        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter::with_statuses([TaskStatus::Queued])
            .on_endpoint(2)
            .for_user(4)
            .matches(&task));
        assert!(!TaskFilter::with_statuses([TaskStatus::New]).matches(&task));
        assert!(!TaskFilter::default().on_endpoint(3).matches(&task));

        task.workdir_archived = true;
        assert!(!TaskFilter::default().not_archived().matches(&task));
    }
}
