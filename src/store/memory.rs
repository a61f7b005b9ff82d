//! In-process store. A single mutex makes every compare-and-set atomic, which
//! matches the row-lock semantics of the SQL store.

use super::{ActivityStore, CasOutcome, TaskFilter, TaskStore};
use crate::error::{Result, TaskerError};
use crate::models::{
    ActivityId, ActivityStatus, BackgroundActivity, NewTask, Task, TaskId, TaskLogEntry,
};
use crate::state_machine::TaskStatus;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

#[derive(Debug, Clone)]
struct LockEntry {
    holder: String,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_task_id: TaskId,
    next_activity_id: ActivityId,
    tasks: BTreeMap<TaskId, Task>,
    task_locks: HashMap<TaskId, LockEntry>,
    activities: BTreeMap<ActivityId, BackgroundActivity>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a task's last update into the past (staleness tests and tooling)
    pub fn backdate_task(&self, task_id: TaskId, updated_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskerError::TaskNotFound(task_id))?;
        task.updated_at = updated_at;
        Ok(())
    }

    pub fn backdate_activity(&self, activity_id: ActivityId, updated_at: DateTime<Utc>) {
        if let Some(bac) = self.state.lock().activities.get_mut(&activity_id) {
            bac.updated_at = updated_at;
        }
    }

    /// Current lock holder of a task, if any
    pub fn lock_holder(&self, task_id: TaskId) -> Option<String> {
        self.state
            .lock()
            .task_locks
            .get(&task_id)
            .map(|entry| entry.holder.clone())
    }
}

fn stale_cutoff(stale_after: Duration) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::zero())
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, new_task: NewTask) -> Result<Task> {
        let mut state = self.state.lock();
        state.next_task_id += 1;
        let task = new_task.into_task(state.next_task_id, Utc::now());
        state.tasks.insert(task.task_id, task.clone());
        Ok(task)
    }

    async fn find_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        Ok(self.state.lock().tasks.get(&task_id).cloned())
    }

    async fn compare_and_set_status(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<CasOutcome> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskerError::TaskNotFound(task_id))?;
        if task.status != from {
            return Ok(CasOutcome::Conflict(task.status));
        }
        let now = Utc::now();
        task.status = to;
        task.updated_at = now;
        if to == TaskStatus::DataReady {
            task.data_ready_at = Some(now);
        }
        Ok(CasOutcome::Applied)
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.lock();
        let stored = state
            .tasks
            .get_mut(&task.task_id)
            .ok_or(TaskerError::TaskNotFound(task.task_id))?;

        let status = stored.status;
        let log = std::mem::take(&mut stored.log);
        let run_number = stored.run_number.max(task.run_number);
        let batch_id = stored.batch_id.or(task.batch_id);
        let data_ready_at = stored.data_ready_at;

        *stored = task.clone();
        stored.status = status;
        stored.log = log;
        stored.run_number = run_number;
        stored.batch_id = batch_id;
        stored.data_ready_at = data_ready_at.or(task.data_ready_at);
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn append_log(&self, task_id: TaskId, entry: &TaskLogEntry) -> Result<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskerError::TaskNotFound(task_id))?;
        task.log.push(entry.clone());
        Ok(())
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<()> {
        let mut state = self.state.lock();
        state.tasks.remove(&task_id);
        state.task_locks.remove(&task_id);
        Ok(())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self
            .state
            .lock()
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect())
    }

    async fn find_dependents(&self, task_id: TaskId) -> Result<Vec<Task>> {
        Ok(self
            .state
            .lock()
            .tasks
            .values()
            .filter(|task| task.prerequisites.references(task_id))
            .cloned()
            .collect())
    }

    async fn statuses_of(&self, task_ids: &[TaskId]) -> Result<HashMap<TaskId, TaskStatus>> {
        let state = self.state.lock();
        Ok(task_ids
            .iter()
            .filter_map(|id| state.tasks.get(id).map(|t| (*id, t.status)))
            .collect())
    }

    async fn acquire_lock(
        &self,
        task_id: TaskId,
        holder: &str,
        stale_after: Duration,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.tasks.contains_key(&task_id) {
            return Err(TaskerError::TaskNotFound(task_id));
        }
        let cutoff = stale_cutoff(stale_after);
        let available = match state.task_locks.get(&task_id) {
            None => true,
            Some(entry) => entry.holder == holder || entry.acquired_at < cutoff,
        };
        if available {
            state.task_locks.insert(
                task_id,
                LockEntry {
                    holder: holder.to_string(),
                    acquired_at: Utc::now(),
                },
            );
        }
        Ok(available)
    }

    async fn release_lock(&self, task_id: TaskId, holder: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.task_locks.get(&task_id) {
            Some(entry) if entry.holder == holder => {
                state.task_locks.remove(&task_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn create_activity(&self, activity: BackgroundActivity) -> Result<BackgroundActivity> {
        let mut state = self.state.lock();
        state.next_activity_id += 1;
        let mut activity = activity;
        activity.activity_id = state.next_activity_id;
        activity.handler_lock = None;
        state
            .activities
            .insert(activity.activity_id, activity.clone());
        Ok(activity)
    }

    async fn find_activity(&self, activity_id: ActivityId) -> Result<Option<BackgroundActivity>> {
        Ok(self.state.lock().activities.get(&activity_id).cloned())
    }

    async fn save_activity(&self, activity: &BackgroundActivity) -> Result<()> {
        let mut state = self.state.lock();
        let stored = state.activities.get_mut(&activity.activity_id).ok_or_else(|| {
            TaskerError::InvalidState(format!(
                "Background activity {} does not exist",
                activity.activity_id
            ))
        })?;
        let status = stored.status;
        let lock = stored.handler_lock.take();
        *stored = activity.clone();
        stored.status = status;
        stored.handler_lock = lock;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn compare_and_set_activity_status(
        &self,
        activity_id: ActivityId,
        from: ActivityStatus,
        to: ActivityStatus,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        match state.activities.get_mut(&activity_id) {
            Some(bac) if bac.status == from => {
                bac.status = to;
                bac.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_activities(
        &self,
        endpoint_id: i64,
        statuses: &[ActivityStatus],
    ) -> Result<Vec<BackgroundActivity>> {
        Ok(self
            .state
            .lock()
            .activities
            .values()
            .filter(|bac| bac.endpoint_id == endpoint_id && statuses.contains(&bac.status))
            .cloned()
            .collect())
    }

    async fn acquire_activity_lock(&self, activity_id: ActivityId, holder: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.activities.get_mut(&activity_id) {
            Some(bac) => match bac.handler_lock.as_deref() {
                Some(current) if current == holder => Ok(true),
                Some(_) => Ok(false),
                None => {
                    bac.handler_lock = Some(holder.to_string());
                    bac.updated_at = Utc::now();
                    Ok(true)
                }
            },
            None => Ok(false),
        }
    }

    async fn release_activity_lock(&self, activity_id: ActivityId, holder: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.activities.get_mut(&activity_id) {
            Some(bac) if bac.handler_lock.as_deref() == Some(holder) => {
                bac.handler_lock = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_activity_lock(&self, activity_id: ActivityId) -> Result<()> {
        if let Some(bac) = self.state.lock().activities.get_mut(&activity_id) {
            bac.handler_lock = None;
        }
        Ok(())
    }
}
