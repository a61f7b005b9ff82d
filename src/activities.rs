//! # Background Activities
//!
//! Batched, resumable jobs made of a list of string items (usually ids) that
//! a driver works through one item at a time. The position is persisted
//! after every item, so a crashed driver resumes at the first unprocessed
//! one.
//!
//! Handlers are registered per activity type in an [`ActivityRegistry`].
//! [`ActivityManager`] owns the lifecycle: item processing, finalisation,
//! retries of failed items, activation of scheduled activities, cleanup
//! after crashed drivers, and the user controls.

use crate::error::{Result, TaskerError};
use crate::execution::{guarded, ClusterController};
use crate::logging::log_activity_operation;
use crate::models::{ActivityId, ActivityStatus, BackgroundActivity, TaskId};
use crate::store::{ActivityStore, TaskStore};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Outcome of one item: success flag plus an optional message
pub type ItemOutcome = (bool, Option<String>);

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    /// Registry key
    fn activity_type(&self) -> &str;

    async fn before_first_item(&self, _activity: &BackgroundActivity) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process_item(
        &self,
        activity: &BackgroundActivity,
        item: &str,
    ) -> anyhow::Result<ItemOutcome>;

    async fn after_last_item(&self, _activity: &BackgroundActivity) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ActivityRegistry {
    handlers: DashMap<String, Arc<dyn ActivityHandler>>,
}

impl std::fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        f.debug_struct("ActivityRegistry").field("types", &types).finish()
    }
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the work-directory archival handlers
    pub fn with_builtin(cluster: ClusterController) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(ArchiveTaskWorkdir {
            cluster: cluster.clone(),
        }));
        registry.register(Arc::new(UnarchiveTaskWorkdir { cluster }));
        registry
    }

    pub fn register(&self, handler: Arc<dyn ActivityHandler>) {
        self.handlers
            .insert(handler.activity_type().to_string(), handler);
    }

    pub fn get(&self, activity_type: &str) -> Result<Arc<dyn ActivityHandler>> {
        self.handlers
            .get(activity_type)
            .map(|h| h.value().clone())
            .ok_or_else(|| {
                TaskerError::ValidationError(format!("No handler for activity type '{activity_type}'"))
            })
    }
}

#[derive(Clone)]
pub struct ActivityManager {
    store: Arc<dyn ActivityStore>,
    registry: Arc<ActivityRegistry>,
}

impl std::fmt::Debug for ActivityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityManager")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl ActivityManager {
    pub fn new(store: Arc<dyn ActivityStore>, registry: Arc<ActivityRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn ActivityStore> {
        &self.store
    }

    /// Process the item at the current position and persist the result.
    /// Returns whether the activity still has items to process.
    #[instrument(skip(self, activity), fields(activity_id = activity.activity_id))]
    pub async fn process_next_item(&self, activity: &mut BackgroundActivity) -> Result<bool> {
        if activity.status != ActivityStatus::InProgress {
            return Ok(false);
        }
        let handler = match self.registry.get(&activity.activity_type) {
            Ok(handler) => handler,
            Err(e) => {
                self.internal_error(activity, &e.to_string()).await?;
                return Ok(false);
            }
        };

        if activity.current_item == 0 {
            if let Err(e) = guarded(handler.before_first_item(activity)).await {
                self.internal_error(activity, &format!("before_first_item: {e:#}")).await?;
                return Ok(false);
            }
        }

        let Some(item) = activity.next_item().map(str::to_string) else {
            self.finalize(activity, handler.as_ref()).await?;
            return Ok(false);
        };
        let (ok, message) = match guarded(handler.process_item(activity, &item)).await {
            Ok(outcome) => outcome,
            Err(e) => (false, Some(format!("{e:#}"))),
        };
        activity.record_item_result(ok, message);
        self.store.save_activity(activity).await?;
        debug!(activity_id = activity.activity_id, item = %item, ok, "Activity item processed");

        if activity.all_items_processed() {
            self.finalize(activity, handler.as_ref()).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn finalize(&self, activity: &mut BackgroundActivity, handler: &dyn ActivityHandler) -> Result<()> {
        if let Err(e) = guarded(handler.after_last_item(activity)).await {
            warn!(activity_id = activity.activity_id, error = %e, "after_last_item failed");
        }
        let outcome = activity.outcome_status();
        let summary = activity.uniq_counted_messages().join("; ");

        if outcome != ActivityStatus::Completed && activity.prepare_retry(Utc::now()) {
            self.store.save_activity(activity).await?;
            self.transition(activity, ActivityStatus::InProgress, ActivityStatus::Scheduled)
                .await?;
            log_activity_operation(
                "retry_scheduled",
                Some(activity.activity_id),
                Some(&activity.activity_type),
                ActivityStatus::Scheduled.as_str(),
                Some(&summary),
            );
            return Ok(());
        }

        self.transition(activity, ActivityStatus::InProgress, outcome).await?;
        log_activity_operation(
            "finished",
            Some(activity.activity_id),
            Some(&activity.activity_type),
            outcome.as_str(),
            (!summary.is_empty()).then_some(summary.as_str()),
        );
        Ok(())
    }

    async fn transition(
        &self,
        activity: &mut BackgroundActivity,
        from: ActivityStatus,
        to: ActivityStatus,
    ) -> Result<bool> {
        if !self
            .store
            .compare_and_set_activity_status(activity.activity_id, from, to)
            .await?
        {
            debug!(activity_id = activity.activity_id, from = %from, to = %to, "Activity transition lost the race");
            return Ok(false);
        }
        activity.status = to;
        Ok(true)
    }

    /// Move scheduled activities whose start time has passed to `InProgress`
    pub async fn activate_scheduled(&self, endpoint_id: i64) -> Result<usize> {
        let now = Utc::now();
        let mut activated = 0;
        for mut activity in self
            .store
            .list_activities(endpoint_id, &[ActivityStatus::Scheduled])
            .await?
        {
            if activity.start_at.is_some_and(|at| at > now) {
                continue;
            }
            if self
                .transition(&mut activity, ActivityStatus::Scheduled, ActivityStatus::InProgress)
                .await?
            {
                activated += 1;
            }
        }
        Ok(activated)
    }

    /// Fail activities whose handler lock was left behind by a dead driver
    pub async fn cancel_crashed(&self, endpoint_id: i64, crashed_after: Duration) -> Result<usize> {
        let cutoff = ChronoDuration::from_std(crashed_after)
            .map(|age| Utc::now() - age)
            .map_err(|e| TaskerError::ValidationError(format!("bad crash cutoff: {e}")))?;
        let mut cancelled = 0;
        for mut activity in self
            .store
            .list_activities(endpoint_id, &[ActivityStatus::InProgress])
            .await?
        {
            if activity.handler_lock.is_none() || activity.updated_at >= cutoff {
                continue;
            }
            if self
                .transition(&mut activity, ActivityStatus::InProgress, ActivityStatus::InternalError)
                .await?
            {
                self.store.clear_activity_lock(activity.activity_id).await?;
                cancelled += 1;
                log_activity_operation(
                    "cancel_crashed",
                    Some(activity.activity_id),
                    Some(&activity.activity_type),
                    ActivityStatus::InternalError.as_str(),
                    Some("Cancelled crashed"),
                );
            }
        }
        Ok(cancelled)
    }

    pub async fn cancel(&self, activity_id: ActivityId) -> Result<bool> {
        self.control(activity_id, ActivityStatus::cancelled).await
    }

    pub async fn suspend(&self, activity_id: ActivityId) -> Result<bool> {
        self.control(activity_id, ActivityStatus::suspended).await
    }

    pub async fn unsuspend(&self, activity_id: ActivityId) -> Result<bool> {
        self.control(activity_id, ActivityStatus::unsuspended).await
    }

    async fn control(
        &self,
        activity_id: ActivityId,
        target: fn(&ActivityStatus) -> Option<ActivityStatus>,
    ) -> Result<bool> {
        let mut activity = self.store.get_activity(activity_id).await?;
        let from = activity.status;
        match target(&from) {
            Some(to) => self.transition(&mut activity, from, to).await,
            None => Ok(false),
        }
    }

    /// Abort an in-progress activity with a message on its current item
    pub async fn internal_error(&self, activity: &mut BackgroundActivity, message: &str) -> Result<bool> {
        let idx = activity.current_item;
        if activity.messages.len() <= idx {
            activity.messages.resize(idx + 1, None);
        }
        activity.messages[idx] = Some(message.to_string());
        self.store.save_activity(activity).await?;
        let changed = self
            .transition(activity, ActivityStatus::InProgress, ActivityStatus::InternalError)
            .await?;
        if changed {
            warn!(activity_id = activity.activity_id, error = %message, "Activity aborted");
        }
        Ok(changed)
    }
}

fn parse_task_id(item: &str) -> anyhow::Result<TaskId> {
    item.trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("'{item}' is not a task id"))
}

/// Items are task ids; option `"as_file": true` hands archives to storage
struct ArchiveTaskWorkdir {
    cluster: ClusterController,
}

#[async_trait]
impl ActivityHandler for ArchiveTaskWorkdir {
    fn activity_type(&self) -> &str {
        "ArchiveTaskWorkdir"
    }

    async fn process_item(&self, activity: &BackgroundActivity, item: &str) -> anyhow::Result<ItemOutcome> {
        let task_id = parse_task_id(item)?;
        let mut task = self.cluster.store().get_task(task_id).await?;
        let as_file = activity
            .options
            .get("as_file")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let archived = if as_file {
            self.cluster.archive_workdir_as_file(&mut task).await?
        } else {
            self.cluster.archive_workdir(&mut task).await?
        };
        if archived {
            info!(task_id, "Work directory archived by background activity");
            Ok((true, None))
        } else {
            Ok((false, Some("Not archived".to_string())))
        }
    }
}

struct UnarchiveTaskWorkdir {
    cluster: ClusterController,
}

#[async_trait]
impl ActivityHandler for UnarchiveTaskWorkdir {
    fn activity_type(&self) -> &str {
        "UnarchiveTaskWorkdir"
    }

    async fn process_item(&self, _activity: &BackgroundActivity, item: &str) -> anyhow::Result<ItemOutcome> {
        let task_id = parse_task_id(item)?;
        let mut task = self.cluster.store().get_task(task_id).await?;
        if self.cluster.unarchive_workdir(&mut task).await? {
            Ok((true, None))
        } else {
            Ok((false, Some("Not unarchived".to_string())))
        }
    }
}
