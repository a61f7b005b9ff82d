//! Work unit driving background activities of one endpoint.
//!
//! Each round activates due scheduled activities, fails the ones abandoned
//! by a dead driver, then works on one in-progress activity under its
//! handler lock for at most one time slice.

use super::{DriverContext, WorkUnit};
use crate::activities::ActivityManager;
use crate::config::ActivityConfig;
use crate::error::Result;
use crate::models::{ActivityStatus, BackgroundActivity};
use crate::store::ActivityStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

pub struct ActivityWorker {
    name: String,
    holder: String,
    manager: ActivityManager,
    config: ActivityConfig,
    endpoint_id: i64,
}

impl std::fmt::Debug for ActivityWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityWorker")
            .field("name", &self.name)
            .field("endpoint_id", &self.endpoint_id)
            .finish_non_exhaustive()
    }
}

impl ActivityWorker {
    pub fn new(manager: ActivityManager, config: ActivityConfig, endpoint_id: i64) -> Self {
        Self {
            name: format!("activity-worker-{endpoint_id}"),
            holder: Uuid::new_v4().to_string(),
            manager,
            config,
            endpoint_id,
        }
    }

    fn store(&self) -> &Arc<dyn ActivityStore> {
        self.manager.store()
    }

    /// Lock the first in-progress activity nobody else holds
    async fn claim_next(&self) -> Result<Option<BackgroundActivity>> {
        let candidates = self
            .store()
            .list_activities(self.endpoint_id, &[ActivityStatus::InProgress])
            .await?;
        for candidate in candidates {
            if candidate.handler_lock.is_some() {
                continue;
            }
            if self
                .store()
                .acquire_activity_lock(candidate.activity_id, &self.holder)
                .await?
            {
                // Reload to pick up progress saved by the previous holder
                return self.store().find_activity(candidate.activity_id).await;
            }
        }
        Ok(None)
    }

    /// One slice of work on one activity; returns the items processed
    pub async fn work_one_slice(&self, ctx: &DriverContext) -> Result<usize> {
        let Some(mut activity) = self.claim_next().await? else {
            return Ok(0);
        };
        let started = Instant::now();
        let slice = self.config.time_slice();
        let mut processed = 0;

        let result = loop {
            match self.manager.process_next_item(&mut activity).await {
                Ok(true) => processed += 1,
                Ok(false) => {
                    processed += 1;
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
            if ctx.is_stopping() || started.elapsed() >= slice {
                debug!(
                    activity_id = activity.activity_id,
                    processed, "Yielding activity at end of time slice"
                );
                break Ok(());
            }
        };

        self.store()
            .release_activity_lock(activity.activity_id, &self.holder)
            .await?;
        result.map(|()| processed)
    }
}

#[async_trait]
impl WorkUnit for ActivityWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn do_regular_work(&mut self, ctx: &DriverContext) -> Result<()> {
        let activated = self.manager.activate_scheduled(self.endpoint_id).await?;
        let crashed = self
            .manager
            .cancel_crashed(self.endpoint_id, self.config.crashed_after())
            .await?;
        if activated > 0 || crashed > 0 {
            info!(driver = %self.name, activated, crashed, "Activity housekeeping");
        }
        self.work_one_slice(ctx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::{ActivityHandler, ActivityRegistry, ItemOutcome};
    use crate::store::MemoryStore;
    use crate::worker::DriverHandle;

    struct AlwaysOk;

    #[async_trait]
    impl ActivityHandler for AlwaysOk {
        fn activity_type(&self) -> &str {
            "AlwaysOk"
        }

        async fn process_item(
            &self,
            _activity: &BackgroundActivity,
            _item: &str,
        ) -> anyhow::Result<ItemOutcome> {
            Ok((true, None))
        }
    }

    fn worker(store: Arc<MemoryStore>, slice_secs: u64) -> ActivityWorker {
        let registry = ActivityRegistry::new();
        registry.register(Arc::new(AlwaysOk));
        let manager = ActivityManager::new(store, Arc::new(registry));
        let config = ActivityConfig {
            time_slice_seconds: slice_secs,
            ..ActivityConfig::default()
        };
        ActivityWorker::new(manager, config, 1)
    }

    fn ctx() -> DriverContext {
        DriverContext::new(DriverHandle::new(), "test")
    }

    #[tokio::test]
    async fn test_slice_runs_activity_to_completion_and_unlocks() {
        let store = Arc::new(MemoryStore::new());
        let activity = store
            .create_activity(BackgroundActivity::new(
                "AlwaysOk",
                1,
                1,
                vec!["a".into(), "b".into(), "c".into()],
            ))
            .await
            .unwrap();
        let worker = worker(store.clone(), 60);

        worker.work_one_slice(&ctx()).await.unwrap();
        let stored = store.get_activity(activity.activity_id).await.unwrap();
        assert_eq!(stored.status, ActivityStatus::Completed);
        assert_eq!(stored.num_successes, 3);
        assert!(stored.handler_lock.is_none());
    }

    #[tokio::test]
    async fn test_zero_slice_yields_after_one_item() {
        let store = Arc::new(MemoryStore::new());
        let activity = store
            .create_activity(BackgroundActivity::new(
                "AlwaysOk",
                1,
                1,
                vec!["a".into(), "b".into()],
            ))
            .await
            .unwrap();
        let worker = worker(store.clone(), 0);

        assert_eq!(worker.work_one_slice(&ctx()).await.unwrap(), 1);
        let stored = store.get_activity(activity.activity_id).await.unwrap();
        assert_eq!(stored.status, ActivityStatus::InProgress);
        assert_eq!(stored.current_item, 1);
        assert!(stored.handler_lock.is_none());
    }

    #[tokio::test]
    async fn test_locked_activity_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let activity = store
            .create_activity(BackgroundActivity::new("AlwaysOk", 1, 1, vec!["a".into()]))
            .await
            .unwrap();
        assert!(store
            .acquire_activity_lock(activity.activity_id, "someone-else")
            .await
            .unwrap());
        let worker = worker(store.clone(), 60);

        assert_eq!(worker.work_one_slice(&ctx()).await.unwrap(), 0);
        let stored = store.get_activity(activity.activity_id).await.unwrap();
        assert_eq!(stored.current_item, 0);
    }
}
