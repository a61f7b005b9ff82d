//! # Status Transition Engine
//!
//! The single path through which a task's status changes.
//!
//! ## Contract
//!
//! `transition(task, from, to)` succeeds only if the persisted status still
//! equals `from`. The store performs the check and the write as one atomic
//! compare-and-set, so two pollers racing on the same task can never both
//! win. On success the callbacks resolved for `from -> to` run in order with
//! the prior status. On a mismatch nothing is written, no callback runs and
//! `false` comes back; [`transition_strict`](StatusTransitionEngine::transition_strict)
//! turns that into a typed [`StateMachineError::TransitionConflict`].
//!
//! A transition with `from == to` succeeds without touching the store.

use super::callbacks::CallbackTable;
use super::errors::StateMachineError;
use crate::error::{Result, TaskerError};
use crate::models::{Task, TaskId};
use crate::state_machine::TaskStatus;
use crate::store::{CasOutcome, TaskStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct StatusTransitionEngine {
    store: Arc<dyn TaskStore>,
    callbacks: Arc<CallbackTable>,
}

impl std::fmt::Debug for StatusTransitionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusTransitionEngine")
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl StatusTransitionEngine {
    pub fn new(store: Arc<dyn TaskStore>, callbacks: CallbackTable) -> Self {
        Self {
            store,
            callbacks: Arc::new(callbacks),
        }
    }

    /// Engine with the built-in callback table
    pub fn with_builtin_callbacks(store: Arc<dyn TaskStore>) -> Self {
        Self::new(store, CallbackTable::with_builtin())
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Compare-and-set `from -> to`; `Ok(false)` when another poller won.
    ///
    /// On success `task` is updated in place to mirror the persisted row.
    pub async fn transition(
        &self,
        task: &mut Task,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool> {
        if from == to {
            return Ok(true);
        }

        match self
            .store
            .compare_and_set_status(task.task_id, from, to)
            .await
        {
            Ok(CasOutcome::Applied) => {}
            Ok(CasOutcome::Conflict(found)) => {
                debug!(
                    task_id = task.task_id,
                    from = %from,
                    to = %to,
                    found = %found,
                    "Transition lost the race"
                );
                return Ok(false);
            }
            Err(TaskerError::TaskNotFound(id)) => {
                return Err(StateMachineError::NoSuchTask(id).into());
            }
            Err(e) => {
                return Err(StateMachineError::PersistenceFailed {
                    reason: e.to_string(),
                }
                .into())
            }
        }

        let now = Utc::now();
        task.status = to;
        task.updated_at = now;
        if to == TaskStatus::DataReady {
            task.data_ready_at = Some(now);
        }
        debug!(task_id = task.task_id, from = %from, to = %to, "Status transition");

        self.run_callbacks(task, from).await;
        Ok(true)
    }

    /// Like [`transition`](Self::transition) but a lost race is an error
    pub async fn transition_strict(
        &self,
        task: &mut Task,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<()> {
        if self.transition(task, from, to).await? {
            return Ok(());
        }
        let found = self
            .store
            .find_task(task.task_id)
            .await?
            .map(|t| t.status)
            .ok_or(StateMachineError::NoSuchTask(task.task_id))?;
        Err(StateMachineError::TransitionConflict {
            task_id: task.task_id,
            from,
            to,
            found,
        }
        .into())
    }

    /// Transition a task known only by id
    pub async fn transition_by_id(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool> {
        let mut task = self
            .store
            .find_task(task_id)
            .await?
            .ok_or(StateMachineError::NoSuchTask(task_id))?;
        self.transition(&mut task, from, to).await
    }

    async fn run_callbacks(&self, task: &Task, prior: TaskStatus) {
        for callback in self.callbacks.resolve(prior, task.status) {
            if let Err(e) = callback.on_transition(self, task, prior).await {
                let err = StateMachineError::CallbackFailed {
                    name: callback.name().to_string(),
                    reason: e.to_string(),
                };
                warn!(task_id = task.task_id, error = %err, "❌ ERROR: transition callback");
            }
        }
    }
}
