//! # Transition Callbacks
//!
//! An explicit table mapping `(from, to)` status patterns to ordered callback
//! lists, built once at startup and handed to the
//! [`StatusTransitionEngine`](super::StatusTransitionEngine).
//!
//! ## Resolution
//!
//! Either side of a pattern may be [`StatusPattern::Any`]. For a concrete
//! transition the applicable lists are merged most-specific first:
//!
//! 1. `(from, to)`
//! 2. `(from, *)`
//! 3. `(*, to)`
//! 4. `(*, *)`
//!
//! Callbacks are identified by [`TransitionCallback::name`]. A name appearing
//! under several applicable patterns runs once, at its most specific position.
//! Registering a name again at the same pattern replaces the earlier callback
//! in place.

use super::engine::StatusTransitionEngine;
use crate::error::Result;
use crate::models::Task;
use crate::state_machine::TaskStatus;
use crate::store::TaskFilter;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Hook run after a successful status change
#[async_trait]
pub trait TransitionCallback: Send + Sync {
    /// Identity used for de-duplication and logging
    fn name(&self) -> &str;

    /// `task` already carries the new status; `prior` is the one it left
    async fn on_transition(
        &self,
        engine: &StatusTransitionEngine,
        task: &Task,
        prior: TaskStatus,
    ) -> Result<()>;
}

/// One side of a callback pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusPattern {
    Any,
    Exact(TaskStatus),
}

impl From<TaskStatus> for StatusPattern {
    fn from(status: TaskStatus) -> Self {
        Self::Exact(status)
    }
}

impl fmt::Display for StatusPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(status) => write!(f, "{status}"),
        }
    }
}

#[derive(Clone, Default)]
pub struct CallbackTable {
    entries: HashMap<(StatusPattern, StatusPattern), Vec<Arc<dyn TransitionCallback>>>,
}

impl fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut patterns: Vec<String> = self
            .entries
            .iter()
            .map(|((from, to), cbs)| {
                let names: Vec<&str> = cbs.iter().map(|cb| cb.name()).collect();
                format!("{from} -> {to}: {names:?}")
            })
            .collect();
        patterns.sort();
        f.debug_struct("CallbackTable")
            .field("patterns", &patterns)
            .finish()
    }
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the callbacks every deployment runs
    pub fn with_builtin() -> Self {
        let mut table = Self::new();
        table.register(
            StatusPattern::Any,
            TaskStatus::FailedSetupPrerequisites.into(),
            Arc::new(PrerequisiteFailureCascade),
        );
        table
    }

    pub fn register(
        &mut self,
        from: StatusPattern,
        to: StatusPattern,
        callback: Arc<dyn TransitionCallback>,
    ) -> &mut Self {
        let list = self.entries.entry((from, to)).or_default();
        match list.iter_mut().find(|cb| cb.name() == callback.name()) {
            Some(existing) => *existing = callback,
            None => list.push(callback),
        }
        self
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(
        mut self,
        from: StatusPattern,
        to: StatusPattern,
        callback: Arc<dyn TransitionCallback>,
    ) -> Self {
        self.register(from, to, callback);
        self
    }

    /// Ordered, de-duplicated callbacks applying to `from -> to`
    pub fn resolve(&self, from: TaskStatus, to: TaskStatus) -> Vec<Arc<dyn TransitionCallback>> {
        let keys = [
            (StatusPattern::Exact(from), StatusPattern::Exact(to)),
            (StatusPattern::Exact(from), StatusPattern::Any),
            (StatusPattern::Any, StatusPattern::Exact(to)),
            (StatusPattern::Any, StatusPattern::Any),
        ];
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for key in keys {
            for cb in self.entries.get(&key).into_iter().flatten() {
                if seen.insert(cb.name().to_string()) {
                    resolved.push(Arc::clone(cb));
                }
            }
        }
        resolved
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }
}

/// Fails dependents that can no longer start because a task they wait on
/// failed its own setup prerequisites.
///
/// Dependents still in `New` or `Configured` move to
/// `Failed Setup Prerequisites`, which cascades further down the chain.
#[derive(Debug, Default)]
pub struct PrerequisiteFailureCascade;

#[async_trait]
impl TransitionCallback for PrerequisiteFailureCascade {
    fn name(&self) -> &str {
        "prerequisite_failure_cascade"
    }

    async fn on_transition(
        &self,
        engine: &StatusTransitionEngine,
        task: &Task,
        prior: TaskStatus,
    ) -> Result<()> {
        let dependents = engine.store().find_dependents(task.task_id).await?;
        debug!(
            task_id = task.task_id,
            prior = %prior,
            dependents = dependents.len(),
            "Cascading prerequisite failure"
        );

        let waiting = TaskFilter::with_statuses([TaskStatus::New, TaskStatus::Configured]);
        for mut dependent in dependents.into_iter().filter(|t| waiting.matches(t)) {
            let from = dependent.status;
            if engine
                .transition(&mut dependent, from, TaskStatus::FailedSetupPrerequisites)
                .await?
            {
                let entry = dependent.addlog(format!(
                    "Prerequisite task {} failed its own prerequisites; this task cannot start.",
                    task.task_id
                ));
                engine.store().append_log(dependent.task_id, &entry).await?;
                info!(
                    task_id = dependent.task_id,
                    blocking_task_id = task.task_id,
                    "Dependent failed through prerequisite cascade"
                );
            }
        }
        Ok(())
    }
}
