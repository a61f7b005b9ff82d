//! # Prerequisite Evaluator
//!
//! Maps a task's dependency declaration at one gating point, plus the current
//! status of every referenced task, to a tri-state [`Verdict`].
//!
//! ## Architecture
//!
//! - [`coverage`] is the fixed policy table: for a required state and an
//!   observed status it answers go, wait or fail. Statuses not listed for a
//!   requirement default to wait.
//! - [`evaluate`] is pure. Every pair is checked so the returned
//!   [`Evaluation`] lists all blocking tasks, then the verdicts are folded:
//!   any fail wins, otherwise any wait, otherwise go.
//! - [`PrerequisiteEvaluator`] resolves statuses through the store and writes
//!   the diagnostics into the task's own log.
//!
//! Self-references and unknown task ids are configuration errors.

use crate::error::{Result, TaskerError};
use crate::models::{GatingPoint, Requirement, Task, TaskId};
use crate::state_machine::TaskStatus;
use crate::store::TaskStore;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Outcome of a prerequisite check
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verdict {
    Go,
    Wait,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Go => f.write_str("go"),
            Self::Wait => f.write_str("wait"),
            Self::Fail => f.write_str("fail"),
        }
    }
}

/// Coverage table: what `status` means for a task required to reach `required`
pub fn coverage(required: Requirement, status: TaskStatus) -> Verdict {
    use TaskStatus as S;

    match required {
        Requirement::Queued => match status {
            S::Queued
            | S::OnCpu
            | S::Suspended
            | S::OnHold
            | S::DataReady
            | S::PostProcessing
            | S::Subtasking
            | S::Completed => Verdict::Go,
            s if s.is_failure() => Verdict::Fail,
            _ => Verdict::Wait,
        },
        Requirement::DataReady => match status {
            S::DataReady | S::PostProcessing | S::Completed => Verdict::Go,
            s if s.is_failure() => Verdict::Fail,
            _ => Verdict::Wait,
        },
        Requirement::Completed => match status {
            S::Completed => Verdict::Go,
            s if s.is_failure() => Verdict::Fail,
            _ => Verdict::Wait,
        },
        Requirement::Failed => match status {
            S::Completed | S::Terminated => Verdict::Fail,
            s if s.is_failure() => Verdict::Go,
            _ => Verdict::Wait,
        },
        Requirement::Standby => match status {
            S::Standby | S::Completed => Verdict::Go,
            s if s.is_failure() => Verdict::Fail,
            _ => Verdict::Wait,
        },
        Requirement::Configured => match status {
            S::Configured | S::Completed => Verdict::Go,
            s if s.is_failure() => Verdict::Fail,
            _ => Verdict::Wait,
        },
    }
}

/// One dependency that did not resolve to go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocker {
    pub task_id: TaskId,
    pub required: Requirement,
    pub found: TaskStatus,
    pub verdict: Verdict,
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task '{}' is in state '{}' while we wanted it in '{}'.",
            self.task_id, self.found, self.required
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub blockers: Vec<Blocker>,
}

impl Evaluation {
    pub fn go() -> Self {
        Self {
            verdict: Verdict::Go,
            blockers: Vec::new(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &Blocker> {
        self.blockers.iter().filter(|b| b.verdict == Verdict::Fail)
    }
}

/// Evaluate `dependencies` of task `owner` against resolved `statuses`
pub fn evaluate(
    owner: TaskId,
    dependencies: &BTreeMap<TaskId, Requirement>,
    statuses: &HashMap<TaskId, TaskStatus>,
) -> Result<Evaluation> {
    if dependencies.is_empty() {
        return Ok(Evaluation::go());
    }

    let mut verdict = Verdict::Go;
    let mut blockers = Vec::new();
    for (&other, &required) in dependencies {
        if other == owner {
            return Err(TaskerError::PrerequisiteError(format!(
                "Task {owner} depends on itself"
            )));
        }
        let found = *statuses.get(&other).ok_or_else(|| {
            TaskerError::PrerequisiteError(format!("Could not find task '{other}'"))
        })?;

        let pair = coverage(required, found);
        if pair != Verdict::Go {
            blockers.push(Blocker {
                task_id: other,
                required,
                found,
                verdict: pair,
            });
        }
        verdict = verdict.max(pair);
    }

    Ok(Evaluation { verdict, blockers })
}

/// Store-backed evaluator used by the drivers
#[derive(Clone)]
pub struct PrerequisiteEvaluator {
    store: Arc<dyn TaskStore>,
}

impl PrerequisiteEvaluator {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Verdict for `task` at `gate`, without side effects
    pub async fn check(&self, task: &Task, gate: GatingPoint) -> Result<Evaluation> {
        let dependencies = task.prerequisites.for_gate(gate);
        if dependencies.is_empty() {
            return Ok(Evaluation::go());
        }
        let ids: Vec<TaskId> = dependencies.keys().copied().collect();
        let statuses = self.store.statuses_of(&ids).await?;
        evaluate(task.task_id, dependencies, &statuses)
    }

    /// Verdict for `task` at `gate`; failures and configuration errors are
    /// written to the task's log and reported as [`Verdict::Fail`]
    #[instrument(skip(self, task), fields(task_id = task.task_id, gate = %gate))]
    pub async fn fulfilled(&self, task: &mut Task, gate: GatingPoint) -> Result<Verdict> {
        let evaluation = match self.check(task, gate).await {
            Ok(evaluation) => evaluation,
            Err(TaskerError::PrerequisiteError(msg)) => {
                warn!(task_id = task.task_id, error = %msg, "Prerequisite configuration error");
                let entry = task.addlog(format!("Prerequisite Check Error: {msg}"));
                self.store.append_log(task.task_id, &entry).await?;
                return Ok(Verdict::Fail);
            }
            Err(e) => return Err(e),
        };

        for blocker in evaluation.failures() {
            let entry = task.addlog(format!("Prerequisite Check Failure: {blocker}"));
            self.store.append_log(task.task_id, &entry).await?;
        }
        debug!(
            task_id = task.task_id,
            verdict = %evaluation.verdict,
            blockers = evaluation.blockers.len(),
            "Prerequisites evaluated"
        );
        Ok(evaluation.verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn deps(pairs: &[(TaskId, Requirement)]) -> BTreeMap<TaskId, Requirement> {
        pairs.iter().copied().collect()
    }

    fn statuses(pairs: &[(TaskId, TaskStatus)]) -> HashMap<TaskId, TaskStatus> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_empty_map_is_go() {
        let result = evaluate(1, &BTreeMap::new(), &HashMap::new()).unwrap();
        assert_eq!(result.verdict, Verdict::Go);
    }

    #[test]
    fn test_completed_requirement_waits_then_fails() {
        let d = deps(&[(2, Requirement::Completed)]);
        let wait = evaluate(1, &d, &statuses(&[(2, TaskStatus::OnCpu)])).unwrap();
        assert_eq!(wait.verdict, Verdict::Wait);

        let fail = evaluate(1, &d, &statuses(&[(2, TaskStatus::Terminated)])).unwrap();
        assert_eq!(fail.verdict, Verdict::Fail);
        assert_eq!(fail.failures().count(), 1);
    }

    #[test]
    fn test_all_pairs_are_reported() {
        let d = deps(&[
            (2, Requirement::Completed),
            (3, Requirement::Queued),
            (4, Requirement::DataReady),
        ]);
        let s = statuses(&[
            (2, TaskStatus::FailedToSetup),
            (3, TaskStatus::Terminated),
            (4, TaskStatus::OnCpu),
        ]);
        let result = evaluate(1, &d, &s).unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(result.failures().count(), 2);
        assert_eq!(result.blockers.len(), 3);
    }

    #[test]
    fn test_failed_requirement_is_inverted() {
        assert_eq!(coverage(Requirement::Failed, TaskStatus::FailedOnCluster), Verdict::Go);
        assert_eq!(coverage(Requirement::Failed, TaskStatus::Completed), Verdict::Fail);
        assert_eq!(coverage(Requirement::Failed, TaskStatus::Terminated), Verdict::Fail);
        assert_eq!(coverage(Requirement::Failed, TaskStatus::OnCpu), Verdict::Wait);
    }

    #[test]
    fn test_recover_and_restart_states_wait() {
        for status in TaskStatus::ALL {
            if status.is_recover() || status.is_restart() {
                for required in Requirement::ALL {
                    assert_eq!(coverage(required, status), Verdict::Wait, "{required} {status}");
                }
            }
        }
    }

    #[test]
    fn test_self_reference_and_unknown_are_errors() {
        let d = deps(&[(1, Requirement::Completed)]);
        assert!(matches!(
            evaluate(1, &d, &statuses(&[(1, TaskStatus::Completed)])),
            Err(TaskerError::PrerequisiteError(_))
        ));

        let d = deps(&[(9, Requirement::Completed)]);
        assert!(matches!(
            evaluate(1, &d, &HashMap::new()),
            Err(TaskerError::PrerequisiteError(_))
        ));
    }

    #[tokio::test]
    async fn test_fulfilled_logs_failures_on_task() {
        let store = Arc::new(MemoryStore::new());
        let other = store
            .create_task(NewTask::new(1, 1, "Shell").with_status(TaskStatus::FailedOnCluster))
            .await
            .unwrap();
        let mut task = store.create_task(NewTask::new(1, 1, "Shell")).await.unwrap();
        task.add_prerequisite(GatingPoint::BeforeSetup, other.task_id, Requirement::Completed)
            .unwrap();

        let evaluator = PrerequisiteEvaluator::new(store.clone());
        let verdict = evaluator
            .fulfilled(&mut task, GatingPoint::BeforeSetup)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Fail);

        let stored = store.get_task(task.task_id).await.unwrap();
        assert_eq!(stored.log.len(), 1);
        assert!(stored.log[0].message.starts_with("Prerequisite Check Failure"));

        let post = evaluator
            .fulfilled(&mut task, GatingPoint::BeforePostProcessing)
            .await
            .unwrap();
        assert_eq!(post, Verdict::Go);
    }

    // Statuses a task passes through on its way to completion, in order.
    const PROGRESSION: [TaskStatus; 7] = [
        TaskStatus::New,
        TaskStatus::SettingUp,
        TaskStatus::Queued,
        TaskStatus::OnCpu,
        TaskStatus::DataReady,
        TaskStatus::PostProcessing,
        TaskStatus::Completed,
    ];

    proptest! {
        #[test]
        fn test_go_never_regresses_as_tasks_progress(
            steps in proptest::collection::vec((0usize..7, 0usize..7), 1..5),
            reqs in proptest::collection::vec(0usize..3, 1..5),
        ) {
            let requirements = [Requirement::Queued, Requirement::DataReady, Requirement::Completed];
            let n = steps.len().min(reqs.len());
            let d: BTreeMap<TaskId, Requirement> = (0..n)
                .map(|i| (i as TaskId + 10, requirements[reqs[i]]))
                .collect();
            let before: HashMap<TaskId, TaskStatus> = (0..n)
                .map(|i| (i as TaskId + 10, PROGRESSION[steps[i].0.min(steps[i].1)]))
                .collect();
            let after: HashMap<TaskId, TaskStatus> = (0..n)
                .map(|i| (i as TaskId + 10, PROGRESSION[steps[i].0.max(steps[i].1)]))
                .collect();

            let v1 = evaluate(1, &d, &before).unwrap().verdict;
            let v2 = evaluate(1, &d, &after).unwrap().verdict;
            if v1 == Verdict::Go {
                prop_assert_eq!(v2, Verdict::Go);
            }
        }
    }
}
