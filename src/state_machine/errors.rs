use crate::models::task::TaskId;
use crate::state_machine::states::TaskStatus;
use thiserror::Error;

/// Errors raised by the status transition engine
#[derive(Error, Debug)]
pub enum StateMachineError {
    /// The persisted status did not match the expected one. Another poller
    /// got there first; callers treat this as "no-op, try later".
    #[error("Transition conflict on task {task_id}: from '{from}' to '{to}' but found '{found}'")]
    TransitionConflict {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        found: TaskStatus,
    },

    #[error("Task {0} does not exist")]
    NoSuchTask(TaskId),

    #[error("Persistence operation failed: {reason}")]
    PersistenceFailed { reason: String },

    #[error("Callback '{name}' failed: {reason}")]
    CallbackFailed { name: String, reason: String },
}

impl StateMachineError {
    /// Races are expected under concurrent pollers and are never escalated
    pub fn is_race(&self) -> bool {
        matches!(self, Self::TransitionConflict { .. })
    }
}

/// Type alias for state machine operation results
pub type StateMachineResult<T> = Result<T, StateMachineError>;
