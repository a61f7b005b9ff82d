use crate::models::task::TaskId;
use crate::state_machine::errors::StateMachineError;
use thiserror::Error;

/// Crate-wide error type.
///
/// Stage failures inside tool steps never surface as a `TaskerError`; the
/// controllers turn them into status transitions. What does surface here is
/// configuration problems, persistence failures and collaborator errors.
#[derive(Error, Debug)]
pub enum TaskerError {
    #[error("Task database error: {0}")]
    DatabaseError(String),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Prerequisite error: {0}")]
    PrerequisiteError(String),

    #[error("Scheduler error: {0}")]
    SchedulerError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Invalid input: {0}")]
    ValidationError(String),

    #[error("Bad configuration: {0}")]
    ConfigurationError(String),

    #[error("Task {0} does not exist")]
    TaskNotFound(TaskId),

    #[error("Task is not in a usable state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<sqlx::Error> for TaskerError {
    fn from(err: sqlx::Error) -> Self {
        TaskerError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for TaskerError {
    fn from(err: serde_json::Error) -> Self {
        TaskerError::ValidationError(format!("JSON error: {err}"))
    }
}

impl From<walkdir::Error> for TaskerError {
    fn from(err: walkdir::Error) -> Self {
        TaskerError::Io(std::io::Error::other(err.to_string()))
    }
}

impl From<crate::config::ConfigurationError> for TaskerError {
    fn from(err: crate::config::ConfigurationError) -> Self {
        TaskerError::ConfigurationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TaskerError>;
