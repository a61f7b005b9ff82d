//! # Task Record
//!
//! The persistent entity describing one job: identity, ownership, tool,
//! parameters, status, dependency declarations and the user-visible log.
//!
//! The status field is only ever changed through
//! [`StatusTransitionEngine`](crate::state_machine::StatusTransitionEngine);
//! store updates of the other fields never touch it.

use crate::error::{Result, TaskerError};
use crate::models::prerequisites::{GatingPoint, Prerequisites, Requirement};
use crate::state_machine::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type TaskId = i64;

/// One timestamped line of a task's own log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl TaskLogEntry {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.at.format("%Y-%m-%d %H:%M:%S"), self.message)
    }
}

/// Behavior switches stored alongside a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFlags {
    /// Stop after preparation in `Configured` instead of submitting
    #[serde(default)]
    pub configure_only: bool,
    /// Next setup goes straight to submission (cluster-stage recovery)
    #[serde(default)]
    pub submit_without_setup: bool,
    /// Skip the end-of-job marker check (restart at post-processing)
    #[serde(default)]
    pub no_end_marker_check: bool,
    /// Tool may drop subtask descriptors into its work directory
    #[serde(default)]
    pub can_submit_subtasks: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub user_id: i64,
    pub group_id: i64,
    /// Execution endpoint the task runs on
    pub endpoint_id: i64,
    /// Job kind; selects the tool handler from the registry
    pub tool_class: String,
    pub tool_config_id: Option<i64>,
    pub description: Option<String>,
    /// Job-specific parameter bag, opaque to the engine
    pub params: serde_json::Value,
    pub status: TaskStatus,
    /// Incremented on restart, stable across recovery
    pub run_number: i32,
    pub cluster_jobid: Option<String>,
    /// Work directory relative to the endpoint's work root
    pub cluster_workdir: Option<String>,
    pub cluster_workdir_size: Option<i64>,
    pub batch_id: Option<TaskId>,
    /// Depth of dynamic subtask spawning, 0 for user submitted tasks
    pub level: i32,
    pub prerequisites: Prerequisites,
    pub share_workdir_with: Option<TaskId>,
    pub log: Vec<TaskLogEntry>,
    pub workdir_archived: bool,
    pub workdir_archive_file_id: Option<i64>,
    pub flags: TaskFlags,
    /// Terminal state a restart returns to when its preparation fails
    pub restart_return_status: Option<TaskStatus>,
    /// When the task last entered `Data Ready`
    pub data_ready_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Identifier of one run: `"{id}-{run_number}"`
    pub fn run_id(&self) -> String {
        self.run_id_for(self.run_number)
    }

    pub fn run_id_for(&self, run_number: i32) -> String {
        format!("{}-{}", self.task_id, run_number)
    }

    /// Short name used in file names and logs, e.g. `"Shell"`
    pub fn name(&self) -> &str {
        self.tool_class
            .rsplit("::")
            .next()
            .unwrap_or(self.tool_class.as_str())
    }

    /// Whether this task owns the directory it runs in
    pub fn owns_workdir(&self) -> bool {
        self.share_workdir_with.is_none()
    }

    /// Append a timestamped entry to the in-memory log and return it so the
    /// caller can persist it.
    pub fn addlog(&mut self, message: impl Into<String>) -> TaskLogEntry {
        let entry = TaskLogEntry::now(message);
        self.log.push(entry.clone());
        entry
    }

    /// Log a failure with its cause chain, e.g. `"Setup failed: no input: file missing"`
    pub fn addlog_error(&mut self, context: &str, err: &anyhow::Error) -> TaskLogEntry {
        self.addlog(format!("{context}: {err:#}"))
    }

    pub fn add_prerequisite(
        &mut self,
        gate: GatingPoint,
        other: TaskId,
        required: Requirement,
    ) -> Result<()> {
        self.prerequisites.add(self.task_id, gate, other, required)
    }

    pub fn remove_prerequisite(&mut self, gate: GatingPoint, other: TaskId) -> Option<Requirement> {
        self.prerequisites.remove(gate, other)
    }

    /// Run in the work directory of `other`; setup waits for it to reach `required`
    pub fn share_workdir_with(&mut self, other: TaskId, required: Requirement) -> Result<()> {
        if other == self.task_id {
            return Err(TaskerError::ValidationError(format!(
                "Task {} cannot share its own work directory",
                self.task_id
            )));
        }
        self.share_workdir_with = Some(other);
        self.add_prerequisite(GatingPoint::BeforeSetup, other, required)
    }

    /// Assign the batch once; later attempts to change it are refused
    pub fn set_batch_id(&mut self, batch_id: TaskId) -> Result<()> {
        match self.batch_id {
            Some(existing) if existing != batch_id => Err(TaskerError::ValidationError(format!(
                "Task {} already belongs to batch {existing}",
                self.task_id
            ))),
            _ => {
                self.batch_id = Some(batch_id);
                Ok(())
            }
        }
    }
}

/// Fields needed to create a task record; the store assigns id and timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub user_id: i64,
    pub group_id: i64,
    pub endpoint_id: i64,
    pub tool_class: String,
    pub tool_config_id: Option<i64>,
    pub description: Option<String>,
    pub params: serde_json::Value,
    pub status: TaskStatus,
    pub batch_id: Option<TaskId>,
    pub level: i32,
    pub prerequisites: Prerequisites,
    pub share_workdir_with: Option<TaskId>,
    pub flags: TaskFlags,
}

impl NewTask {
    pub fn new(user_id: i64, endpoint_id: i64, tool_class: impl Into<String>) -> Self {
        Self {
            user_id,
            group_id: 0,
            endpoint_id,
            tool_class: tool_class.into(),
            tool_config_id: None,
            description: None,
            params: serde_json::Value::Object(serde_json::Map::new()),
            status: TaskStatus::New,
            batch_id: None,
            level: 0,
            prerequisites: Prerequisites::default(),
            share_workdir_with: None,
            flags: TaskFlags::default(),
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_group(mut self, group_id: i64) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_prerequisites(mut self, prerequisites: Prerequisites) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Materialize into a record with the id the store picked
    pub fn into_task(self, task_id: TaskId, now: DateTime<Utc>) -> Task {
        Task {
            task_id,
            user_id: self.user_id,
            group_id: self.group_id,
            endpoint_id: self.endpoint_id,
            tool_class: self.tool_class,
            tool_config_id: self.tool_config_id,
            description: self.description,
            params: self.params,
            status: self.status,
            run_number: 1,
            cluster_jobid: None,
            cluster_workdir: None,
            cluster_workdir_size: None,
            batch_id: self.batch_id,
            level: self.level,
            prerequisites: self.prerequisites,
            share_workdir_with: self.share_workdir_with,
            log: Vec::new(),
            workdir_archived: false,
            workdir_archive_file_id: None,
            flags: self.flags,
            restart_return_status: None,
            data_ready_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
