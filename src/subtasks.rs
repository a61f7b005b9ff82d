//! # Dynamic Subtask Submission
//!
//! A running job may ask for more tasks by dropping hidden descriptor files
//! named `.new-task-*.json` at the root of its work directory:
//!
//! ```json
//! {
//!   "tool-class": "Shell",
//!   "parameters": { "commands": ["./step2.sh"] },
//!   "tool-config-id": 12,
//!   "share-wd-tid": 345,
//!   "description": "second pass",
//!   "prerequisites": "346,347",
//!   "required-to-post-process": true
//! }
//! ```
//!
//! Each valid descriptor becomes a `New` task owned by the same user, with the
//! parent's id as `batch_id` and `level` one deeper. The new id is written to
//! a companion `.new-task-*.response` file. A `tool-config-id` moves the new
//! task to the endpoint that configuration is mapped to in
//! `execution.tool_config_endpoints`; without one it stays on the parent's
//! endpoint. With `required-to-post-process` the parent
//! will not post-process before the new task completes.
//!
//! The scan runs with the parent in the transient `Subtasking` status, so two
//! drivers cannot consume the same descriptors. Every descriptor file is
//! deleted once handled, valid or not.

use crate::constants::workdir::{
    SUBTASK_DESCRIPTOR_PREFIX, SUBTASK_DESCRIPTOR_SUFFIX, SUBTASK_RESPONSE_SUFFIX,
};
use crate::error::{Result, TaskerError};
use crate::execution::ClusterController;
use crate::models::{GatingPoint, NewTask, Requirement, Task, TaskId};
use crate::state_machine::TaskStatus;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubtaskDescriptor {
    pub tool_class: String,
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub tool_config_id: Option<i64>,
    #[serde(default)]
    pub share_wd_tid: Option<TaskId>,
    #[serde(default)]
    pub description: Option<String>,
    /// Comma-separated task ids that must be `Completed` before setup
    #[serde(default)]
    pub prerequisites: Option<String>,
    #[serde(default)]
    pub required_to_post_process: bool,
}

impl SubtaskDescriptor {
    pub fn parse(content: &str) -> Result<Self> {
        let descriptor: Self = serde_json::from_str(content)?;
        if descriptor.tool_class.trim().is_empty() {
            return Err(TaskerError::ValidationError("'tool-class' is empty".to_string()));
        }
        Ok(descriptor)
    }

    pub fn prerequisite_ids(&self) -> Result<Vec<TaskId>> {
        let Some(list) = self.prerequisites.as_deref() else {
            return Ok(Vec::new());
        };
        list.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| {
                id.parse::<TaskId>().map_err(|_| {
                    TaskerError::ValidationError(format!("'{id}' is not a task id"))
                })
            })
            .collect()
    }
}

/// Descriptor files waiting in `workdir`, sorted by name
pub async fn find_descriptors(workdir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(workdir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(SUBTASK_DESCRIPTOR_PREFIX)
            && name.ends_with(SUBTASK_DESCRIPTOR_SUFFIX)
            && entry.file_type().await?.is_file()
        {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

fn response_path(descriptor: &Path) -> PathBuf {
    descriptor.with_extension(SUBTASK_RESPONSE_SUFFIX.trim_start_matches('.'))
}

#[derive(Debug, Clone)]
pub struct SubtaskSubmitter {
    cluster: ClusterController,
}

impl SubtaskSubmitter {
    pub fn new(cluster: ClusterController) -> Self {
        Self { cluster }
    }

    /// Consume the descriptors of an on-remote `task`; returns the ids of
    /// the tasks created.
    #[instrument(skip(self, task), fields(task_id = task.task_id))]
    pub async fn submit_subtasks(&self, task: &mut Task) -> Result<Vec<TaskId>> {
        let current = task.status;
        if !task.flags.can_submit_subtasks || !current.is_on_remote() {
            return Ok(Vec::new());
        }
        let Some(workdir) = self.cluster.existing_workdir(task) else {
            return Ok(Vec::new());
        };
        let descriptors = find_descriptors(&workdir).await?;
        if descriptors.is_empty() {
            return Ok(Vec::new());
        }

        let engine = self.cluster.engine();
        if !engine.transition(task, current, TaskStatus::Subtasking).await? {
            return Ok(Vec::new());
        }
        let mark = task.log.len();

        let consumed = self.consume(task, &descriptors).await;
        if let Err(e) = &consumed {
            warn!(task_id = task.task_id, error = %e, "Subtask submission interrupted");
            task.addlog(format!("Subtask submission interrupted: {e}"));
        }
        // Restored on every path, errors included
        let restored = engine.transition(task, TaskStatus::Subtasking, current).await;
        if consumed.is_err() {
            if let Err(e) = self.cluster.store().save_task(task, mark).await {
                warn!(task_id = task.task_id, error = %e, "Cannot save subtask log");
            }
        }
        let created = consumed?;
        restored?;
        Ok(created)
    }

    async fn consume(&self, task: &mut Task, descriptors: &[PathBuf]) -> Result<Vec<TaskId>> {
        let mark = task.log.len();
        let mut created = Vec::new();
        for path in descriptors {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.submit_one(task, path).await {
                Ok(child_id) => {
                    created.push(child_id);
                    if let Err(e) = tokio::fs::write(response_path(path), format!("{child_id}\n")).await {
                        warn!(task_id = task.task_id, file = %file, error = %e, "Cannot write subtask response");
                        task.addlog(format!(
                            "Created task {child_id} for '{file}' but cannot write its response file: {e}"
                        ));
                    }
                }
                Err(e) => {
                    warn!(task_id = task.task_id, file = %file, error = %e, "Invalid subtask descriptor");
                    task.addlog(format!("Invalid subtask descriptor '{file}': {e}"));
                }
            }
            tokio::fs::remove_file(path).await?;
        }

        if !created.is_empty() {
            task.addlog(format!("Submitted {} new task(s): {:?}", created.len(), created));
            info!(task_id = task.task_id, created = created.len(), "Subtasks submitted");
        }
        self.cluster.store().save_task(task, mark).await?;
        Ok(created)
    }

    async fn submit_one(&self, parent: &mut Task, path: &Path) -> Result<TaskId> {
        let content = tokio::fs::read_to_string(path).await?;
        let descriptor = SubtaskDescriptor::parse(&content)?;

        let level = parent.level + 1;
        let max_level = self.cluster.config().max_subtask_level;
        if level > max_level {
            return Err(TaskerError::ValidationError(format!(
                "subtask level {level} exceeds the limit of {max_level}"
            )));
        }
        if !self.cluster.tools().contains(&descriptor.tool_class) {
            return Err(TaskerError::ToolError(format!(
                "unknown tool class '{}'",
                descriptor.tool_class
            )));
        }

        let endpoint_id = match descriptor.tool_config_id {
            None => parent.endpoint_id,
            Some(config_id) => self
                .cluster
                .config()
                .tool_config_endpoints
                .get(&config_id)
                .copied()
                .ok_or_else(|| {
                    TaskerError::ValidationError(format!(
                        "tool config {config_id} is not available on any endpoint"
                    ))
                })?,
        };

        let store = self.cluster.store();
        let mut new_task = NewTask::new(parent.user_id, endpoint_id, descriptor.tool_class.clone())
            .with_group(parent.group_id)
            .with_params(descriptor.parameters.clone());
        if let Some(description) = descriptor.description.clone() {
            new_task = new_task.with_description(description);
        }
        new_task.tool_config_id = descriptor.tool_config_id.or(parent.tool_config_id);
        new_task.batch_id = Some(parent.task_id);
        new_task.level = level;

        for other in descriptor.prerequisite_ids()? {
            if store.find_task(other).await?.is_none() {
                return Err(TaskerError::PrerequisiteError(format!(
                    "prerequisite task {other} does not exist"
                )));
            }
            new_task
                .prerequisites
                .add(0, GatingPoint::BeforeSetup, other, Requirement::Completed)?;
        }
        if let Some(owner) = descriptor.share_wd_tid {
            let owner_task = store.find_task(owner).await?.ok_or_else(|| {
                TaskerError::ValidationError(format!("work directory owner {owner} does not exist"))
            })?;
            if owner_task.endpoint_id != endpoint_id {
                return Err(TaskerError::ValidationError(format!(
                    "task {owner} runs on another endpoint"
                )));
            }
            new_task.share_workdir_with = Some(owner);
            new_task
                .prerequisites
                .add(0, GatingPoint::BeforeSetup, owner, Requirement::Queued)?;
        }

        let child = store.create_task(new_task).await?;
        if descriptor.required_to_post_process {
            parent.add_prerequisite(GatingPoint::BeforePostProcessing, child.task_id, Requirement::Completed)?;
            store.update_task(parent).await?;
        }
        debug!(parent_id = parent.task_id, child_id = child.task_id, level, "Subtask created");
        Ok(child.task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_descriptor_requires_tool_class_and_parameters() {
        assert!(SubtaskDescriptor::parse(r#"{"parameters": {}}"#).is_err());
        assert!(SubtaskDescriptor::parse(r#"{"tool-class": "Shell"}"#).is_err());
        let d = SubtaskDescriptor::parse(
            r#"{"tool-class": "Shell", "parameters": {"commands": []}, "prerequisites": "3, 4,"}"#,
        )
        .unwrap();
        assert_eq!(d.prerequisite_ids().unwrap(), vec![3, 4]);
        assert!(!d.required_to_post_process);
    }

    #[test]
    fn test_bad_prerequisite_list() {
        let d = SubtaskDescriptor::parse(
            r#"{"tool-class": "Shell", "parameters": {}, "prerequisites": "3,x"}"#,
        )
        .unwrap();
        assert!(d.prerequisite_ids().is_err());
    }

    #[tokio::test]
    async fn test_find_descriptors_and_response_name() {
        let dir = TempDir::new().unwrap();
        for name in [".new-task-b.json", ".new-task-a.json", "new-task-d.json", "other.json", ".new-task-c.response"] {
            tokio::fs::write(dir.path().join(name), "{}").await.unwrap();
        }
        let found = find_descriptors(dir.path()).await.unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![".new-task-a.json", ".new-task-b.json"]);
        assert_eq!(
            response_path(&found[0]).file_name().unwrap(),
            ".new-task-a.response"
        );
    }
}
