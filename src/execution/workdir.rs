//! Work directory layout.
//!
//! Task work directories live in a three level numeric shard tree under the
//! endpoint's work root, so that no single directory grows huge:
//! task 123456 of user 7 running `Shell` lives in `12/34/56/7-Shell-T123456`.
//! The path stored on the task is relative to the root.

use crate::error::{Result, TaskerError};
use crate::models::{Task, TaskId};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct WorkdirLayout {
    root: PathBuf,
}

impl WorkdirLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `[aa, bb, cc]` for the zero-padded id; the first component keeps any
    /// digits beyond six.
    pub fn shard_components(task_id: TaskId) -> [String; 3] {
        let padded = format!("{:06}", task_id.unsigned_abs());
        let len = padded.len();
        [
            padded[..len - 4].to_string(),
            padded[len - 4..len - 2].to_string(),
            padded[len - 2..].to_string(),
        ]
    }

    /// Relative path of the directory `task` owns
    pub fn relative_for(task: &Task) -> PathBuf {
        let [a, b, c] = Self::shard_components(task.task_id);
        PathBuf::from(a)
            .join(b)
            .join(c)
            .join(format!("{}-{}-T{}", task.user_id, task.name(), task.task_id))
    }

    pub fn full_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Absolute work directory recorded on the task, if any
    pub fn task_workdir(&self, task: &Task) -> Option<PathBuf> {
        task.cluster_workdir
            .as_deref()
            .filter(|rel| !rel.is_empty())
            .map(|rel| self.full_path(rel))
    }

    /// Create the directory `task` owns and return its relative path
    pub async fn create_owned(&self, task: &Task) -> Result<PathBuf> {
        if !task.owns_workdir() {
            return Err(TaskerError::InvalidState(format!(
                "Task {} shares a work directory and cannot create its own",
                task.task_id
            )));
        }
        let relative = Self::relative_for(task);
        let full = self.full_path(&relative);
        tokio::fs::create_dir_all(&full).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&full, std::fs::Permissions::from_mode(0o700)).await?;
        }
        debug!(task_id = task.task_id, workdir = %full.display(), "Created work directory");
        Ok(relative)
    }

    /// Remove the directory `task` owns, then any shard level left empty.
    /// Returns `false` without touching the disk for shared directories.
    pub async fn remove_owned(&self, task: &Task) -> Result<bool> {
        if !task.owns_workdir() {
            return Ok(false);
        }
        let Some(full) = self.task_workdir(task) else {
            return Ok(false);
        };
        if full.exists() {
            tokio::fs::remove_dir_all(&full).await?;
        }

        // Prune empty shard levels; a non-empty level stops the walk
        let mut parent = full.parent().map(Path::to_path_buf);
        while let Some(dir) = parent {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if tokio::fs::remove_dir(&dir).await.is_err() {
                break;
            }
            parent = dir.parent().map(Path::to_path_buf);
        }
        Ok(true)
    }
}

/// Total size in bytes of the regular files under `path`
pub fn directory_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
