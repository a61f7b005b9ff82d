//! # Work Directory Archival
//!
//! Packs a finished task's work directory into a single tar file, either in
//! place (`{workdir}/T{id}.tar`, everything else deleted) or handed to the
//! storage collaborator as a managed file (local directory removed). The
//! inverse operations restore the original content.
//!
//! A marker file sits in the work directory while any of these run. Another
//! archival finding it is refused; the marker is cooperative, not a lock.
//! Tasks sharing another task's work directory are never archived.

use super::controller::ClusterController;
use crate::error::{Result, TaskerError};
use crate::logging::log_task_operation;
use crate::models::Task;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

/// File name of the in-place archive of `task`
pub fn archive_file_name(task: &Task) -> String {
    format!("T{}.tar", task.task_id)
}

impl ClusterController {
    /// Tar the work directory in place. `Ok(false)` when there is nothing to
    /// do or archival is refused.
    #[instrument(skip(self, task), fields(task_id = task.task_id))]
    pub async fn archive_workdir(&self, task: &mut Task) -> Result<bool> {
        let Some(workdir) = self.archival_candidate(task) else {
            return Ok(false);
        };
        let mark = task.log.len();
        let archived = self.pack_in_place(task, &workdir).await?;
        self.store().save_task(task, mark).await?;
        Ok(archived)
    }

    /// Tar the work directory and move the archive into storage as a
    /// managed file, then remove the local work directory.
    #[instrument(skip(self, task), fields(task_id = task.task_id))]
    pub async fn archive_workdir_as_file(&self, task: &mut Task) -> Result<bool> {
        if !task.owns_workdir() || task.workdir_archive_file_id.is_some() {
            return Ok(false);
        }
        let Some(workdir) = self.existing_workdir(task) else {
            return Ok(false);
        };
        let mark = task.log.len();

        if !task.workdir_archived {
            if !task.status.is_archivable() {
                return Ok(false);
            }
            if !self.pack_in_place(task, &workdir).await? {
                self.store().save_task(task, mark).await?;
                return Ok(false);
            }
        }

        let tar_path = workdir.join(archive_file_name(task));
        if !tar_path.is_file() {
            return Err(TaskerError::StorageError(format!(
                "Archive '{}' of task {} is missing",
                tar_path.display(),
                task.task_id
            )));
        }
        let name = format!("{}-{}-{}", task.user_id, task.name(), archive_file_name(task));
        let file_id = self
            .storage()
            .register_file(task.user_id, &name, &tar_path)
            .await?;
        self.layout().remove_owned(task).await?;

        task.workdir_archive_file_id = Some(file_id);
        task.cluster_workdir_size = Some(0);
        task.addlog(format!("Work directory archived as managed file #{file_id} ('{name}')."));
        log_task_operation(
            "archive_as_file",
            Some(task.task_id),
            Some(task.name()),
            "archived",
            Some(&name),
        );
        self.store().save_task(task, mark).await?;
        Ok(true)
    }

    /// Restore a work directory archived by either form
    #[instrument(skip(self, task), fields(task_id = task.task_id))]
    pub async fn unarchive_workdir(&self, task: &mut Task) -> Result<bool> {
        if !task.owns_workdir() || !task.workdir_archived {
            return Ok(false);
        }
        let mark = task.log.len();

        let restored = match task.workdir_archive_file_id {
            Some(file_id) => self.restore_from_storage(task, file_id).await?,
            None => self.restore_in_place(task).await?,
        };
        if restored {
            task.workdir_archived = false;
            self.update_workdir_size(task);
            task.addlog("Work directory restored from archive.");
        }
        self.store().save_task(task, mark).await?;
        Ok(restored)
    }

    fn marker_path(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.archive.marker_name)
    }

    fn archival_candidate(&self, task: &Task) -> Option<PathBuf> {
        if !task.owns_workdir() || task.workdir_archived || !task.status.is_archivable() {
            return None;
        }
        self.existing_workdir(task)
    }

    /// Raise the marker; `false` if another archival holds it
    async fn raise_marker(&self, task: &mut Task, workdir: &Path) -> Result<bool> {
        let marker = self.marker_path(workdir);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                task.addlog("Archival refused: another archiving operation is in progress.");
                warn!(task_id = task.task_id, "Archive marker present, refusing archival");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pack_in_place(&self, task: &mut Task, workdir: &Path) -> Result<bool> {
        if !self.raise_marker(task, workdir).await? {
            return Ok(false);
        }
        task.addlog(format!("Archiving work directory '{}'.", workdir.display()));

        let archive_name = archive_file_name(task);
        let marker_name = self.archive.marker_name.clone();
        let dir = workdir.to_path_buf();
        let packed = run_blocking(move || {
            let keep = [archive_name.as_str(), marker_name.as_str()];
            pack_or_discard(&dir, &dir.join(&archive_name), &keep)?;
            clear_directory_except(&dir, &keep)
        })
        .await;
        tokio::fs::remove_file(self.marker_path(workdir)).await?;
        packed?;

        task.workdir_archived = true;
        self.update_workdir_size(task);
        info!(task_id = task.task_id, workdir = %workdir.display(), "Work directory archived");
        log_task_operation("archive", Some(task.task_id), Some(task.name()), "archived", None);
        Ok(true)
    }

    async fn restore_in_place(&self, task: &mut Task) -> Result<bool> {
        let Some(workdir) = self.existing_workdir(task) else {
            return Err(TaskerError::StorageError(format!(
                "Work directory of task {} is gone; cannot unarchive",
                task.task_id
            )));
        };
        let tar_path = workdir.join(archive_file_name(task));
        if !tar_path.is_file() {
            return Err(TaskerError::StorageError(format!(
                "Archive '{}' of task {} is missing",
                tar_path.display(),
                task.task_id
            )));
        }
        if !self.raise_marker(task, &workdir).await? {
            return Ok(false);
        }
        let dest = workdir.clone();
        let tar = tar_path.clone();
        let unpacked = run_blocking(move || unpack_archive(&tar, &dest)).await;
        tokio::fs::remove_file(self.marker_path(&workdir)).await?;
        unpacked?;
        tokio::fs::remove_file(&tar_path).await?;
        Ok(true)
    }

    async fn restore_from_storage(&self, task: &mut Task, file_id: i64) -> Result<bool> {
        let cached = self.storage().sync_to_cache(file_id).await?;
        let relative = self.layout().create_owned(task).await?;
        let workdir = self.layout().full_path(&relative);
        task.cluster_workdir = Some(relative.to_string_lossy().into_owned());

        if !self.raise_marker(task, &workdir).await? {
            return Ok(false);
        }
        let dest = workdir.clone();
        let unpacked = run_blocking(move || unpack_archive(&cached, &dest)).await;
        tokio::fs::remove_file(self.marker_path(&workdir)).await?;
        unpacked?;

        self.storage().delete_file(file_id).await?;
        task.workdir_archive_file_id = None;
        Ok(true)
    }
}

async fn run_blocking<F>(job: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| TaskerError::StorageError(format!("archival worker failed: {e}")))?
}

/// [`pack_directory`], removing the partial archive when packing fails
fn pack_or_discard(dir: &Path, tar_path: &Path, exclude: &[&str]) -> Result<()> {
    let packed = pack_directory(dir, tar_path, exclude);
    if packed.is_err() && tar_path.exists() {
        if let Err(e) = std::fs::remove_file(tar_path) {
            warn!(archive = %tar_path.display(), error = %e, "Cannot remove partial archive");
        }
    }
    packed
}

/// Write every entry under `dir` into `tar_path`, except top-level names in
/// `exclude`. Paths in the archive are relative to `dir`.
fn pack_directory(dir: &Path, tar_path: &Path, exclude: &[&str]) -> Result<()> {
    let file = File::create(tar_path)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() != 1
                || !exclude
                    .iter()
                    .any(|name| entry.file_name() == std::ffi::OsStr::new(name))
        });
    for entry in walker {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| TaskerError::StorageError(format!("bad archive path: {e}")))?;
        builder.append_path_with_name(entry.path(), relative)?;
    }
    builder.into_inner()?.sync_all()?;
    Ok(())
}

fn clear_directory_except(dir: &Path, keep: &[&str]) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if keep.iter().any(|name| entry.file_name() == std::ffi::OsStr::new(name)) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn unpack_archive(tar_path: &Path, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(File::open(tar_path)?);
    archive.set_preserve_permissions(true);
    archive.unpack(dest)?;
    Ok(())
}
