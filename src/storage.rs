//! # Storage Collaborator
//!
//! Seam to the layer that moves file content between a local cache and a
//! storage provider. The cluster controller only relies on three things:
//! calls are idempotent, concurrent mutations of one file are serialized, and
//! a registered file gets a stable id it can be fetched back with.
//!
//! [`LocalDirectoryStorage`] keeps both sides as plain directories and is
//! what the driver binary and the tests use.

use crate::error::{Result, TaskerError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub type FileId = i64;

#[async_trait]
pub trait StorageCollaborator: Send + Sync {
    /// Make the content of `file_id` available locally and return its path
    async fn sync_to_cache(&self, file_id: FileId) -> Result<PathBuf>;

    /// Push the cached content of `file_id` to the provider
    async fn sync_to_provider(&self, file_id: FileId) -> Result<()>;

    /// Take ownership of `source` as a new managed file named `name`
    async fn register_file(&self, user_id: i64, name: &str, source: &Path) -> Result<FileId>;

    async fn delete_file(&self, file_id: FileId) -> Result<()>;
}

/// Provider and cache as two local directories.
///
/// Each file lives in `provider/{id}/{name}`. Ids are claimed by creating the
/// `provider/{id}` directory, so processes sharing a root never hand out the
/// same id, and a reopened storage finds its files again. Deleting a file
/// leaves its empty id directory behind so the id is never reused.
#[derive(Debug)]
pub struct LocalDirectoryStorage {
    provider_root: PathBuf,
    cache_root: PathBuf,
    next_id: AtomicI64,
    names: DashMap<FileId, String>,
    file_locks: DashMap<FileId, Arc<Mutex<()>>>,
}

impl LocalDirectoryStorage {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let provider_root = root.join("provider");
        let cache_root = root.join("cache");
        tokio::fs::create_dir_all(&provider_root).await?;
        tokio::fs::create_dir_all(&cache_root).await?;

        let names = DashMap::new();
        let mut highest: FileId = 0;
        let mut entries = tokio::fs::read_dir(&provider_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(file_id) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<FileId>().ok())
            else {
                continue;
            };
            highest = highest.max(file_id);
            if let Some(name) = stored_name(&entry.path()) {
                names.insert(file_id, name);
            }
        }
        debug!(root = %root.display(), files = names.len(), next_id = highest + 1, "Opened local storage");

        Ok(Self {
            provider_root,
            cache_root,
            next_id: AtomicI64::new(highest + 1),
            names,
            file_locks: DashMap::new(),
        })
    }

    /// Claim the next id no process sharing this root has used
    async fn allocate_id(&self) -> Result<FileId> {
        loop {
            let file_id = self.next_id.fetch_add(1, Ordering::SeqCst);
            match tokio::fs::create_dir(self.provider_root.join(file_id.to_string())).await {
                Ok(()) => return Ok(file_id),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn lock_for(&self, file_id: FileId) -> Arc<Mutex<()>> {
        self.file_locks
            .entry(file_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Known name, else whatever another process stored under the id
    fn name_of(&self, file_id: FileId) -> Result<String> {
        if let Some(name) = self.names.get(&file_id) {
            return Ok(name.value().clone());
        }
        let name = stored_name(&self.provider_root.join(file_id.to_string()))
            .ok_or_else(|| TaskerError::StorageError(format!("Unknown file id {file_id}")))?;
        self.names.insert(file_id, name.clone());
        Ok(name)
    }

    fn cache_path(&self, file_id: FileId, name: &str) -> PathBuf {
        self.cache_root.join(file_id.to_string()).join(name)
    }

    fn provider_path(&self, file_id: FileId, name: &str) -> PathBuf {
        self.provider_root.join(file_id.to_string()).join(name)
    }

    pub fn is_in_provider(&self, file_id: FileId) -> bool {
        self.name_of(file_id)
            .map(|name| self.provider_path(file_id, &name).exists())
            .unwrap_or(false)
    }
}

/// Name of the single file kept in a provider id directory
fn stored_name(id_dir: &Path) -> Option<String> {
    std::fs::read_dir(id_dir)
        .ok()?
        .filter_map(std::result::Result::ok)
        .find(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
}

async fn copy_into(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(from, to).await?;
    Ok(())
}

#[async_trait]
impl StorageCollaborator for LocalDirectoryStorage {
    async fn sync_to_cache(&self, file_id: FileId) -> Result<PathBuf> {
        let name = self.name_of(file_id)?;
        let lock = self.lock_for(file_id);
        let _guard = lock.lock().await;

        let cached = self.cache_path(file_id, &name);
        if !cached.exists() {
            let provided = self.provider_path(file_id, &name);
            if !provided.exists() {
                return Err(TaskerError::StorageError(format!(
                    "File {file_id} has no content in the provider"
                )));
            }
            copy_into(&provided, &cached).await?;
            debug!(file_id, path = %cached.display(), "Synced file to cache");
        }
        Ok(cached)
    }

    async fn sync_to_provider(&self, file_id: FileId) -> Result<()> {
        let name = self.name_of(file_id)?;
        let lock = self.lock_for(file_id);
        let _guard = lock.lock().await;

        let cached = self.cache_path(file_id, &name);
        if !cached.exists() {
            return Err(TaskerError::StorageError(format!(
                "File {file_id} has no cached content to upload"
            )));
        }
        copy_into(&cached, &self.provider_path(file_id, &name)).await?;
        debug!(file_id, "Synced file to provider");
        Ok(())
    }

    async fn register_file(&self, user_id: i64, name: &str, source: &Path) -> Result<FileId> {
        let file_id = self.allocate_id().await?;
        self.names.insert(file_id, name.to_string());

        let cached = self.cache_path(file_id, name);
        if let Some(parent) = cached.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::rename(source, &cached).await.is_err() {
            // Cross-device move
            tokio::fs::copy(source, &cached).await?;
            tokio::fs::remove_file(source).await?;
        }
        self.sync_to_provider(file_id).await?;
        debug!(file_id, user_id, name, "Registered managed file");
        Ok(file_id)
    }

    async fn delete_file(&self, file_id: FileId) -> Result<()> {
        let lock = self.lock_for(file_id);
        {
            let _guard = lock.lock().await;
            let cached = self.cache_root.join(file_id.to_string());
            if cached.exists() {
                tokio::fs::remove_dir_all(&cached).await?;
            }
            let provided = self.provider_root.join(file_id.to_string());
            if provided.exists() {
                tokio::fs::remove_dir_all(&provided).await?;
                // Tombstone keeps the id taken
                tokio::fs::create_dir(&provided).await?;
            }
        }
        self.names.remove(&file_id);
        self.file_locks.remove(&file_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_register_then_fetch_back() {
        let root = TempDir::new().unwrap();
        let storage = LocalDirectoryStorage::new(root.path()).await.unwrap();

        let source = root.path().join("T1.tar");
        tokio::fs::write(&source, b"archive").await.unwrap();
        let file_id = storage.register_file(1, "T1.tar", &source).await.unwrap();
        assert!(!source.exists());
        assert!(storage.is_in_provider(file_id));

        let cached = storage.sync_to_cache(file_id).await.unwrap();
        assert_eq!(tokio::fs::read(&cached).await.unwrap(), b"archive");
        // idempotent
        assert_eq!(storage.sync_to_cache(file_id).await.unwrap(), cached);
        storage.sync_to_provider(file_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_is_refilled_from_provider() {
        let root = TempDir::new().unwrap();
        let storage = LocalDirectoryStorage::new(root.path()).await.unwrap();
        let source = root.path().join("data.txt");
        tokio::fs::write(&source, b"abc").await.unwrap();
        let file_id = storage.register_file(1, "data.txt", &source).await.unwrap();

        let cached = storage.sync_to_cache(file_id).await.unwrap();
        tokio::fs::remove_file(&cached).await.unwrap();
        let cached = storage.sync_to_cache(file_id).await.unwrap();
        assert_eq!(tokio::fs::read(&cached).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_delete_forgets_file() {
        let root = TempDir::new().unwrap();
        let storage = LocalDirectoryStorage::new(root.path()).await.unwrap();
        let source = root.path().join("x");
        tokio::fs::write(&source, b"x").await.unwrap();
        let file_id = storage.register_file(1, "x", &source).await.unwrap();

        storage.delete_file(file_id).await.unwrap();
        assert!(!storage.is_in_provider(file_id));
        assert!(matches!(
            storage.sync_to_cache(file_id).await,
            Err(TaskerError::StorageError(_))
        ));

        let source = root.path().join("y");
        tokio::fs::write(&source, b"y").await.unwrap();
        assert_ne!(storage.register_file(1, "y", &source).await.unwrap(), file_id);
    }

    async fn register(storage: &LocalDirectoryStorage, root: &Path, name: &str) -> FileId {
        let source = root.join(name);
        tokio::fs::write(&source, name.as_bytes()).await.unwrap();
        storage.register_file(1, name, &source).await.unwrap()
    }

    #[tokio::test]
    async fn test_files_survive_a_reopen() {
        let root = TempDir::new().unwrap();
        let first = LocalDirectoryStorage::new(root.path()).await.unwrap();
        let archive_a = register(&first, root.path(), "T1.tar").await;
        drop(first);

        let reopened = LocalDirectoryStorage::new(root.path()).await.unwrap();
        let archive_b = register(&reopened, root.path(), "T2.tar").await;
        assert_ne!(archive_a, archive_b);

        reopened.delete_file(archive_b).await.unwrap();
        assert!(reopened.is_in_provider(archive_a));
        let cached = reopened.sync_to_cache(archive_a).await.unwrap();
        assert_eq!(tokio::fs::read(&cached).await.unwrap(), b"T1.tar");
    }

    #[tokio::test]
    async fn test_two_storages_on_one_root_never_share_ids() {
        let root = TempDir::new().unwrap();
        let left = LocalDirectoryStorage::new(root.path()).await.unwrap();
        let right = LocalDirectoryStorage::new(root.path()).await.unwrap();

        let from_left = register(&left, root.path(), "left").await;
        let from_right = register(&right, root.path(), "right").await;
        assert_ne!(from_left, from_right);

        // Each side can fetch what the other registered
        let cached = left.sync_to_cache(from_right).await.unwrap();
        assert_eq!(tokio::fs::read(&cached).await.unwrap(), b"right");
    }
}
