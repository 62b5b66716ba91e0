//! Filesystem content store.
//!
//! Objects live under a two-level fan-out derived from the storage key:
//! `{root}/{key[0..2]}/{key[2..4]}/{key}`. Writes are atomic (temp file +
//! rename) and deletes are idempotent.
//!
//! ## Example
//!
//! ```rust,ignore
//! use attache_db::FilesystemBackend;
//!
//! let backend = FilesystemBackend::new("/var/attache/storage");
//! backend.validate().await?;
//! backend.put("b7x0...", &data).await?;
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use attache_core::{is_valid_storage_key, ContentStore, Error, Result};

/// Filesystem storage backend.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of this backend.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Resolve the on-disk path for a storage key.
    pub fn path_for_key(&self, key: &str) -> Result<PathBuf> {
        if !is_valid_storage_key(key) {
            return Err(Error::Storage(format!("invalid storage key: {:?}", key)));
        }
        Ok(self.root.join(relative_path_for_key(key)))
    }

    /// Validate that the backend can write, read, and delete files.
    ///
    /// Performs a full round-trip at startup to catch permission errors and
    /// missing mounts early.
    pub async fn validate(&self) -> Result<()> {
        let test_dir = self.root.join(".health-check");
        let test_file = test_dir.join("sample.bin");
        let sample = b"attache-storage-health-check";

        fs::create_dir_all(&test_dir).await.map_err(|e| {
            Error::Storage(format!("create_dir_all({}): {}", test_dir.display(), e))
        })?;
        fs::write(&test_file, sample)
            .await
            .map_err(|e| Error::Storage(format!("write({}): {}", test_file.display(), e)))?;
        let read_back = fs::read(&test_file)
            .await
            .map_err(|e| Error::Storage(format!("read({}): {}", test_file.display(), e)))?;
        if read_back != sample {
            return Err(Error::Storage("health check read-back mismatch".into()));
        }
        fs::remove_file(&test_file).await.map_err(|e| {
            Error::Storage(format!("remove_file({}): {}", test_file.display(), e))
        })?;
        let _ = fs::remove_dir(&test_dir).await;

        Ok(())
    }
}

/// Relative fan-out path for a key.
///
/// Keys shorter than four bytes, or whose first four bytes do not split on
/// character boundaries, are stored flat.
fn relative_path_for_key(key: &str) -> PathBuf {
    match (key.get(0..2), key.get(2..4)) {
        (Some(outer), Some(inner)) => PathBuf::from(outer).join(inner).join(key),
        _ => PathBuf::from(key),
    }
}

#[async_trait]
impl ContentStore for FilesystemBackend {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let full_path = self.path_for_key(key)?;
        debug!(storage_key = %key, full_path = %full_path.display(), size = data.len(), "file_storage: put");

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "file_storage: create_dir_all failed");
                Error::Storage(format!("create_dir_all({}): {}", parent.display(), e))
            })?;
        }

        let temp_path = full_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            warn!(temp_path = %temp_path.display(), error = %e, "file_storage: File::create failed");
            Error::Storage(format!("create({}): {}", temp_path.display(), e))
        })?;
        file.write_all(data)
            .await
            .map_err(|e| Error::Storage(format!("write_all: {}", e)))?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "file_storage: rename failed");
            Error::Storage(format!("rename to {}: {}", full_path.display(), e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let full_path = self.path_for_key(key)?;
        match fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("no object stored under key {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exist(&self, key: &str) -> Result<bool> {
        let full_path = self.path_for_key(key)?;
        Ok(fs::try_exists(full_path).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.path_for_key(key)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => {
                debug!(storage_key = %key, "file_storage: deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "remove_file({}): {}",
                full_path.display(),
                e
            ))),
        }
    }
}
