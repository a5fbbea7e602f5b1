//! Per-directory persisted cache files
//!
//! Each cached directory owns one hidden JSON file mapping case-normalized
//! file names to their last observed [`FileRecord`]. Records are stored
//! with paths relative to the directory so a tree can be relocated without
//! invalidating its cache files.
//!
//! Every load and save runs under the owning directory's path-keyed lock,
//! and saves go through a temp file plus atomic rename so a crash mid-write
//! leaves either the old file or the new one, never a torn one. A missing
//! file means "not yet built"; an unreadable or corrupt file is demoted to
//! the same state with a warning rather than surfaced as an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dirmirror_core::domain::errors::SyncError;
use dirmirror_core::domain::record::FileRecord;
use dirmirror_core::locks::PathLockQueue;

/// Reads and writes the hidden per-directory cache files
pub struct DirCacheStore {
    file_name: String,
    locks: Arc<PathLockQueue>,
}

impl DirCacheStore {
    pub fn new(file_name: impl Into<String>, locks: Arc<PathLockQueue>) -> Self {
        Self {
            file_name: file_name.into(),
            locks,
        }
    }

    /// The hidden cache file's name, as configured.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Path of the cache file owned by `dir`.
    pub fn cache_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.file_name)
    }

    /// Loads a directory's persisted map, under that directory's lock.
    ///
    /// `None` means the cache has not been built for this directory (or was
    /// unreadable and must be rebuilt). Record paths come back absolutized
    /// against `dir`.
    pub async fn load(
        &self,
        dir: &Path,
        token: &CancellationToken,
    ) -> Result<Option<HashMap<String, FileRecord>>, SyncError> {
        let _guard = self.locks.acquire(dir, token).await?;
        Ok(self.load_unlocked(dir).await)
    }

    /// Replaces a directory's persisted map, under that directory's lock.
    pub async fn save(
        &self,
        dir: &Path,
        entries: &HashMap<String, FileRecord>,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        let _guard = self.locks.acquire(dir, token).await?;
        self.save_unlocked(dir, entries).await
    }

    /// Read-modify-write of one entry, under the directory's lock.
    pub async fn update_entry(
        &self,
        dir: &Path,
        key: &str,
        record: FileRecord,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        let _guard = self.locks.acquire(dir, token).await?;
        let mut entries = self.load_unlocked(dir).await.unwrap_or_default();
        entries.insert(key.to_string(), record);
        self.save_unlocked(dir, &entries).await
    }

    /// Removes one entry, under the directory's lock. Removing from an
    /// unbuilt cache is a no-op.
    pub async fn remove_entry(
        &self,
        dir: &Path,
        key: &str,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        let _guard = self.locks.acquire(dir, token).await?;
        let Some(mut entries) = self.load_unlocked(dir).await else {
            return Ok(());
        };
        if entries.remove(key).is_some() {
            self.save_unlocked(dir, &entries).await?;
        }
        Ok(())
    }

    async fn load_unlocked(&self, dir: &Path) -> Option<HashMap<String, FileRecord>> {
        let path = self.cache_path(dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "cache file unreadable, treating directory as uncached"
                );
                return None;
            }
        };

        match serde_json::from_slice::<HashMap<String, FileRecord>>(&bytes) {
            Ok(entries) => Some(
                entries
                    .into_iter()
                    .map(|(key, rec)| {
                        let absolute = dir.join(&rec.path);
                        let rec = rec.with_path(absolute);
                        (key, rec)
                    })
                    .collect(),
            ),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "cache file corrupt, treating directory as uncached"
                );
                None
            }
        }
    }

    async fn save_unlocked(
        &self,
        dir: &Path,
        entries: &HashMap<String, FileRecord>,
    ) -> Result<(), SyncError> {
        // Persist file names only; the directory is implied by location.
        let relative: HashMap<&String, FileRecord> = entries
            .iter()
            .map(|(key, rec)| {
                let name = rec
                    .path
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| rec.path.clone());
                (key, rec.with_path(name))
            })
            .collect();

        let bytes = match serde_json::to_vec(&relative) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "cache serialization failed");
                return Err(SyncError::CacheCorrupt(self.cache_path(dir)));
            }
        };

        let target = self.cache_path(dir);
        let temp = dir.join(format!("{}.tmp", self.file_name));

        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|err| SyncError::from_io(err, &temp))?;
        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|err| SyncError::from_io(err, &target))?;

        debug!(path = %target.display(), entries = entries.len(), "cache file written");
        Ok(())
    }
}
