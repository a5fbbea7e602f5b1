//! The synchronization executor
//!
//! The only code in the daemon that writes to destination trees. Every
//! operation runs inside a global concurrency slot and the pairwise path
//! lock for (source path, counterpart path), so a file and its counterpart
//! are never touched by two synchronizations at once.
//!
//! ## Write sequence
//!
//! ```text
//! read counterpart bytes ──identical──→ refresh caches, done
//!        │
//!        ▼
//! free-space check ──insufficient──→ typed error, file skipped
//!        │
//!        ▼
//! ensure parent directory (created-folders cache)
//!        │
//!        ▼
//! invalidate cache entry ──→ write (temp+rename, or direct for history)
//!        │
//!        ▼
//! re-stat, record fresh metadata, log completion
//! ```
//!
//! The cache entry is invalidated *before* the write so a crash mid-write
//! cannot leave a record claiming a stale version is current. Deletions are
//! soft: the counterpart is renamed to a `~` backup, never unlinked.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tracing::{debug, info, warn};

use dirmirror_cache::MetadataCache;
use dirmirror_core::config::Config;
use dirmirror_core::domain::context::SyncContext;
use dirmirror_core::domain::errors::{OpClass, SyncError};
use dirmirror_core::domain::event::SyncRole;
use dirmirror_core::domain::record::FileRecord;
use dirmirror_core::locks::PathLockQueue;
use dirmirror_core::resilience::Resilience;

use crate::decision::WriteLog;

/// What one executor call ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Counterpart written with fresh content
    Written,
    /// Counterpart bytes already matched; caches refreshed only
    Identical,
    /// Counterpart renamed to its `~` backup
    SoftDeleted,
    /// Nothing to do (file vanished mid-flight, or the role never deletes)
    Noop,
}

/// Performs locked, verified writes and soft deletes
pub struct Executor {
    config: Arc<Config>,
    cache: Arc<MetadataCache>,
    locks: Arc<PathLockQueue>,
    resilience: Resilience,
    write_log: Arc<WriteLog>,
    /// Destination directories known to exist, keyed by normalized path.
    created_dirs: DashSet<String>,
}

impl Executor {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<MetadataCache>,
        locks: Arc<PathLockQueue>,
        resilience: Resilience,
        write_log: Arc<WriteLog>,
    ) -> Self {
        Self {
            config,
            cache,
            locks,
            resilience,
            write_log,
            created_dirs: DashSet::new(),
        }
    }

    /// Reads the source file and writes its counterpart, all inside the
    /// pairwise lock and a global concurrency slot.
    pub async fn sync_file(&self, ctx: &SyncContext) -> Result<SyncOutcome, SyncError> {
        let _slot = self.locks.acquire_slot(&ctx.token).await?;
        let _pair = self
            .locks
            .acquire_pair(ctx.path(), &ctx.counterpart_path, &ctx.token)
            .await?;

        let data = match self.resilience.read_file(ctx.path()).await {
            Ok(data) => data,
            Err(SyncError::NotFoundMidFlight(_)) => {
                debug!(path = %ctx.path().display(), "source vanished mid-flight");
                return Ok(SyncOutcome::Noop);
            }
            Err(err) => return Err(err),
        };
        self.save_file_modifications(&data, ctx).await
    }

    /// Writes `data` to the context's counterpart path.
    ///
    /// Callers are expected to hold the pairwise lock; [`sync_file`]
    /// (Self::sync_file) is the locked entry point.
    pub async fn save_file_modifications(
        &self,
        data: &[u8],
        ctx: &SyncContext,
    ) -> Result<SyncOutcome, SyncError> {
        let target = ctx.counterpart_path.clone();

        // Staleness is re-verified on bytes, not metadata. History targets
        // carry a unique versioned name and are never compared.
        if self.config.compare.by_content && !ctx.for_history() {
            match self.resilience.read_file(&target).await {
                Ok(existing) if existing == data => {
                    let record = self.resilience.stat(&target).await?;
                    self.cache
                        .record_observed(&target, record, &ctx.token)
                        .await;
                    debug!(path = %target.display(), "content already identical, no write");
                    return Ok(SyncOutcome::Identical);
                }
                Ok(_) => {}
                Err(SyncError::NotFoundMidFlight(_)) => {}
                Err(err) => return Err(err),
            }
        }

        self.check_free_space(data.len() as u64, ctx.role, &target)?;

        if let Some(parent) = target.parent() {
            self.ensure_dir(parent).await?;
        }

        // Invalidate before the write: a crash between these two steps
        // must read as "unknown", not as the stale record.
        self.cache.invalidate(&target, &ctx.token).await;

        if ctx.for_history() {
            // Each versioned name is written exactly once.
            self.write_direct(&target, data).await?;
        } else {
            self.write_atomic(&target, data).await?;
        }

        let record = self.resilience.stat(&target).await?;
        self.cache
            .record_observed(&target, record, &ctx.token)
            .await;

        if self.config.mirror.bidirectional && !ctx.for_history() {
            self.write_log.record_completion(&target);
        }

        // Initial scans touch every file in the tree; per-file completions
        // stay at debug there so startup does not flood the log.
        if ctx.is_initial_scan() {
            debug!(
                role = %ctx.role,
                path = %target.display(),
                bytes = data.len(),
                "synchronized"
            );
        } else {
            info!(
                role = %ctx.role,
                path = %target.display(),
                bytes = data.len(),
                "synchronized"
            );
        }

        let delay = self.config.mirror.copy_delay_ms;
        if !ctx.for_history() && delay > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = ctx.token.cancelled() => return Err(SyncError::Cancelled),
            }
        }

        Ok(SyncOutcome::Written)
    }

    /// Soft-deletes the counterpart: renames it to a `~` backup, replacing
    /// any previous backup. The history archive never deletes anything.
    pub async fn delete_file(&self, ctx: &SyncContext) -> Result<SyncOutcome, SyncError> {
        if ctx.for_history() {
            return Ok(SyncOutcome::Noop);
        }

        let _slot = self.locks.acquire_slot(&ctx.token).await?;
        let _pair = self
            .locks
            .acquire_pair(ctx.path(), &ctx.counterpart_path, &ctx.token)
            .await?;

        let target = ctx.counterpart_path.clone();
        let record = self.resilience.stat(&target).await?;
        if !record.is_existing_file() {
            debug!(path = %target.display(), "counterpart already gone, nothing to delete");
            return Ok(SyncOutcome::Noop);
        }

        let backup = backup_path(&target);
        self.resilience
            .run_with_retry(OpClass::Write, &target, || {
                let target = target.clone();
                let backup = backup.clone();
                async move {
                    match tokio::fs::remove_file(&backup).await {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(SyncError::from_io(err, &backup)),
                    }
                    tokio::fs::rename(&target, &backup)
                        .await
                        .map_err(|err| SyncError::from_io(err, &target))
                }
            })
            .await?;

        self.cache.invalidate(&target, &ctx.token).await;
        info!(
            path = %target.display(),
            backup = %backup.display(),
            "soft-deleted counterpart"
        );
        Ok(SyncOutcome::SoftDeleted)
    }

    fn check_free_space(
        &self,
        payload: u64,
        role: SyncRole,
        target: &Path,
    ) -> Result<(), SyncError> {
        let min_free = match role {
            SyncRole::Mirror => self.config.mirror.min_free_space_bytes,
            SyncRole::History => self.config.history.min_free_space_bytes,
        };
        if min_free == 0 {
            return Ok(());
        }

        let root = match role {
            SyncRole::Mirror => &self.config.mirror.dest_root,
            SyncRole::History => &self.config.history.dest_root,
        };
        let Some(free) = free_space(root) else {
            // No volume information: proceed rather than stall the mirror.
            return Ok(());
        };

        let required = payload.saturating_add(min_free);
        if free < required {
            warn!(
                path = %target.display(),
                free,
                required,
                "insufficient free space on destination volume, skipping file"
            );
            return Err(SyncError::InsufficientSpace {
                path: target.to_path_buf(),
                required,
            });
        }
        Ok(())
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<(), SyncError> {
        let key = FileRecord::normalize_key(dir);
        if self.created_dirs.contains(&key) {
            return Ok(());
        }
        self.resilience
            .run_with_retry(OpClass::Write, dir, || async {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|err| SyncError::from_io(err, dir))
            })
            .await?;
        self.created_dirs.insert(key);
        Ok(())
    }

    /// Temp file plus atomic rename, so readers of the destination never
    /// observe a half-written mirror file.
    async fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<(), SyncError> {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = target.with_file_name(format!(".{name}.part"));

        self.resilience
            .run_with_retry(OpClass::Write, target, || {
                let temp = temp.clone();
                let target = target.to_path_buf();
                async move {
                    tokio::fs::write(&temp, data)
                        .await
                        .map_err(|err| SyncError::from_io(err, &temp))?;
                    tokio::fs::rename(&temp, &target)
                        .await
                        .map_err(|err| SyncError::from_io(err, &target))
                }
            })
            .await
    }

    async fn write_direct(&self, target: &Path, data: &[u8]) -> Result<(), SyncError> {
        self.resilience
            .run_with_retry(OpClass::Write, target, || async {
                tokio::fs::write(target, data)
                    .await
                    .map_err(|err| SyncError::from_io(err, target))
            })
            .await
    }
}

/// The `~` backup sibling of a path.
fn backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}~"))
}

/// Free bytes available to unprivileged writers on the volume of `path`.
#[cfg(unix)]
fn free_space(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;

    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stats) };
    if rc != 0 {
        return None;
    }
    Some(stats.f_bavail as u64 * stats.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_space(_path: &Path) -> Option<u64> {
    None
}

// ============================================================================
// Unit tests
// ============================================================================
