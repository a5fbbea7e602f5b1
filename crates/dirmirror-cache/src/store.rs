//! In-memory metadata cache with role-aware bypass rules
//!
//! ## Lookup flow
//!
//! ```text
//! get(path)
//!    |
//!    v
//! cache applies? --no--> resilient stat, return
//!    |
//!   yes
//!    |
//!    v
//! memory hit? --yes--> return cached record
//!    |
//!   miss
//!    |
//!    v
//! resilient stat -> store in memory -> upsert persisted entry -> return
//! ```
//!
//! Persisting is best-effort: a failed cache-file write is logged and the
//! freshly statted record is still returned, because the cache exists to
//! save stats, not to gate them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dirmirror_core::config::CacheConfig;
use dirmirror_core::domain::context::SyncContext;
use dirmirror_core::domain::errors::SyncError;
use dirmirror_core::domain::record::FileRecord;
use dirmirror_core::locks::PathLockQueue;
use dirmirror_core::resilience::Resilience;

use crate::persist::DirCacheStore;

/// Two-layer metadata cache for destination and history paths
pub struct MetadataCache {
    /// Normalized directory key -> (normalized file name key -> record)
    memory: DashMap<String, HashMap<String, FileRecord>>,
    persisted: DirCacheStore,
    resilience: Resilience,
    config: CacheConfig,
    /// Live bidirectional mirroring makes the destination externally
    /// writable, which disables mirror-role caching.
    bidirectional: bool,
}

impl MetadataCache {
    pub fn new(
        config: CacheConfig,
        bidirectional: bool,
        resilience: Resilience,
        locks: Arc<PathLockQueue>,
    ) -> Self {
        Self {
            memory: DashMap::new(),
            persisted: DirCacheStore::new(config.file_name.clone(), locks),
            resilience,
            config,
            bidirectional,
        }
    }

    /// The hidden cache file name, which event filtering must exclude.
    pub fn cache_file_name(&self) -> &str {
        self.persisted.file_name()
    }

    /// Whether a counterpart lookup for this context may be answered from
    /// cache. The source tree is authoritative and never cached, so only
    /// source-side events (whose counterpart lies in a destination tree)
    /// qualify.
    pub fn cache_applies(&self, ctx: &SyncContext) -> bool {
        if !self.config.in_memory && !self.config.persistent {
            return false;
        }
        if !ctx.is_src_path {
            return false;
        }
        if ctx.for_history() {
            return true;
        }
        !(self.bidirectional && !ctx.is_initial_scan())
    }

    /// Looks up the record for `path`, from cache when `cached` allows it,
    /// falling back to a resilient stat on miss.
    pub async fn get(
        &self,
        path: &Path,
        cached: bool,
        token: &CancellationToken,
    ) -> Result<FileRecord, SyncError> {
        let (dir_key, name_key) = split_keys(path);

        if cached && self.config.in_memory {
            if let Some(entries) = self.memory.get(&dir_key) {
                if let Some(record) = entries.get(&name_key) {
                    debug!(path = %path.display(), "cache hit");
                    return Ok(record.clone());
                }
            }
        }

        let record = self.resilience.stat(path).await?;

        if cached {
            self.store_record(path, &dir_key, name_key, record.clone(), token)
                .await;
        }
        Ok(record)
    }

    /// Drops any cached knowledge of `path`, in memory and on disk. Called
    /// before every write so a failed copy cannot leave a record claiming
    /// the old content is still intact.
    pub async fn invalidate(&self, path: &Path, token: &CancellationToken) {
        let (dir_key, name_key) = split_keys(path);

        if let Some(mut entries) = self.memory.get_mut(&dir_key) {
            entries.remove(&name_key);
        }

        if self.config.persistent {
            if let Some(dir) = path.parent() {
                if let Err(err) = self.persisted.remove_entry(dir, &name_key, token).await {
                    warn!(path = %path.display(), error = %err, "cache invalidation write failed");
                }
            }
        }
    }

    /// Records a freshly observed state for `path` after a successful write.
    pub async fn record_observed(
        &self,
        path: &Path,
        record: FileRecord,
        token: &CancellationToken,
    ) {
        let (dir_key, name_key) = split_keys(path);
        self.store_record(path, &dir_key, name_key, record, token)
            .await;
    }

    /// Re-stats the event's own path at most once per event, no matter how
    /// many sibling contexts ask. The claimant publishes its observation;
    /// later callers reuse it.
    pub async fn refresh(&self, ctx: &SyncContext) -> Result<FileRecord, SyncError> {
        if ctx.claim_refresh() {
            let record = self.resilience.stat(ctx.path()).await?;
            ctx.store_own_record(record.clone()).await;
            ctx.refresh_flag().publish(record.clone());
            return Ok(record);
        }

        if let Some(shared) = ctx.refresh_flag().published() {
            ctx.store_own_record(shared.clone()).await;
            return Ok(shared);
        }

        // The sibling claimed the refresh but has not finished statting.
        // A second stat here is harmless and avoids waiting on it.
        self.resilience.stat(ctx.path()).await
    }

    /// Loads one directory's persisted map into memory in bulk. Returns the
    /// map when the directory has a built cache, `None` when it must be
    /// rescanned.
    pub async fn prefetch_dir(
        &self,
        dir: &Path,
        token: &CancellationToken,
    ) -> Result<Option<HashMap<String, FileRecord>>, SyncError> {
        if !self.config.persistent {
            return Ok(None);
        }
        let Some(entries) = self.persisted.load(dir, token).await? else {
            return Ok(None);
        };

        if self.config.in_memory {
            let dir_key = FileRecord::normalize_key(dir);
            self.memory.insert(dir_key, entries.clone());
        }
        debug!(dir = %dir.display(), entries = entries.len(), "directory cache prefetched");
        Ok(Some(entries))
    }

    async fn store_record(
        &self,
        path: &Path,
        dir_key: &str,
        name_key: String,
        record: FileRecord,
        token: &CancellationToken,
    ) {
        if self.config.in_memory {
            self.memory
                .entry(dir_key.to_string())
                .or_default()
                .insert(name_key.clone(), record.clone());
        }

        if self.config.persistent {
            if let Some(dir) = path.parent() {
                if let Err(err) = self
                    .persisted
                    .update_entry(dir, &name_key, record, token)
                    .await
                {
                    warn!(path = %path.display(), error = %err, "cache persist failed");
                }
            }
        }
    }
}

/// Splits a path into its normalized directory key and file-name key.
fn split_keys(path: &Path) -> (String, String) {
    let dir_key = path
        .parent()
        .map(FileRecord::normalize_key)
        .unwrap_or_default();
    let name_key = path
        .file_name()
        .map(|n| FileRecord::normalize_key(Path::new(n)))
        .unwrap_or_default();
    (dir_key, name_key)
}
