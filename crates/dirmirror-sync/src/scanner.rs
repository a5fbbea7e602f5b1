//! Periodic scan reconciliation
//!
//! Watcher events can be lost (daemon restarts, overflowing kernel queues,
//! network filesystems that do not emit them at all), so the reconciler
//! periodically walks each watched tree, diffs it against the previous
//! snapshot, and synthesizes the events the watcher missed. Synthesized
//! events flow through exactly the same pipeline as live ones.
//!
//! ## Walk
//!
//! Iterative depth-first with an explicit stack, so arbitrarily deep trees
//! cannot overflow the call stack. Symlinked directories are skipped unless
//! configured otherwise, ignored subtrees are pruned via the classifier's
//! automaton, and each directory's listing optionally runs concurrently
//! with a prefetch of the counterpart directory's persisted cache.
//!
//! ## Completion
//!
//! Callers can wait on a [`ScanCountdown`]: it reaches zero only once every
//! synthesized event has been *processed*, not merely enumerated, which is
//! what lets the daemon report "initial sync complete" truthfully.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dirmirror_cache::MetadataCache;
use dirmirror_core::config::Config;
use dirmirror_core::domain::errors::SyncError;
use dirmirror_core::domain::event::{EventKind, FileEvent, Side, SyncRole};
use dirmirror_core::domain::record::FileRecord;
use dirmirror_core::resilience::Resilience;

use crate::classify::EventClassifier;

// ============================================================================
// Completion countdown
// ============================================================================

/// Counts synthesized events still in flight for one scan pass
///
/// `register` before dispatching, `complete` after the event has been fully
/// processed, `seal` once enumeration is done. `wait` returns only when the
/// pass is sealed and every registered event has completed.
#[derive(Default)]
pub struct ScanCountdown {
    pending: AtomicUsize,
    sealed: AtomicBool,
    notify: Notify,
}

impl ScanCountdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn complete(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Marks enumeration finished; `wait` can now return once in-flight
    /// events drain.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_idle(&self) -> bool {
        self.sealed.load(Ordering::Acquire) && self.pending.load(Ordering::Acquire) == 0
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// Event sink
// ============================================================================

/// Where synthesized events are dispatched (the engine, in production)
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Processes one synthesized event for one role, fully, before
    /// returning.
    async fn dispatch_scan_event(&self, event: FileEvent, role: SyncRole);
}

// ============================================================================
// ScanReconciler
// ============================================================================

/// Counters for one scan pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub files: usize,
    pub added: usize,
    pub touched: usize,
    pub removed: usize,
}

type SnapshotKey = (String, SyncRole);

/// Walks watched trees and synthesizes the events the watcher missed
pub struct ScanReconciler {
    config: Arc<Config>,
    classifier: Arc<EventClassifier>,
    cache: Arc<MetadataCache>,
    resilience: Resilience,
    /// Previous listings keyed by (normalized root, role); owned
    /// exclusively by the reconciler.
    snapshots: Mutex<HashMap<SnapshotKey, HashMap<String, FileRecord>>>,
}

impl ScanReconciler {
    pub fn new(
        config: Arc<Config>,
        classifier: Arc<EventClassifier>,
        cache: Arc<MetadataCache>,
        resilience: Resilience,
    ) -> Self {
        Self {
            config,
            classifier,
            cache,
            resilience,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Walks `root`, diffs against the previous snapshot for `role`, and
    /// dispatches every synthesized event through `sink`.
    #[allow(clippy::too_many_arguments)]
    pub async fn scan(
        &self,
        root: &Path,
        side: Side,
        role: SyncRole,
        initial_scan: bool,
        sink: &dyn EventSink,
        countdown: &ScanCountdown,
        token: &CancellationToken,
    ) -> Result<ScanStats, SyncError> {
        let listing = self.walk(root, role, token).await?;
        let file_count = listing.len();

        // Ignoring deletions means absence must never be inferred from the
        // snapshot, so the old entries are merged over rather than replaced.
        let ignore_deletions = side == Side::Source && self.config.engine.ignore_source_deletions;

        let mut events: Vec<(FileRecord, EventKind)> = Vec::new();
        {
            let mut snapshots = self.snapshots.lock().await;
            let key = (FileRecord::normalize_key(root), role);
            let previous = snapshots.get(&key);

            for (name, record) in &listing {
                match previous.and_then(|prev| prev.get(name)) {
                    None => events.push((record.clone(), EventKind::Added)),
                    Some(prev) if record.differs_from(prev) => {
                        events.push((record.clone(), EventKind::Touched))
                    }
                    Some(_) => {}
                }
            }

            if let Some(previous) = previous {
                if !ignore_deletions {
                    for (name, prev) in previous {
                        if !listing.contains_key(name) {
                            events.push((prev.clone(), EventKind::Removed));
                        }
                    }
                }
            }

            if ignore_deletions {
                snapshots.entry(key).or_default().extend(listing);
            } else {
                snapshots.insert(key, listing);
            }
        }

        let mut stats = ScanStats {
            files: file_count,
            ..ScanStats::default()
        };
        for (record, kind) in events {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            match kind {
                EventKind::Added => stats.added += 1,
                EventKind::Touched => stats.touched += 1,
                EventKind::Removed => stats.removed += 1,
                EventKind::Renamed { .. } => {}
            }
            countdown.register();
            let event = FileEvent::scanned(record, kind, side, initial_scan);
            sink.dispatch_scan_event(event, role).await;
            countdown.complete();
        }

        Ok(stats)
    }

    /// Iterative depth-first listing of every regular file under `root`.
    async fn walk(
        &self,
        root: &Path,
        role: SyncRole,
        token: &CancellationToken,
    ) -> Result<HashMap<String, FileRecord>, SyncError> {
        let mut listing = HashMap::new();
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if self.classifier.dir_ignored(root, &dir) {
                debug!(dir = %dir.display(), "ignored subtree pruned from scan");
                continue;
            }

            // List and warm the counterpart directory's cache in parallel.
            let (entries, _) = tokio::join!(
                self.resilience.list_dir(&dir),
                self.prefetch_counterpart(root, &dir, role, token)
            );

            for record in entries? {
                if self.classifier.is_internal_file(&record.path) {
                    continue;
                }
                // Listing never follows links, so a symlink's record says
                // nothing about its target; resolve the target type here.
                if record.attributes.symlink {
                    match tokio::fs::metadata(&record.path).await {
                        Ok(meta) if meta.is_dir() => {
                            if self.config.engine.follow_symlinked_dirs {
                                stack.push(record.path.clone());
                            } else {
                                debug!(dir = %record.path.display(), "skipping symlinked directory");
                            }
                        }
                        Ok(meta) => {
                            // Size and write time must describe the target,
                            // not the link, or every diff looks changed.
                            let mut resolved = FileRecord::from_metadata(&record.path, &meta);
                            resolved.attributes.symlink = true;
                            listing.insert(FileRecord::normalize_key(&record.path), resolved);
                        }
                        Err(err) => {
                            debug!(path = %record.path.display(), error = %err, "broken symlink skipped");
                        }
                    }
                    continue;
                }
                if record.is_directory() {
                    stack.push(record.path.clone());
                } else if record.is_existing_file() {
                    listing.insert(FileRecord::normalize_key(&record.path), record);
                }
            }
        }
        Ok(listing)
    }

    async fn prefetch_counterpart(
        &self,
        root: &Path,
        dir: &Path,
        role: SyncRole,
        token: &CancellationToken,
    ) {
        let dest_root = match role {
            SyncRole::Mirror => &self.config.mirror.dest_root,
            SyncRole::History => &self.config.history.dest_root,
        };
        let Ok(relative) = dir.strip_prefix(root) else {
            return;
        };
        let counterpart_dir = dest_root.join(relative);
        if let Err(err) = self.cache.prefetch_dir(&counterpart_dir, token).await {
            warn!(dir = %counterpart_dir.display(), error = %err, "counterpart prefetch failed");
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================
