//! The mirror engine
//!
//! Owns every pipeline component and the daemon's run loop. Live watcher
//! events and synthesized scan events converge here and flow through
//! classify → decide → execute. Per-file failures are isolated: the error
//! is reported and the engine moves on, because one locked file must never
//! stall the mirror.
//!
//! ## Run loop
//!
//! ```text
//! initial scan (all enabled roles) ──→ "initial sync complete"
//!        │
//!        ▼
//! select! {
//!     watcher event  ──→ debounce queue
//!     debounce tick  ──→ settled events ──→ pipeline
//!     rescan tick    ──→ scan pass
//!     cancellation   ──→ graceful stop
//! }
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dirmirror_cache::MetadataCache;
use dirmirror_core::config::Config;
use dirmirror_core::domain::context::{RefreshFlag, SyncContext};
use dirmirror_core::domain::errors::SyncError;
use dirmirror_core::domain::event::{EventKind, FileEvent, Side, SyncRole};
use dirmirror_core::locks::PathLockQueue;
use dirmirror_core::resilience::Resilience;

use crate::classify::EventClassifier;
use crate::decision::{DecisionEngine, WriteLog};
use crate::executor::Executor;
use crate::scanner::{EventSink, ScanCountdown, ScanReconciler};
use crate::watcher::{is_file_stable, ChangeEvent, DebouncedChangeQueue, FileWatcher};

/// Interval between the two size reads of the pre-sync stability check.
const STABILITY_CHECK_MS: u64 = 100;

/// What to do with one settled watcher change
enum Prepared {
    /// Ready for the pipeline
    Event(FileEvent),
    /// Still being written; check again after another quiet window
    Requeue(ChangeEvent),
    /// Not ours to act on
    Ignore,
}

/// Wires classifier, decision engine, executor, cache, and reconciler
/// together and drives them from watcher events and periodic scans
pub struct MirrorEngine {
    config: Arc<Config>,
    classifier: Arc<EventClassifier>,
    decision: DecisionEngine,
    executor: Executor,
    reconciler: ScanReconciler,
    token: CancellationToken,
    /// Last reported failure message, for consecutive-duplicate suppression.
    last_alert: StdMutex<Option<String>>,
}

impl MirrorEngine {
    pub fn new(config: Arc<Config>, token: CancellationToken) -> anyhow::Result<Self> {
        let resilience = Resilience::new(config.resilience.clone(), token.clone());
        let locks = Arc::new(PathLockQueue::new(config.engine.max_concurrent_syncs));
        let cache = Arc::new(MetadataCache::new(
            config.cache.clone(),
            config.mirror.bidirectional,
            resilience.clone(),
            Arc::clone(&locks),
        ));
        let write_log = Arc::new(WriteLog::new());
        let classifier = Arc::new(EventClassifier::new(Arc::clone(&config))?);

        let decision = DecisionEngine::new(
            Arc::clone(&config),
            Arc::clone(&cache),
            Arc::clone(&write_log),
        );
        let executor = Executor::new(
            Arc::clone(&config),
            Arc::clone(&cache),
            Arc::clone(&locks),
            resilience.clone(),
            write_log,
        );
        let reconciler = ScanReconciler::new(
            Arc::clone(&config),
            Arc::clone(&classifier),
            cache,
            resilience,
        );

        Ok(Self {
            config,
            classifier,
            decision,
            executor,
            reconciler,
            token,
            last_alert: StdMutex::new(None),
        })
    }

    /// Runs until the cancellation token fires: initial scan, then live
    /// watching with periodic reconciliation scans.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(source = %self.config.source_root.display(), "starting initial scan");
        let started = Instant::now();
        self.scan_pass(true).await;
        if self.token.is_cancelled() {
            return Ok(());
        }
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "initial sync complete"
        );

        let (mut watcher, mut changes) = FileWatcher::new()?;
        watcher.watch(&self.config.source_root)?;
        if self.config.mirror.bidirectional {
            watcher.watch(&self.config.mirror.dest_root)?;
        }

        let debounce = Duration::from_millis(self.config.engine.debounce_ms.max(1));
        let mut queue = DebouncedChangeQueue::new(debounce);
        let mut poll_tick = tokio::time::interval(Duration::from_millis(
            (self.config.engine.debounce_ms / 2).max(50),
        ));
        let mut rescan = tokio::time::interval(Duration::from_secs(
            self.config.engine.scan_interval_secs.max(1),
        ));
        // The initial scan just ran; skip the interval's immediate tick.
        rescan.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                Some(change) = changes.recv() => queue.push(change),
                _ = poll_tick.tick() => {
                    for change in queue.poll() {
                        match self.prepare_change(change).await {
                            Prepared::Event(event) => self.dispatch_event(event).await,
                            Prepared::Requeue(change) => queue.push(change),
                            Prepared::Ignore => {}
                        }
                    }
                }
                _ = rescan.tick() => self.scan_pass(false).await,
            }
        }

        info!("mirror engine stopped");
        Ok(())
    }

    /// Runs one event through the pipeline for every role it qualifies for.
    pub async fn dispatch_event(&self, event: FileEvent) {
        self.dispatch(event, None).await;
    }

    async fn dispatch(&self, event: FileEvent, only: Option<SyncRole>) {
        let (mirror, history) = self.classifier.classify(&event, &self.token);
        for ctx in [mirror, history].into_iter().flatten() {
            if only.is_some_and(|role| role != ctx.role) {
                continue;
            }
            match self.process_context(&ctx).await {
                Ok(()) => {}
                Err(SyncError::Cancelled) => return,
                Err(err) => {
                    self.alert(format!(
                        "{role} sync of {path} failed: {err}",
                        role = ctx.role,
                        path = ctx.path().display(),
                    ));
                }
            }
        }
    }

    async fn process_context(&self, ctx: &SyncContext) -> Result<(), SyncError> {
        match &ctx.event.kind {
            EventKind::Removed => {
                if ctx.event.side == Side::Source && self.config.engine.ignore_source_deletions {
                    debug!(path = %ctx.path().display(), "source deletion ignored by configuration");
                    return Ok(());
                }
                self.executor.delete_file(ctx).await?;
            }
            EventKind::Renamed { old } => {
                // A rename is a move: retire the old counterpart, then let
                // the regular update path materialize the new name.
                if !ctx.for_history() {
                    self.retire_renamed_counterpart(old, ctx).await?;
                }
                if self.decision.needs_update(ctx).await? {
                    self.executor.sync_file(ctx).await?;
                }
            }
            EventKind::Added | EventKind::Touched => {
                if self.decision.needs_update(ctx).await? {
                    self.executor.sync_file(ctx).await?;
                }
            }
        }
        Ok(())
    }

    /// Soft-deletes the counterpart of a rename's pre-rename path.
    async fn retire_renamed_counterpart(
        &self,
        old: &Path,
        ctx: &SyncContext,
    ) -> Result<(), SyncError> {
        let Some(old_counterpart) = self
            .classifier
            .mirror_counterpart_for(old, ctx.event.side)
        else {
            return Ok(());
        };
        let retire_event = FileEvent::live(old, EventKind::Removed, ctx.event.side);
        let retire_ctx = SyncContext::new(
            retire_event,
            SyncRole::Mirror,
            old_counterpart,
            self.token.clone(),
            RefreshFlag::new(),
        );
        self.executor.delete_file(&retire_ctx).await?;
        Ok(())
    }

    /// One full reconciliation pass over every enabled (root, role).
    ///
    /// Returns once every event the pass raised has been processed, not
    /// merely enumerated.
    pub async fn scan_pass(&self, initial: bool) {
        let countdown = ScanCountdown::new();

        let mut passes: Vec<(&Path, Side, SyncRole)> = Vec::new();
        if self.config.mirror.enabled {
            passes.push((&self.config.source_root, Side::Source, SyncRole::Mirror));
        }
        if self.config.history.enabled {
            passes.push((&self.config.source_root, Side::Source, SyncRole::History));
        }
        if self.config.mirror.bidirectional {
            passes.push((
                &self.config.mirror.dest_root,
                Side::Destination,
                SyncRole::Mirror,
            ));
        }

        for (root, side, role) in passes {
            match self
                .reconciler
                .scan(root, side, role, initial, self, &countdown, &self.token)
                .await
            {
                Ok(stats) => info!(
                    root = %root.display(),
                    %role,
                    files = stats.files,
                    added = stats.added,
                    touched = stats.touched,
                    removed = stats.removed,
                    "scan pass complete"
                ),
                Err(SyncError::Cancelled) => break,
                Err(err) => {
                    self.alert(format!("scan of {} failed: {err}", root.display()));
                }
            }
        }

        countdown.seal();
        countdown.wait().await;
    }

    /// Converts one settled watcher change into a pipeline event, dropping
    /// directory noise and re-queuing files that are still being written.
    async fn prepare_change(&self, change: ChangeEvent) -> Prepared {
        let primary = change.path().to_path_buf();
        if self.classifier.is_internal_file(&primary) {
            return Prepared::Ignore;
        }
        let side = if primary.starts_with(&self.config.source_root) {
            Side::Source
        } else if self.config.mirror.bidirectional
            && primary.starts_with(&self.config.mirror.dest_root)
        {
            Side::Destination
        } else {
            return Prepared::Ignore;
        };

        let kind = match &change {
            ChangeEvent::Created(_) => EventKind::Added,
            ChangeEvent::Modified(_) => EventKind::Touched,
            ChangeEvent::Deleted(_) => EventKind::Removed,
            ChangeEvent::Renamed { old, .. } => EventKind::Renamed { old: old.clone() },
        };

        if matches!(kind, EventKind::Added | EventKind::Touched) {
            match tokio::fs::metadata(&primary).await {
                // Directory creation carries no content; the files inside
                // raise their own events.
                Ok(meta) if meta.is_dir() => return Prepared::Ignore,
                Ok(_) => {
                    if !is_file_stable(&primary, STABILITY_CHECK_MS).await {
                        debug!(path = %primary.display(), "file still changing, re-queuing");
                        return Prepared::Requeue(change);
                    }
                }
                // Created and already gone: fold into a removal.
                Err(_) => {
                    return Prepared::Event(FileEvent::live(primary, EventKind::Removed, side))
                }
            }
        }

        Prepared::Event(FileEvent::live(primary, kind, side))
    }

    /// Reports a per-file failure, suppressing consecutive duplicates so a
    /// file failing on every scan does not flood the log.
    fn alert(&self, message: String) {
        let mut last = self.last_alert.lock().expect("alert slot poisoned");
        if last.as_deref() == Some(message.as_str()) {
            debug!(%message, "repeated failure suppressed");
        } else {
            warn!(%message, "synchronization failure");
            *last = Some(message);
        }
    }
}

#[async_trait]
impl EventSink for MirrorEngine {
    async fn dispatch_scan_event(&self, event: FileEvent, role: SyncRole) {
        self.dispatch(event, Some(role)).await;
    }
}

// ============================================================================
// Unit tests
// ============================================================================
