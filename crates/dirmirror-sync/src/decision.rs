//! The update decision engine
//!
//! [`DecisionEngine::needs_update`] answers one question per context: does
//! this file need to be written to its counterpart? The rules run in a
//! fixed order and the first one that fires decides:
//!
//! 1. Role disabled - never.
//! 2. Initial scan with content comparison on - always (the executor's
//!    byte comparison makes this cheap and safe).
//! 3. Source larger than the configured maximum - skipped with a warning.
//! 4. Bidirectional echo debounce - a write this engine just completed must
//!    not bounce back as a new event.
//! 5. Date comparison - source must be newer than the counterpart; a
//!    missing counterpart always needs an update.
//! 6. Content comparison off - fall back to size, then to bare existence.
//! 7. Otherwise defer to the executor's byte-for-byte comparison.
//!
//! The counterpart record is fetched through the metadata cache as a side
//! effect, so a later executor step rarely needs another stat.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use dirmirror_cache::MetadataCache;
use dirmirror_core::config::Config;
use dirmirror_core::domain::context::SyncContext;
use dirmirror_core::domain::errors::SyncError;
use dirmirror_core::domain::record::FileRecord;

/// Grace window after a completed write during which an event on the same
/// path, with a write time inside the window, is treated as our own echo.
pub const ECHO_DEBOUNCE: Duration = Duration::from_secs(3);

// ============================================================================
// Write completion log (echo debounce)
// ============================================================================

/// Completion times of writes this engine performed, keyed by normalized
/// path. Shared between the executor (which records) and the decision
/// engine (which consults). Only meaningful in bidirectional mode.
#[derive(Default)]
pub struct WriteLog {
    completed: DashMap<String, DateTime<Utc>>,
}

impl WriteLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a write to `path` completed just now.
    pub fn record_completion(&self, path: &Path) {
        let now = Utc::now();
        let window = chrono::Duration::from_std(ECHO_DEBOUNCE).unwrap_or_default();
        // A lapsed entry can never suppress again; drop it here so the map
        // stays bounded by the writes of the last window.
        self.completed.retain(|_, completed| now <= *completed + window);
        self.completed.insert(FileRecord::normalize_key(path), now);
    }

    /// Whether an event for `path` with the given write time falls inside
    /// the echo window of a completed write. A write time after the window
    /// is a real edit and is never suppressed.
    pub fn is_echo(&self, path: &Path, modified: Option<DateTime<Utc>>) -> bool {
        let key = FileRecord::normalize_key(path);
        let Some(completed) = self.completed.get(&key) else {
            return false;
        };
        let window_end = *completed + chrono::Duration::from_std(ECHO_DEBOUNCE).unwrap_or_default();
        let observed = modified.unwrap_or_else(Utc::now);
        observed <= window_end
    }
}

// ============================================================================
// DecisionEngine
// ============================================================================

/// Applies the ordered update rules to one context
pub struct DecisionEngine {
    config: Arc<Config>,
    cache: Arc<MetadataCache>,
    write_log: Arc<WriteLog>,
}

impl DecisionEngine {
    pub fn new(config: Arc<Config>, cache: Arc<MetadataCache>, write_log: Arc<WriteLog>) -> Self {
        Self {
            config,
            cache,
            write_log,
        }
    }

    /// Whether the context's counterpart needs to be (re)written.
    pub async fn needs_update(&self, ctx: &SyncContext) -> Result<bool, SyncError> {
        // Rule 1: disabled roles never sync.
        if !self.config.role_enabled(ctx.role) {
            return Ok(false);
        }

        // Rule 2: the first pass pushes everything; the executor's content
        // comparison turns redundant pushes into no-ops.
        if ctx.is_initial_scan() && self.config.compare.by_content {
            return Ok(true);
        }

        // Scan-sourced snapshots are stale for length, live events carry
        // none at all; both need the once-per-event re-stat.
        let own = self.cache.refresh(ctx).await?;
        if !own.is_existing_file() {
            debug!(path = %ctx.path().display(), "file gone before decision, nothing to write");
            return Ok(false);
        }

        // Rule 3: oversized files are skipped, not retried.
        let max = self.config.compare.max_file_size_bytes;
        if max > 0 && own.length_or_zero() > max {
            warn!(
                path = %ctx.path().display(),
                size = own.length_or_zero(),
                max,
                "file exceeds the configured maximum size, skipping"
            );
            return Ok(false);
        }

        // Rule 4: suppress echoes of our own bidirectional writes.
        if self.config.mirror.bidirectional
            && !ctx.for_history()
            && self.write_log.is_echo(ctx.path(), own.modified)
        {
            debug!(path = %ctx.path().display(), "suppressing echo of a completed write");
            return Ok(false);
        }

        // Counterpart metadata, cached when the role's rules allow it.
        let cached = self.cache.cache_applies(ctx);
        let counterpart = self
            .cache
            .get(&ctx.counterpart_path, cached, &ctx.token)
            .await?;
        ctx.store_counterpart_record(counterpart.clone()).await;

        // Rule 5: date comparison. A missing counterpart always updates.
        if self.config.compare.by_date {
            if counterpart.exists != Some(true) {
                return Ok(true);
            }
            let newer = match (own.modified, counterpart.modified) {
                (Some(src), Some(dst)) => src > dst,
                // Unknown times cannot prove staleness either way; treat
                // the source as newer and let content/size decide.
                _ => true,
            };
            if !newer {
                return Ok(false);
            }
        }

        // Rule 6: without content comparison, size or existence decides.
        if !self.config.compare.by_content {
            if self.config.compare.by_size {
                return Ok(own.length != counterpart.length);
            }
            if self.config.compare.by_date {
                // Date already proved the source newer; existence decides.
                return Ok(counterpart.exists != Some(true));
            }
            return Err(SyncError::ConfigInconsistent(
                "all comparison modes are disabled, no rule can decide".to_string(),
            ));
        }

        // Rule 7: let the executor's byte comparison have the final word.
        Ok(true)
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    use dirmirror_core::config::ResilienceConfig;
    use dirmirror_core::domain::context::RefreshFlag;
    use dirmirror_core::domain::event::{EventKind, FileEvent, Side, SyncRole};
    use dirmirror_core::locks::PathLockQueue;
    use dirmirror_core::resilience::Resilience;

    struct Fixture {
        engine: DecisionEngine,
        write_log: Arc<WriteLog>,
        source: tempfile::TempDir,
        dest: tempfile::TempDir,
    }

    fn fixture(mutate: impl FnOnce(&mut Config)) -> Fixture {
        let source = tempfile::TempDir::new().unwrap();
        let dest = tempfile::TempDir::new().unwrap();

        let mut config = Config::default();
        config.source_root = source.path().to_path_buf();
        config.mirror.enabled = true;
        config.mirror.dest_root = dest.path().to_path_buf();
        mutate(&mut config);
        let config = Arc::new(config);

        let token = CancellationToken::new();
        let resilience = Resilience::new(ResilienceConfig::default(), token);
        let cache = Arc::new(MetadataCache::new(
            config.cache.clone(),
            config.mirror.bidirectional,
            resilience,
            Arc::new(PathLockQueue::new(2)),
        ));
        let write_log = Arc::new(WriteLog::new());
        let engine = DecisionEngine::new(config, Arc::clone(&cache), Arc::clone(&write_log));
        Fixture {
            engine,
            write_log,
            source,
            dest,
        }
    }

    fn context(fx: &Fixture, name: &str, role: SyncRole, initial_scan: bool) -> SyncContext {
        let mut event = FileEvent::live(
            fx.source.path().join(name),
            EventKind::Touched,
            Side::Source,
        );
        event.initial_scan = initial_scan;
        SyncContext::new(
            event,
            role,
            fx.dest.path().join(name),
            CancellationToken::new(),
            RefreshFlag::new(),
        )
    }

    #[tokio::test]
    async fn test_disabled_role_never_updates() {
        let fx = fixture(|c| c.history.enabled = false);
        std::fs::write(fx.source.path().join("a.txt"), b"x").unwrap();
        let ctx = context(&fx, "a.txt", SyncRole::History, false);
        assert!(!fx.engine.needs_update(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_initial_scan_always_pushes() {
        let fx = fixture(|_| {});
        // No file on disk is needed: rule 2 fires before any stat.
        let ctx = context(&fx, "a.txt", SyncRole::Mirror, true);
        assert!(fx.engine.needs_update(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_file_skipped() {
        let fx = fixture(|c| c.compare.max_file_size_bytes = 4);
        std::fs::write(fx.source.path().join("big.bin"), b"0123456789").unwrap();
        let ctx = context(&fx, "big.bin", SyncRole::Mirror, false);
        assert!(!fx.engine.needs_update(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_counterpart_needs_update() {
        let fx = fixture(|_| {});
        std::fs::write(fx.source.path().join("a.txt"), b"x").unwrap();
        let ctx = context(&fx, "a.txt", SyncRole::Mirror, false);
        assert!(fx.engine.needs_update(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_vanished_source_is_noop() {
        let fx = fixture(|_| {});
        let ctx = context(&fx, "gone.txt", SyncRole::Mirror, false);
        assert!(!fx.engine.needs_update(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_older_source_does_not_update() {
        let fx = fixture(|_| {});
        // Counterpart written after the source: source is not newer.
        std::fs::write(fx.source.path().join("a.txt"), b"old").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(fx.dest.path().join("a.txt"), b"newer").unwrap();

        let ctx = context(&fx, "a.txt", SyncRole::Mirror, false);
        assert!(!fx.engine.needs_update(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_newer_source_defers_to_content() {
        let fx = fixture(|_| {});
        std::fs::write(fx.dest.path().join("a.txt"), b"old").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(fx.source.path().join("a.txt"), b"new").unwrap();

        let ctx = context(&fx, "a.txt", SyncRole::Mirror, false);
        assert!(fx.engine.needs_update(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_size_fallback_without_content_compare() {
        let fx = fixture(|c| c.compare.by_content = false);
        std::fs::write(fx.dest.path().join("a.txt"), b"old").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(fx.source.path().join("a.txt"), b"old").unwrap();

        // Same size: no update even though the source is newer.
        let ctx = context(&fx, "a.txt", SyncRole::Mirror, false);
        assert!(!fx.engine.needs_update(&ctx).await.unwrap());

        std::fs::write(fx.source.path().join("a.txt"), b"longer").unwrap();
        let ctx = context(&fx, "a.txt", SyncRole::Mirror, false);
        assert!(fx.engine.needs_update(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_existence_fallback_when_only_dates_compare() {
        let fx = fixture(|c| {
            c.compare.by_content = false;
            c.compare.by_size = false;
        });
        std::fs::write(fx.source.path().join("a.txt"), b"x").unwrap();

        let ctx = context(&fx, "a.txt", SyncRole::Mirror, false);
        assert!(fx.engine.needs_update(&ctx).await.unwrap());

        std::fs::write(fx.source.path().join("b.txt"), b"x").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        // Present counterpart, but source must first prove newer; make it so.
        std::fs::write(fx.dest.path().join("b.txt"), b"x").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(fx.source.path().join("b.txt"), b"y").unwrap();

        let ctx = context(&fx, "b.txt", SyncRole::Mirror, false);
        assert!(!fx.engine.needs_update(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_all_comparisons_disabled_is_config_error() {
        let fx = fixture(|c| {
            c.compare.by_date = false;
            c.compare.by_size = false;
            c.compare.by_content = false;
        });
        std::fs::write(fx.source.path().join("a.txt"), b"x").unwrap();
        let ctx = context(&fx, "a.txt", SyncRole::Mirror, false);
        let err = fx.engine.needs_update(&ctx).await.unwrap_err();
        assert!(matches!(err, SyncError::ConfigInconsistent(_)));
    }

    #[tokio::test]
    async fn test_echo_suppressed_in_bidirectional_mode() {
        let fx = fixture(|c| c.mirror.bidirectional = true);
        std::fs::write(fx.source.path().join("a.txt"), b"x").unwrap();

        fx.write_log.record_completion(&fx.source.path().join("a.txt"));
        let ctx = context(&fx, "a.txt", SyncRole::Mirror, false);
        assert!(!fx.engine.needs_update(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_echo_window_expires() {
        let log = WriteLog::new();
        let path = Path::new("/data/a.txt");
        log.record_completion(path);

        // A write time well past the window is a real edit.
        let late = Utc::now() + chrono::Duration::seconds(10);
        assert!(!log.is_echo(path, Some(late)));
        assert!(log.is_echo(path, Some(Utc::now())));
        // Unknown paths are never echoes.
        assert!(!log.is_echo(Path::new("/data/other.txt"), Some(Utc::now())));
    }

    #[tokio::test]
    async fn test_lapsed_completions_pruned_on_record() {
        let log = WriteLog::new();
        log.completed.insert(
            FileRecord::normalize_key(Path::new("/data/stale.txt")),
            Utc::now() - chrono::Duration::seconds(60),
        );

        log.record_completion(Path::new("/data/fresh.txt"));
        assert_eq!(log.completed.len(), 1);
        assert!(log
            .completed
            .contains_key(&FileRecord::normalize_key(Path::new("/data/fresh.txt"))));
    }

    #[tokio::test]
    async fn test_decision_idempotent_after_write() {
        // Once counterpart matches (same time or newer, same size), a
        // repeat of the same event decides "no update".
        let fx = fixture(|_| {});
        std::fs::write(fx.source.path().join("a.txt"), b"same").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(fx.dest.path().join("a.txt"), b"same").unwrap();

        let ctx = context(&fx, "a.txt", SyncRole::Mirror, false);
        assert!(!fx.engine.needs_update(&ctx).await.unwrap());
        let again = context(&fx, "a.txt", SyncRole::Mirror, false);
        assert!(!fx.engine.needs_update(&again).await.unwrap());
    }
}
