//! Live filesystem watching with debouncing
//!
//! Wraps the `notify` crate and converts raw OS events into [`ChangeEvent`]
//! values on an mpsc channel. Raw events are far too chatty to act on
//! directly (editors write, truncate, and rename in bursts), so the engine
//! feeds them through a [`DebouncedChangeQueue`] and only reacts once a
//! path has been quiet for the configured window.
//!
//! ```text
//! inotify / kqueue
//!       │
//!       ▼
//!  FileWatcher ──→ mpsc::channel ──→ DebouncedChangeQueue ──→ MirrorEngine
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

// ============================================================================
// ChangeEvent
// ============================================================================

/// One filesystem change, decoupled from `notify`'s raw event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A file or directory appeared
    Created(PathBuf),
    /// A file's content or metadata changed
    Modified(PathBuf),
    /// A file or directory disappeared
    Deleted(PathBuf),
    /// A rename observed with both endpoints
    Renamed {
        /// The path before the rename
        old: PathBuf,
        /// The path after the rename
        new: PathBuf,
    },
}

impl ChangeEvent {
    /// The path this event concerns; the new path for renames.
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => p,
            ChangeEvent::Renamed { new, .. } => new,
        }
    }
}

// ============================================================================
// FileWatcher
// ============================================================================

/// Recursive directory watcher built on the OS-native mechanism
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Creates the watcher and the channel its events arrive on.
    ///
    /// Debouncing is not done here; push received events into a
    /// [`DebouncedChangeQueue`] and poll that instead.
    pub fn new() -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::channel::<ChangeEvent>(1024);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&event) {
                        if let Err(err) = tx.blocking_send(change) {
                            warn!(error = %err, "change receiver dropped, event lost");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "watcher backend error");
                }
            },
            notify::Config::default(),
        )
        .context("failed to create the filesystem watcher")?;

        Ok((Self { watcher }, rx))
    }

    /// Starts watching a directory tree recursively.
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "watching tree");
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", path.display()))
    }
}

/// Maps one raw `notify` event to a [`ChangeEvent`], or `None` for kinds
/// the engine never acts on (access events, watch bookkeeping).
fn map_notify_event(event: &notify::Event) -> Option<ChangeEvent> {
    let first = event.paths.first();

    match &event.kind {
        EventKind::Create(_) => Some(ChangeEvent::Created(first?.clone())),
        EventKind::Remove(_) => Some(ChangeEvent::Deleted(first?.clone())),

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            Some(ChangeEvent::Renamed {
                old: event.paths[0].clone(),
                new: event.paths[1].clone(),
            })
        }
        // One-sided rename halves: the appearing side is a create, the
        // disappearing side a delete. The pair is reconciled downstream.
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            Some(ChangeEvent::Created(first?.clone()))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            Some(ChangeEvent::Deleted(first?.clone()))
        }

        EventKind::Modify(_) => Some(ChangeEvent::Modified(first?.clone())),

        other => {
            debug!(kind = ?other, "ignoring event kind");
            None
        }
    }
}

// ============================================================================
// File stability check
// ============================================================================

/// Whether a file's size is constant across a short interval.
///
/// A freshly modified file may still be mid-write (downloads, large
/// copies); syncing it would mirror a torn state. Unreadable files are
/// reported unstable so the caller retries later.
pub async fn is_file_stable(path: &Path, check_interval_ms: u64) -> bool {
    let first = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "stability check cannot stat");
            return false;
        }
    };

    tokio::time::sleep(Duration::from_millis(check_interval_ms)).await;

    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len() == first,
        Err(_) => false,
    }
}

// ============================================================================
// DebouncedChangeQueue
// ============================================================================

/// Coalesces rapid-fire changes per path until the path settles
///
/// Pushing an event for a path that already has one pending replaces the
/// event and restarts its quiet timer, so a file being actively written
/// keeps extending its window and is only emitted once the writes stop.
pub struct DebouncedChangeQueue {
    pending: HashMap<PathBuf, (ChangeEvent, Instant)>,
    debounce_delay: Duration,
}

impl DebouncedChangeQueue {
    pub fn new(debounce_delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            debounce_delay,
        }
    }

    /// Inserts or refreshes the pending event for the event's path.
    pub fn push(&mut self, event: ChangeEvent) {
        let path = event.path().to_path_buf();
        self.pending.insert(path, (event, Instant::now()));
    }

    /// Removes and returns every event whose path has been quiet for at
    /// least the debounce delay.
    pub fn poll(&mut self) -> Vec<ChangeEvent> {
        let now = Instant::now();
        let settled_paths: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= self.debounce_delay)
            .map(|(path, _)| path.clone())
            .collect();

        settled_paths
            .iter()
            .filter_map(|path| self.pending.remove(path))
            .map(|(event, _)| event)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: EventKind, paths: Vec<&str>) -> notify::Event {
        notify::Event {
            kind,
            paths: paths.into_iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_map_create_and_remove() {
        let created = map_notify_event(&raw(
            EventKind::Create(notify::event::CreateKind::File),
            vec!["/a.txt"],
        ));
        assert_eq!(created, Some(ChangeEvent::Created(PathBuf::from("/a.txt"))));

        let removed = map_notify_event(&raw(
            EventKind::Remove(notify::event::RemoveKind::File),
            vec!["/a.txt"],
        ));
        assert_eq!(removed, Some(ChangeEvent::Deleted(PathBuf::from("/a.txt"))));
    }

    #[test]
    fn test_map_two_sided_rename() {
        let mapped = map_notify_event(&raw(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec!["/old.txt", "/new.txt"],
        ));
        assert_eq!(
            mapped,
            Some(ChangeEvent::Renamed {
                old: PathBuf::from("/old.txt"),
                new: PathBuf::from("/new.txt"),
            })
        );
    }

    #[test]
    fn test_map_one_sided_rename_halves() {
        let appeared = map_notify_event(&raw(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            vec!["/new.txt"],
        ));
        assert_eq!(appeared, Some(ChangeEvent::Created(PathBuf::from("/new.txt"))));

        let vanished = map_notify_event(&raw(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            vec!["/old.txt"],
        ));
        assert_eq!(vanished, Some(ChangeEvent::Deleted(PathBuf::from("/old.txt"))));
    }

    #[test]
    fn test_map_access_ignored_and_empty_paths() {
        assert!(map_notify_event(&raw(
            EventKind::Access(notify::event::AccessKind::Read),
            vec!["/a.txt"],
        ))
        .is_none());
        assert!(map_notify_event(&raw(
            EventKind::Create(notify::event::CreateKind::File),
            vec![],
        ))
        .is_none());
    }

    #[test]
    fn test_queue_coalesces_same_path() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(0));
        queue.push(ChangeEvent::Created(PathBuf::from("/a.txt")));
        queue.push(ChangeEvent::Modified(PathBuf::from("/a.txt")));
        assert_eq!(queue.pending_count(), 1);

        std::thread::sleep(Duration::from_millis(5));
        let settled = queue.poll();
        assert_eq!(settled, vec![ChangeEvent::Modified(PathBuf::from("/a.txt"))]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_queue_holds_recent_events() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_secs(60));
        queue.push(ChangeEvent::Created(PathBuf::from("/a.txt")));
        assert!(queue.poll().is_empty());
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_queue_push_resets_quiet_timer() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(50));
        queue.push(ChangeEvent::Created(PathBuf::from("/a.txt")));
        std::thread::sleep(Duration::from_millis(30));

        // Still being written: the window restarts.
        queue.push(ChangeEvent::Modified(PathBuf::from("/a.txt")));
        std::thread::sleep(Duration::from_millis(30));
        assert!(queue.poll().is_empty());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.poll().len(), 1);
    }

    #[test]
    fn test_queue_partial_settlement() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(40));
        queue.push(ChangeEvent::Created(PathBuf::from("/settled.txt")));
        std::thread::sleep(Duration::from_millis(50));
        queue.push(ChangeEvent::Created(PathBuf::from("/fresh.txt")));

        let settled = queue.poll();
        assert_eq!(settled, vec![ChangeEvent::Created(PathBuf::from("/settled.txt"))]);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_stable_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("quiet.txt");
        tokio::fs::write(&path, b"done").await.unwrap();
        assert!(is_file_stable(&path, 10).await);
    }

    #[tokio::test]
    async fn test_growing_file_is_unstable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("busy.txt");
        tokio::fs::write(&path, b"start").await.unwrap();

        let grower = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tokio::fs::write(&path, b"start plus more").await.unwrap();
            })
        };
        let stable = is_file_stable(&path, 60).await;
        grower.await.unwrap();
        assert!(!stable);
    }

    #[tokio::test]
    async fn test_missing_file_is_unstable() {
        assert!(!is_file_stable(Path::new("/no/such/file"), 1).await);
    }
}
