//! Raw and synthesized filesystem events
//!
//! A [`FileEvent`] is the engine's internal representation of one change,
//! whether it came from the live watcher or was synthesized by the scan
//! reconciler. The metadata snapshot it carries is a *hint*; the decision
//! engine always re-verifies before acting.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::record::FileRecord;

/// Which tree an event originated on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The authoritative source tree
    Source,
    /// The mirror destination tree (bidirectional mode only)
    Destination,
}

/// Which destination a synchronization context concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncRole {
    /// Live copy of source files to the destination tree
    Mirror,
    /// Append-only, timestamp-versioned archive of source file states
    History,
}

impl std::fmt::Display for SyncRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncRole::Mirror => write!(f, "mirror"),
            SyncRole::History => write!(f, "history"),
        }
    }
}

/// The kind of change an event describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A file appeared
    Added,
    /// A file disappeared
    Removed,
    /// A file's content or metadata changed
    Touched,
    /// A file was renamed; `old` is the pre-rename path
    Renamed {
        /// The path before the rename
        old: PathBuf,
    },
}

/// One filesystem change, live or synthesized
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// The (new) path the change concerns
    pub path: PathBuf,
    /// What happened
    pub kind: EventKind,
    /// Metadata snapshot at notification time, if the producer had one.
    /// Scan-sourced snapshots are known stale for length.
    pub snapshot: Option<FileRecord>,
    /// When the event was observed
    pub timestamp: DateTime<Utc>,
    /// Which tree produced the event
    pub side: Side,
    /// Set for events synthesized during the first full scan
    pub initial_scan: bool,
}

impl FileEvent {
    /// A live event observed just now on the given side.
    pub fn live(path: impl Into<PathBuf>, kind: EventKind, side: Side) -> Self {
        Self {
            path: path.into(),
            kind,
            snapshot: None,
            timestamp: Utc::now(),
            side,
            initial_scan: false,
        }
    }

    /// An event synthesized by the scan reconciler, carrying the record it
    /// observed while listing.
    pub fn scanned(record: FileRecord, kind: EventKind, side: Side, initial_scan: bool) -> Self {
        Self {
            path: record.path.clone(),
            kind,
            snapshot: Some(record),
            timestamp: Utc::now(),
            side,
            initial_scan,
        }
    }

    /// Whether the event is a rename landing on a transient editor artifact
    /// (new name ends with `~`). Such renames are treated as complete
    /// no-ops: the artifact is not propagated and the pre-rename path is
    /// not deleted from the destination.
    pub fn is_transient_rename(&self) -> bool {
        matches!(self.kind, EventKind::Renamed { .. }) && ends_with_tilde(&self.path)
    }
}

/// Whether a path's file name ends with the transient-edit suffix `~`.
pub fn ends_with_tilde(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with('~'))
        .unwrap_or(false)
}
