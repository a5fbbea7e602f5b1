//! Per-event, per-role synchronization contexts
//!
//! Classifying one raw [`FileEvent`](super::event::FileEvent) produces up to
//! two [`SyncContext`]s: one for the mirror role and one for the history
//! role. Both share a single "already refreshed" flag so the file behind
//! the event is re-statted at most once per event, no matter how many roles
//! consume it.
//!
//! A context lives for exactly one dispatch through the
//! classify → decide → execute pipeline and is never persisted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::event::{FileEvent, Side, SyncRole};
use super::record::FileRecord;

/// Flag shared between sibling contexts derived from one raw event
///
/// Replaces by-reference flag sharing with an explicitly shared,
/// reference-counted cell: cloning the handle shares the flag. The claimant
/// publishes the record it observed so the sibling can reuse it instead of
/// statting again.
#[derive(Debug, Clone, Default)]
pub struct RefreshFlag {
    claimed: Arc<AtomicBool>,
    record: Arc<StdMutex<Option<FileRecord>>>,
}

impl RefreshFlag {
    /// A fresh, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claims the refresh. Returns `true` for the first caller
    /// only; every later caller (including the sibling context) gets `false`.
    pub fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    /// Whether a refresh has already happened for this event.
    pub fn is_refreshed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Publishes the record the claimant observed.
    pub fn publish(&self, record: FileRecord) {
        *self.record.lock().expect("refresh slot poisoned") = Some(record);
    }

    /// The record published by the claimant, if it has finished statting.
    pub fn published(&self) -> Option<FileRecord> {
        self.record.lock().expect("refresh slot poisoned").clone()
    }
}

/// One filesystem event bound to one role and side
pub struct SyncContext {
    /// The raw or synthesized event being processed
    pub event: FileEvent,
    /// Mirror or history
    pub role: SyncRole,
    /// Whether `event.path` lies in the source tree
    pub is_src_path: bool,
    /// Counterpart path on the other side of this role (mirror destination
    /// path, or the versioned history path), computed at classification time
    pub counterpart_path: PathBuf,
    /// Shutdown signal observed at every suspension point
    pub token: CancellationToken,
    /// Lazily populated metadata for `event.path`
    own_record: Mutex<Option<FileRecord>>,
    /// Lazily populated metadata for `counterpart_path`
    counterpart_record: Mutex<Option<FileRecord>>,
    /// Shared with the sibling context of the same raw event
    refreshed: RefreshFlag,
}

impl SyncContext {
    /// Binds an event to a role. `refreshed` must be the same handle for
    /// both contexts derived from one raw event.
    pub fn new(
        event: FileEvent,
        role: SyncRole,
        counterpart_path: PathBuf,
        token: CancellationToken,
        refreshed: RefreshFlag,
    ) -> Self {
        let is_src_path = event.side == Side::Source;
        let own_record = Mutex::new(event.snapshot.clone());
        Self {
            event,
            role,
            is_src_path,
            counterpart_path,
            token,
            own_record,
            counterpart_record: Mutex::new(None),
            refreshed,
        }
    }

    /// The path the event concerns.
    pub fn path(&self) -> &Path {
        &self.event.path
    }

    /// Whether this context was produced by the initial scan pass.
    pub fn is_initial_scan(&self) -> bool {
        self.event.initial_scan
    }

    /// Whether this context serves the history role.
    pub fn for_history(&self) -> bool {
        self.role == SyncRole::History
    }

    /// The cached record for `event.path`, if one has been populated.
    pub async fn own_record(&self) -> Option<FileRecord> {
        self.own_record.lock().await.clone()
    }

    /// Stores a freshly observed record for `event.path`.
    pub async fn store_own_record(&self, record: FileRecord) {
        *self.own_record.lock().await = Some(record);
    }

    /// The cached record for the counterpart path, if populated.
    pub async fn counterpart_record(&self) -> Option<FileRecord> {
        self.counterpart_record.lock().await.clone()
    }

    /// Stores a freshly observed record for the counterpart path.
    pub async fn store_counterpart_record(&self, record: FileRecord) {
        *self.counterpart_record.lock().await = Some(record);
    }

    /// Claims the once-per-event refresh of `event.path`. Scan-sourced
    /// snapshots are known stale for length, so the first role to decide
    /// re-stats the file; the sibling reuses the stored record.
    pub fn claim_refresh(&self) -> bool {
        self.refreshed.claim()
    }

    /// Shared refresh flag handle (for constructing the sibling context).
    pub fn refresh_flag(&self) -> RefreshFlag {
        self.refreshed.clone()
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("path", &self.event.path)
            .field("role", &self.role)
            .field("is_src_path", &self.is_src_path)
            .field("counterpart_path", &self.counterpart_path)
            .field("initial_scan", &self.event.initial_scan)
            .finish_non_exhaustive()
    }
}
