//! Path-keyed lock queue
//!
//! Grants exclusive, reference-counted, cancellable locks keyed by
//! case-normalized path. The table entry for a key is removed only when its
//! waiter count reaches zero, so two callers can never hold *different*
//! lock objects for the same logical key, while entries for idle paths are
//! reclaimed.
//!
//! The queue also owns the global concurrency semaphore that caps
//! end-to-end synchronizations independent of which paths are involved.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::domain::errors::SyncError;
use crate::domain::record::FileRecord;

struct LockEntry {
    /// The per-key exclusive lock; awaiting it suspends without blocking.
    lock: Arc<AsyncMutex<()>>,
    /// Holders plus waiters. Mutated only under the table mutex.
    waiters: usize,
}

struct Inner {
    table: StdMutex<HashMap<String, LockEntry>>,
}

impl Inner {
    /// Registers interest in `key` and returns its shared lock.
    fn add_waiter(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock().expect("lock table poisoned");
        let entry = table.entry(key.to_string()).or_insert_with(|| LockEntry {
            lock: Arc::new(AsyncMutex::new(())),
            waiters: 0,
        });
        entry.waiters += 1;
        Arc::clone(&entry.lock)
    }

    /// Drops interest in `key`, removing the entry iff nobody else waits.
    fn remove_waiter(&self, key: &str) {
        let mut table = self.table.lock().expect("lock table poisoned");
        if let Some(entry) = table.get_mut(key) {
            entry.waiters -= 1;
            if entry.waiters == 0 {
                table.remove(key);
            }
        }
    }
}

/// Exclusive, reference-counted, cancellable locks keyed by normalized path
pub struct PathLockQueue {
    inner: Arc<Inner>,
    slots: Arc<Semaphore>,
}

impl PathLockQueue {
    /// Creates a queue whose global semaphore admits `max_concurrent`
    /// simultaneous end-to-end synchronizations.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: StdMutex::new(HashMap::new()),
            }),
            slots: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Acquires the exclusive lock for one path, racing cancellation.
    pub async fn acquire(
        &self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<PathLockGuard, SyncError> {
        let key = FileRecord::normalize_key(path);
        self.acquire_key(key, token).await
    }

    /// Acquires both paths' locks in deterministic key order, giving
    /// pairwise exclusion for "this path or its counterpart is being
    /// synchronized". Identical keys degenerate to a single lock.
    pub async fn acquire_pair(
        &self,
        a: &Path,
        b: &Path,
        token: &CancellationToken,
    ) -> Result<PairLockGuard, SyncError> {
        let mut key_a = FileRecord::normalize_key(a);
        let mut key_b = FileRecord::normalize_key(b);
        if key_a == key_b {
            let only = self.acquire_key(key_a, token).await?;
            return Ok(PairLockGuard {
                _first: only,
                _second: None,
            });
        }
        if key_b < key_a {
            std::mem::swap(&mut key_a, &mut key_b);
        }
        let first = self.acquire_key(key_a, token).await?;
        let second = self.acquire_key(key_b, token).await?;
        Ok(PairLockGuard {
            _first: first,
            _second: Some(second),
        })
    }

    /// Claims one global concurrency slot, racing cancellation.
    pub async fn acquire_slot(
        &self,
        token: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, SyncError> {
        tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| SyncError::Cancelled)
            }
            _ = token.cancelled() => Err(SyncError::Cancelled),
        }
    }

    /// Number of keys currently tracked. Zero once all guards are dropped.
    pub fn active_keys(&self) -> usize {
        self.inner.table.lock().expect("lock table poisoned").len()
    }

    async fn acquire_key(
        &self,
        key: String,
        token: &CancellationToken,
    ) -> Result<PathLockGuard, SyncError> {
        let lock = self.inner.add_waiter(&key);

        let guard = tokio::select! {
            guard = lock.lock_owned() => guard,
            _ = token.cancelled() => {
                // Abandon the wait without exception noise.
                self.inner.remove_waiter(&key);
                return Err(SyncError::Cancelled);
            }
        };

        Ok(PathLockGuard {
            guard: Some(guard),
            inner: Arc::clone(&self.inner),
            key,
        })
    }
}

/// Release handle for one key; dropping it releases the lock and reclaims
/// the table entry when uncontended.
pub struct PathLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    inner: Arc<Inner>,
    key: String,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        // Release the key's mutex before decrementing, so a zero waiter
        // count always means the entry is genuinely unused.
        drop(self.guard.take());
        self.inner.remove_waiter(&self.key);
    }
}

/// Release handle for a pairwise acquisition.
pub struct PairLockGuard {
    _first: PathLockGuard,
    _second: Option<PathLockGuard>,
}
