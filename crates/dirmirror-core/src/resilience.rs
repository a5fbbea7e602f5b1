//! Resilience wrapper for filesystem operations
//!
//! Everything that touches disk funnels through [`Resilience`]: an optional
//! per-class timeout raced against the operation and the shutdown signal, a
//! "still running" notice once a grace period elapses (with a matching
//! settled notice), and a bounded fixed-backoff retry loop for failures the
//! error taxonomy classifies as transient.
//!
//! Directory listings get one extra rule: an *empty* listing is retried too,
//! because some network filesystems transiently return nothing for a
//! directory that does have entries. After exhaustion an empty listing is
//! accepted as genuinely empty — nothing is silently dropped.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ResilienceConfig;
use crate::domain::errors::{OpClass, SyncError, TransientKind};
use crate::domain::record::FileRecord;

/// Executes filesystem work with timeouts, notices, and bounded retries
#[derive(Clone)]
pub struct Resilience {
    config: ResilienceConfig,
    token: CancellationToken,
}

impl Resilience {
    /// Wraps operations with the given budgets, observing `token` at every
    /// suspension point.
    pub fn new(config: ResilienceConfig, token: CancellationToken) -> Self {
        Self { config, token }
    }

    /// The configured timeout budget for an operation class, if any.
    fn timeout_for(&self, class: OpClass) -> Option<Duration> {
        let ms = match class {
            OpClass::Stat => self.config.stat_timeout_ms,
            OpClass::List => self.config.list_timeout_ms,
            OpClass::Read => self.config.read_timeout_ms,
            OpClass::Write => self.config.write_timeout_ms,
        };
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    /// Runs one operation against its class timeout and the shutdown
    /// signal, emitting long-running and settled notices unless suppressed.
    pub async fn run<T>(
        &self,
        class: OpClass,
        path: &Path,
        fut: impl Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        let budget = self.timeout_for(class);
        let notices = !self.config.suppress_notices;
        let grace = Duration::from_millis(self.config.long_running_notice_ms.max(1));

        let timeout = async {
            match budget {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        let notice_timer = tokio::time::sleep(grace);

        tokio::pin!(fut);
        tokio::pin!(timeout);
        tokio::pin!(notice_timer);

        let mut noticed = false;
        loop {
            tokio::select! {
                result = &mut fut => {
                    if noticed && notices {
                        match &result {
                            Ok(_) => debug!(%class, path = %path.display(), "long-running operation finished"),
                            Err(err) => warn!(%class, path = %path.display(), error = %err, "long-running operation failed"),
                        }
                    }
                    return result;
                }
                _ = &mut timeout => {
                    if noticed && notices {
                        warn!(%class, path = %path.display(), "long-running operation timed out");
                    }
                    return Err(SyncError::Timeout { class, path: path.to_path_buf() });
                }
                _ = self.token.cancelled() => {
                    if noticed && notices {
                        debug!(%class, path = %path.display(), "long-running operation canceled");
                    }
                    return Err(SyncError::Cancelled);
                }
                _ = &mut notice_timer, if !noticed && notices => {
                    warn!(%class, path = %path.display(), "operation still running");
                    noticed = true;
                }
            }
        }
    }

    /// Runs an operation through [`run`](Self::run) with an outer retry
    /// loop: transient and timeout failures are retried up to the
    /// configured count with a fixed backoff. The last typed error is
    /// surfaced on exhaustion.
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        class: OpClass,
        path: &Path,
        make: F,
    ) -> Result<T, SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);

        let mut attempt = 0;
        loop {
            match self.run(class, path, make()).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(%class, path = %path.display(), attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.config.retry_count => {
                    attempt += 1;
                    warn!(
                        %class,
                        path = %path.display(),
                        attempt,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.token.cancelled() => return Err(SyncError::Cancelled),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Resilient single-path stat. An absent path is an answer, not an
    /// error: the returned record has `exists == Some(false)`.
    pub async fn stat(&self, path: &Path) -> Result<FileRecord, SyncError> {
        let target = path.to_path_buf();
        self.run_with_retry(OpClass::Stat, path, || {
            let target = target.clone();
            async move {
                match tokio::fs::symlink_metadata(&target).await {
                    Ok(meta) => Ok(FileRecord::from_metadata(&target, &meta)),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        Ok(FileRecord::missing(&target))
                    }
                    Err(err) => Err(SyncError::Io(err)),
                }
            }
        })
        .await
    }

    /// Resilient one-level directory listing, returning a record per entry.
    ///
    /// Empty results are retried like transient failures; once retries are
    /// exhausted the empty listing is returned as-is.
    pub async fn list_dir(&self, dir: &Path) -> Result<Vec<FileRecord>, SyncError> {
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);

        let mut attempt = 0;
        loop {
            let listing = self
                .run_with_retry(OpClass::List, dir, || async {
                    read_dir_records(dir).await
                })
                .await?;

            if !listing.is_empty() || attempt >= self.config.retry_count {
                return Ok(listing);
            }

            attempt += 1;
            debug!(
                dir = %dir.display(),
                attempt,
                "directory listing came back empty, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.token.cancelled() => return Err(SyncError::Cancelled),
            }
        }
    }

    /// Resilient whole-file read.
    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>, SyncError> {
        let target = path.to_path_buf();
        self.run_with_retry(OpClass::Read, path, || {
            let target = target.clone();
            async move {
                tokio::fs::read(&target)
                    .await
                    .map_err(|err| SyncError::from_io(err, &target))
            }
        })
        .await
    }
}

/// Lists one directory level into `FileRecord`s.
async fn read_dir_records(dir: &Path) -> Result<Vec<FileRecord>, SyncError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| SyncError::from_io(err, dir))?;

    let mut records = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| SyncError::from_io(err, dir))?
    {
        let path = entry.path();
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => records.push(FileRecord::from_metadata(&path, &meta)),
            // An entry deleted while listing is a benign race, not a
            // listing failure.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(SyncError::Io(err)),
        }
    }
    Ok(records)
}
