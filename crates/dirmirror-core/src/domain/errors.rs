//! Synchronization error taxonomy
//!
//! Every failure the engine can encounter is classified here, so the retry
//! loop in `dirmirror-sync` can inspect a typed value instead of matching on
//! exception subtypes or error strings.
//!
//! ## Classification
//!
//! | Variant | Meaning | Handling |
//! |---|---|---|
//! | `Transient` | locked file, share violation, empty listing | retried with fixed backoff |
//! | `Timeout` | operation exceeded its class budget | retried, reported distinctly from cancellation |
//! | `Cancelled` | process shutdown observed | propagated silently, never logged as error |
//! | `NotFoundMidFlight` | file vanished between notification and processing | benign no-op |
//! | `ConfigInconsistent` | programming/config error for one operation | fatal for that operation, never swallowed |
//! | `CacheCorrupt` | persisted cache unreadable | treated as cache-absent upstream |
//! | `InsufficientSpace` | destination volume below the configured floor | file skipped, logged |

use std::io::ErrorKind;
use std::path::PathBuf;

use thiserror::Error;

/// Operation classes with independent timeout budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// Single-file metadata lookup
    Stat,
    /// One-level directory enumeration
    List,
    /// Reading file content
    Read,
    /// Writing, renaming, or deleting files
    Write,
}

impl std::fmt::Display for OpClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpClass::Stat => "stat",
            OpClass::List => "list",
            OpClass::Read => "read",
            OpClass::Write => "write",
        };
        write!(f, "{name}")
    }
}

/// Why a failure is considered transient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// The file is held open/locked by another process
    Locked,
    /// Access denied in a way that usually clears (share violation, AV scan)
    AccessDenied,
    /// A directory listing came back empty; some network filesystems do
    /// this transiently for freshly created or remounted directories
    EmptyListing,
    /// The path or volume is temporarily unavailable
    Unavailable,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransientKind::Locked => "locked",
            TransientKind::AccessDenied => "access denied",
            TransientKind::EmptyListing => "empty listing",
            TransientKind::Unavailable => "unavailable",
        };
        write!(f, "{name}")
    }
}

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// A failure expected to clear on its own; retried with backoff
    #[error("Transient failure ({kind}) on {path}")]
    Transient {
        /// Why the failure is considered transient
        kind: TransientKind,
        /// The path the operation was acting on
        path: PathBuf,
    },

    /// The operation exceeded its per-class timeout budget
    #[error("Operation timed out ({class}) on {path}")]
    Timeout {
        /// Which budget was exceeded
        class: OpClass,
        /// The path the operation was acting on
        path: PathBuf,
    },

    /// The process-wide shutdown signal was observed
    #[error("Operation cancelled by shutdown")]
    Cancelled,

    /// The file disappeared between the notification and processing
    #[error("File vanished mid-flight: {0}")]
    NotFoundMidFlight(PathBuf),

    /// An unexpected path or option combination reached the engine
    #[error("Configuration inconsistency: {0}")]
    ConfigInconsistent(String),

    /// A persisted directory cache file could not be deserialized
    #[error("Persisted cache unreadable: {0}")]
    CacheCorrupt(PathBuf),

    /// The destination volume is below the configured free-space floor
    #[error("Insufficient free space on destination volume for {path} ({required} bytes required)")]
    InsufficientSpace {
        /// The destination path that could not be written
        path: PathBuf,
        /// Payload size plus the configured floor
        required: u64,
    },

    /// Any other I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the retry loop should attempt this operation again.
    ///
    /// Transient and timeout failures are retryable. I/O errors are
    /// retryable when their kind is one the engine has seen clear on
    /// unreliable storage (locked files, just-created folders, saturated
    /// handles). Everything else is final for this operation.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transient { .. } | SyncError::Timeout { .. } => true,
            SyncError::Io(err) => matches!(
                err.kind(),
                ErrorKind::WouldBlock
                    | ErrorKind::PermissionDenied
                    | ErrorKind::Interrupted
                    | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Whether this failure means the target simply no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::NotFoundMidFlight(_) => true,
            SyncError::Io(err) => err.kind() == ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Classify a raw I/O error against a path, promoting not-found to the
    /// benign mid-flight variant.
    pub fn from_io(err: std::io::Error, path: &std::path::Path) -> Self {
        if err.kind() == ErrorKind::NotFound {
            SyncError::NotFoundMidFlight(path.to_path_buf())
        } else {
            SyncError::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        let err = SyncError::Transient {
            kind: TransientKind::Locked,
            path: PathBuf::from("/a.txt"),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = SyncError::Timeout {
            class: OpClass::Read,
            path: PathBuf::from("/a.txt"),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        assert!(!SyncError::Cancelled.is_transient());
    }

    #[test]
    fn test_not_found_is_not_retryable() {
        let err = SyncError::NotFoundMidFlight(PathBuf::from("/gone.txt"));
        assert!(!err.is_transient());
        assert!(err.is_not_found());
    }

    #[test]
    fn test_io_permission_denied_is_transient() {
        let io = std::io::Error::new(ErrorKind::PermissionDenied, "locked");
        assert!(SyncError::Io(io).is_transient());
    }

    #[test]
    fn test_io_not_found_promoted_mid_flight() {
        let io = std::io::Error::new(ErrorKind::NotFound, "gone");
        let err = SyncError::from_io(io, std::path::Path::new("/x"));
        assert!(matches!(err, SyncError::NotFoundMidFlight(_)));
    }

    #[test]
    fn test_config_inconsistent_is_fatal() {
        let err = SyncError::ConfigInconsistent("all comparisons disabled".into());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_display_includes_path() {
        let err = SyncError::Timeout {
            class: OpClass::List,
            path: PathBuf::from("/share/docs"),
        };
        let msg = err.to_string();
        assert!(msg.contains("list"));
        assert!(msg.contains("/share/docs"));
    }
}
