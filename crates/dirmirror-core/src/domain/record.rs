//! Last-known file metadata
//!
//! [`FileRecord`] is the unit the metadata cache stores, the scan snapshots
//! hold, and the decision engine compares. A record may describe a file
//! whose existence is simply unknown (never statted yet), so `exists` and
//! `length` are optional rather than defaulted.

use std::fs::Metadata;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attribute bits the engine cares about
///
/// Directory-ness must be checked before `length`/`exists` are trusted for
/// file semantics; symlinked directories are skipped by the scanner unless
/// explicitly allowed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    /// The path names a directory
    pub directory: bool,
    /// The path is a symlink / reparse point
    pub symlink: bool,
}

/// Last-known metadata for one path
///
/// `length` is meaningful only when `exists == Some(true)`. The path may be
/// stored directory-relative in the persisted cache so records survive a
/// directory move; in-memory records always carry the full path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Whether the file existed at observation time; `None` = never statted
    pub exists: Option<bool>,
    /// File length in bytes; `None` when unknown or nonexistent
    pub length: Option<u64>,
    /// Creation time (UTC), when the platform reports one
    pub created: Option<DateTime<Utc>>,
    /// Last write time (UTC)
    pub modified: Option<DateTime<Utc>>,
    /// Full path (or relative path in the persisted form)
    pub path: PathBuf,
    /// Attribute bits
    pub attributes: FileAttributes,
}

impl FileRecord {
    /// A record for a path whose state has never been observed.
    pub fn unknown(path: impl Into<PathBuf>) -> Self {
        Self {
            exists: None,
            length: None,
            created: None,
            modified: None,
            path: path.into(),
            attributes: FileAttributes::default(),
        }
    }

    /// A record for a path observed to be absent.
    pub fn missing(path: impl Into<PathBuf>) -> Self {
        Self {
            exists: Some(false),
            length: None,
            created: None,
            modified: None,
            path: path.into(),
            attributes: FileAttributes::default(),
        }
    }

    /// Build a record from a fresh `std::fs::Metadata` stat result.
    pub fn from_metadata(path: impl Into<PathBuf>, meta: &Metadata) -> Self {
        let created = meta.created().ok().map(DateTime::<Utc>::from);
        let modified = meta.modified().ok().map(DateTime::<Utc>::from);
        let is_dir = meta.is_dir();
        Self {
            exists: Some(true),
            length: if is_dir { None } else { Some(meta.len()) },
            created,
            modified,
            path: path.into(),
            attributes: FileAttributes {
                directory: is_dir,
                symlink: meta.file_type().is_symlink(),
            },
        }
    }

    /// Whether the record describes an existing regular file.
    pub fn is_existing_file(&self) -> bool {
        self.exists == Some(true) && !self.attributes.directory
    }

    /// Whether the record describes an existing directory.
    pub fn is_directory(&self) -> bool {
        self.exists == Some(true) && self.attributes.directory
    }

    /// Length, defaulting to zero when unknown. Only meaningful for files.
    pub fn length_or_zero(&self) -> u64 {
        self.length.unwrap_or(0)
    }

    /// Whether `self` looks changed relative to an older observation.
    ///
    /// Scan diffing compares by length + write time; creation time and
    /// attribute bits are ignored because editors routinely preserve them.
    pub fn differs_from(&self, previous: &FileRecord) -> bool {
        self.length != previous.length || self.modified != previous.modified
    }

    /// Copy of this record with `path` replaced, used when persisting
    /// directory-relative and rehydrating to full paths.
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        let mut rec = self.clone();
        rec.path = path.into();
        rec
    }

    /// Case-normalized cache/lock key for a path.
    ///
    /// On case-insensitive platforms the key is lowercased so `Report.TXT`
    /// and `report.txt` share one lock and one cache slot; on Linux the
    /// path string is used verbatim.
    pub fn normalize_key(path: &Path) -> String {
        let raw = path.to_string_lossy();
        if cfg!(any(target_os = "windows", target_os = "macos")) {
            raw.to_lowercase()
        } else {
            raw.into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_record_has_no_state() {
        let rec = FileRecord::unknown("/a.txt");
        assert_eq!(rec.exists, None);
        assert_eq!(rec.length, None);
        assert!(!rec.is_existing_file());
    }

    #[test]
    fn test_missing_record() {
        let rec = FileRecord::missing("/a.txt");
        assert_eq!(rec.exists, Some(false));
        assert!(!rec.is_existing_file());
        assert!(!rec.is_directory());
    }

    #[test]
    fn test_from_metadata_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello").unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        let rec = FileRecord::from_metadata(&path, &meta);

        assert!(rec.is_existing_file());
        assert_eq!(rec.length, Some(5));
        assert!(rec.modified.is_some());
        assert!(!rec.attributes.directory);
    }

    #[test]
    fn test_from_metadata_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let meta = std::fs::metadata(dir.path()).unwrap();
        let rec = FileRecord::from_metadata(dir.path(), &meta);

        assert!(rec.is_directory());
        assert_eq!(rec.length, None);
    }

    #[test]
    fn test_differs_from_length_change() {
        let mut a = FileRecord::missing("/a");
        a.exists = Some(true);
        a.length = Some(10);
        let mut b = a.clone();
        assert!(!b.differs_from(&a));
        b.length = Some(11);
        assert!(b.differs_from(&a));
    }

    #[test]
    fn test_differs_from_time_change() {
        let mut a = FileRecord::missing("/a");
        a.exists = Some(true);
        a.modified = Some(Utc::now());
        let mut b = a.clone();
        b.modified = a.modified.map(|t| t + chrono::Duration::seconds(1));
        assert!(b.differs_from(&a));
    }

    #[test]
    fn test_with_path_replaces_only_path() {
        let mut rec = FileRecord::missing("/dir/a.txt");
        rec.length = Some(7);
        let rel = rec.with_path("a.txt");
        assert_eq!(rel.path, PathBuf::from("a.txt"));
        assert_eq!(rel.length, Some(7));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_normalize_key_verbatim_on_linux() {
        let key = FileRecord::normalize_key(Path::new("/Data/Report.TXT"));
        assert_eq!(key, "/Data/Report.TXT");
    }

    #[test]
    fn test_serde_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"x").unwrap();
        let rec = FileRecord::from_metadata(&path, &std::fs::metadata(&path).unwrap());

        let json = serde_json::to_string(&rec).unwrap();
        let back: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
