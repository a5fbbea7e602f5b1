//! History filename versioning
//!
//! Every history write lands under a unique, timestamp-derived name so the
//! archive is append-only. Three placement schemes are supported, selected
//! in configuration together with a separator string.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::SyncError;

/// Timestamp rendering used in versioned names: sortable and free of
/// characters that are illegal in file names on any supported platform.
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// Where the version timestamp is placed in the file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryVersionFormat {
    /// `T<sep>report.txt`
    PrefixTimestamp,
    /// `report<sep>T.txt`; files without an extension fall back to suffix placement
    TimestampBeforeExt,
    /// `report.txt<sep>T`
    #[serde(alias = "SUFIX_TIMESTAMP")]
    SuffixTimestamp,
}

impl Default for HistoryVersionFormat {
    fn default() -> Self {
        HistoryVersionFormat::TimestampBeforeExt
    }
}

/// Renders the version stamp for a write time.
pub fn version_stamp(modified: DateTime<Utc>) -> String {
    modified.format(TIMESTAMP_FORMAT).to_string()
}

/// Builds the versioned file name for one history write.
///
/// `stamp` is typically [`version_stamp`] of the source file's write time,
/// but tests and callers may supply any token.
pub fn version_file_name(
    name: &str,
    format: HistoryVersionFormat,
    separator: &str,
    stamp: &str,
) -> Result<String, SyncError> {
    if name.is_empty() {
        return Err(SyncError::ConfigInconsistent(
            "history versioning given an empty file name".to_string(),
        ));
    }

    Ok(match format {
        HistoryVersionFormat::PrefixTimestamp => format!("{stamp}{separator}{name}"),
        HistoryVersionFormat::SuffixTimestamp => format!("{name}{separator}{stamp}"),
        HistoryVersionFormat::TimestampBeforeExt => match name.rfind('.') {
            // ".bashrc"-style names have no extension to split on.
            Some(dot) if dot > 0 => {
                let (base, ext) = name.split_at(dot);
                format!("{base}{separator}{stamp}{ext}")
            }
            _ => format!("{name}{separator}{stamp}"),
        },
    })
}

/// Maps a source file path to its versioned path under the history root.
///
/// `relative` is the path of the source file relative to the watched source
/// root; the directory part is preserved so `a/report.txt` versions under
/// `<history_root>/a/`.
pub fn version_path(
    history_root: &Path,
    relative: &Path,
    format: HistoryVersionFormat,
    separator: &str,
    modified: DateTime<Utc>,
) -> Result<PathBuf, SyncError> {
    let name = relative
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            SyncError::ConfigInconsistent(format!(
                "history versioning given a path with no file name: {}",
                relative.display()
            ))
        })?;

    let versioned = version_file_name(&name, format, separator, &version_stamp(modified))?;

    let mut out = history_root.to_path_buf();
    if let Some(parent) = relative.parent() {
        out.push(parent);
    }
    out.push(versioned);
    Ok(out)
}
