//! Configuration module for dirmirror.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! file, with loading, validation, and defaults. The configuration is built
//! once at startup and passed into every component; there is no ambient
//! mutable state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::event::SyncRole;
use crate::history::HistoryVersionFormat;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for dirmirror.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The watched source tree both roles read from.
    pub source_root: PathBuf,
    pub mirror: MirrorConfig,
    pub history: HistoryConfig,
    pub compare: CompareConfig,
    pub cache: CacheConfig,
    pub resilience: ResilienceConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

/// Per-role inclusion/exclusion rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleFilterConfig {
    /// Watched extensions (lowercase, no dot). Empty means "all".
    pub extensions: Vec<String>,
    /// Excluded extension patterns: a literal suffix (`bak`) or a
    /// prefix-wildcard of the form `*suffix` (`*~`, `*.tmp`).
    pub excluded_extensions: Vec<String>,
    /// Root-relative path prefixes to ignore.
    pub ignore_starts_with: Vec<String>,
    /// Root-relative path substrings to ignore.
    pub ignore_contains: Vec<String>,
    /// Root-relative path suffixes to ignore.
    pub ignore_ends_with: Vec<String>,
}

/// Mirror role settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Whether the mirror role is active.
    pub enabled: bool,
    /// Destination tree the source is mirrored into.
    pub dest_root: PathBuf,
    /// Also mirror destination changes back to the source.
    pub bidirectional: bool,
    /// Inclusion/exclusion rules for this role.
    #[serde(flatten)]
    pub filter: RoleFilterConfig,
    /// Minimum free bytes that must remain on the destination volume after
    /// a write. Zero disables the check.
    pub min_free_space_bytes: u64,
    /// Sleep after each completed write, to throttle write rate. Zero
    /// disables throttling.
    pub copy_delay_ms: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dest_root: PathBuf::new(),
            bidirectional: false,
            filter: RoleFilterConfig::default(),
            min_free_space_bytes: 0,
            copy_delay_ms: 0,
        }
    }
}

/// History role settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Whether the history role is active.
    pub enabled: bool,
    /// Root of the timestamp-versioned archive.
    pub dest_root: PathBuf,
    /// Where the version stamp is placed in the file name.
    pub version_format: HistoryVersionFormat,
    /// Separator between the name and the version stamp.
    pub separator: String,
    /// Inclusion/exclusion rules for this role.
    #[serde(flatten)]
    pub filter: RoleFilterConfig,
    /// Minimum free bytes on the history volume. Zero disables the check.
    pub min_free_space_bytes: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dest_root: PathBuf::new(),
            version_format: HistoryVersionFormat::default(),
            separator: ".".to_string(),
            filter: RoleFilterConfig::default(),
            min_free_space_bytes: 0,
        }
    }
}

/// Staleness comparison toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareConfig {
    /// Compare source/counterpart last-write times.
    pub by_date: bool,
    /// Fall back to size comparison when content comparison is off.
    pub by_size: bool,
    /// Byte-for-byte comparison before any write.
    pub by_content: bool,
    /// Files larger than this are skipped outright. Zero means unlimited.
    pub max_file_size_bytes: u64,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            by_date: true,
            by_size: true,
            by_content: true,
            max_file_size_bytes: 0,
        }
    }
}

/// Metadata cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep destination/history metadata in memory.
    pub in_memory: bool,
    /// Persist one cache file per watched directory.
    pub persistent: bool,
    /// Name of the per-directory cache file.
    pub file_name: String,
    /// Reserved: compress persisted cache records.
    pub compress: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            in_memory: true,
            persistent: false,
            file_name: ".dirmirror-cache".to_string(),
            compress: false,
        }
    }
}

/// Timeout and retry budgets for filesystem operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Retries after the first attempt for transient/timeout failures.
    pub retry_count: u32,
    /// Fixed backoff between retries.
    pub retry_backoff_ms: u64,
    /// Timeout budget for single-file stat operations. Zero = no timeout.
    pub stat_timeout_ms: u64,
    /// Timeout budget for directory listings. Zero = no timeout.
    pub list_timeout_ms: u64,
    /// Timeout budget for content reads. Zero = no timeout.
    pub read_timeout_ms: u64,
    /// Timeout budget for writes/renames/deletes. Zero = no timeout.
    pub write_timeout_ms: u64,
    /// Grace period before a "still running" notice is emitted.
    pub long_running_notice_ms: u64,
    /// Suppress long-running and settled notices entirely.
    pub suppress_notices: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_backoff_ms: 1000,
            stat_timeout_ms: 10_000,
            list_timeout_ms: 30_000,
            read_timeout_ms: 120_000,
            write_timeout_ms: 120_000,
            long_running_notice_ms: 10_000,
            suppress_notices: false,
        }
    }
}

/// Engine scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global cap on end-to-end synchronizations in flight. Two lets one
    /// write finish while the next read starts.
    pub max_concurrent_syncs: usize,
    /// Seconds between periodic reconciliation scans. Zero disables them
    /// (the initial scan still runs).
    pub scan_interval_secs: u64,
    /// Quiet window before a watcher event is considered settled.
    pub debounce_ms: u64,
    /// Never synthesize Removed events from source absence; the previous
    /// snapshot is updated in place instead of replaced.
    pub ignore_source_deletions: bool,
    /// Descend into symlinked directories during scans.
    pub follow_symlinked_dirs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_syncs: 2,
            scan_interval_secs: 300,
            debounce_ms: 500,
            ignore_source_deletions: false,
            follow_symlinked_dirs: false,
        }
    }
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Optional log file path; stderr when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/dirmirror/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("dirmirror")
            .join("config.yaml")
    }

    /// The filter rules for a role.
    pub fn role_filter(&self, role: SyncRole) -> &RoleFilterConfig {
        match role {
            SyncRole::Mirror => &self.mirror.filter,
            SyncRole::History => &self.history.filter,
        }
    }

    /// Whether a role is enabled at all.
    pub fn role_enabled(&self, role: SyncRole) -> bool {
        match role {
            SyncRole::Mirror => self.mirror.enabled,
            SyncRole::History => self.history.enabled,
        }
    }

    /// Reject option combinations the engine cannot honor.
    ///
    /// Catches at startup what would otherwise surface mid-flight as
    /// `SyncError::ConfigInconsistent` for individual files.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.mirror.enabled && !self.history.enabled {
            anyhow::bail!("neither mirror nor history is enabled; nothing to do");
        }
        if self.source_root.as_os_str().is_empty() {
            anyhow::bail!("source_root is not set");
        }
        if self.mirror.enabled {
            if self.mirror.dest_root.as_os_str().is_empty() {
                anyhow::bail!("mirror is enabled but mirror.dest_root is not set");
            }
            if self.mirror.dest_root == self.source_root {
                anyhow::bail!("mirror.dest_root must differ from source_root");
            }
        }
        if self.history.enabled && self.history.dest_root.as_os_str().is_empty() {
            anyhow::bail!("history is enabled but history.dest_root is not set");
        }
        if self.mirror.bidirectional && !self.mirror.enabled {
            anyhow::bail!("mirror.bidirectional requires mirror.enabled");
        }
        if !self.compare.by_date && !self.compare.by_size && !self.compare.by_content {
            // With every comparison disabled the decision engine has no
            // decider left for any file.
            anyhow::bail!(
                "compare.by_date, compare.by_size and compare.by_content are all disabled; \
                 at least one comparison must remain"
            );
        }
        if self.engine.max_concurrent_syncs == 0 {
            anyhow::bail!("engine.max_concurrent_syncs must be at least 1");
        }
        if self.cache.file_name.is_empty() {
            anyhow::bail!("cache.file_name must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            source_root: PathBuf::from("/src"),
            mirror: MirrorConfig {
                dest_root: PathBuf::from("/dest"),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_mirror_only() {
        let config = Config::default();
        assert!(config.mirror.enabled);
        assert!(!config.history.enabled);
        assert!(!config.mirror.bidirectional);
    }

    #[test]
    fn test_default_compare_all_enabled() {
        let compare = CompareConfig::default();
        assert!(compare.by_date);
        assert!(compare.by_size);
        assert!(compare.by_content);
        assert_eq!(compare.max_file_size_bytes, 0);
    }

    #[test]
    fn test_default_concurrency_is_two() {
        assert_eq!(EngineConfig::default().max_concurrent_syncs, 2);
    }

    #[test]
    fn test_validate_accepts_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_source() {
        let mut config = valid_config();
        config.source_root = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_mirror_into_source() {
        let mut config = valid_config();
        config.mirror.dest_root = config.source_root.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_all_roles_disabled() {
        let mut config = valid_config();
        config.mirror.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_all_comparisons_disabled() {
        let mut config = valid_config();
        config.compare.by_date = false;
        config.compare.by_size = false;
        config.compare.by_content = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_history_without_root() {
        let mut config = valid_config();
        config.history.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = valid_config();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.source_root, config.source_root);
        assert_eq!(back.mirror.dest_root, config.mirror.dest_root);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "source_root: /data/src\nmirror:\n  dest_root: /data/dest\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.source_root, PathBuf::from("/data/src"));
        assert!(config.mirror.enabled);
        assert_eq!(config.resilience.retry_count, 3);
        assert_eq!(config.engine.max_concurrent_syncs, 2);
    }

    #[test]
    fn test_filter_yaml_flattened_into_role() {
        let yaml = r#"
source_root: /src
mirror:
  dest_root: /dest
  extensions: ["log", "txt"]
  excluded_extensions: ["*~"]
  ignore_contains: ["node_modules"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mirror.filter.extensions, vec!["log", "txt"]);
        assert_eq!(config.mirror.filter.excluded_extensions, vec!["*~"]);
        assert_eq!(config.mirror.filter.ignore_contains, vec!["node_modules"]);
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert!(config.mirror.enabled);
    }
}
