//! Event classification and filtering
//!
//! One raw [`FileEvent`] becomes up to two [`SyncContext`]s, one per enabled
//! role whose filter rules the path passes. The mirror counterpart is the
//! same relative path under the mirror destination root; the history
//! counterpart is a timestamp-versioned path that is unique per event, which
//! is what makes the history archive append-only.
//!
//! ## Filtering
//!
//! A path qualifies for a role when its extension is in the role's watched
//! set (an empty set watches everything), it matches no excluded-extension
//! pattern (`log` excludes `*.log`, `*~` excludes any name ending in `~`),
//! and its root-relative path matches no starts-with / contains / ends-with
//! ignore rule. All ignore rules across both roles are compiled into a
//! single [`aho_corasick::AhoCorasick`] automaton at startup; a raw hit is
//! then confirmed against the rule's kind and owning role, so exclusion
//! stays sub-linear in pattern count.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dirmirror_core::config::{Config, RoleFilterConfig};
use dirmirror_core::domain::context::{RefreshFlag, SyncContext};
use dirmirror_core::domain::event::{FileEvent, Side, SyncRole};
use dirmirror_core::domain::record::FileRecord;
use dirmirror_core::history;

// ============================================================================
// Ignore rules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IgnoreKind {
    StartsWith,
    Contains,
    EndsWith,
}

/// One compiled ignore rule; index-aligned with the automaton's patterns.
#[derive(Debug, Clone)]
struct IgnoreRule {
    kind: IgnoreKind,
    role: SyncRole,
    pattern_len: usize,
}

/// All ignore rules of both roles behind one multi-pattern automaton
struct IgnoreSet {
    automaton: Option<AhoCorasick>,
    rules: Vec<IgnoreRule>,
}

impl IgnoreSet {
    fn build(config: &Config) -> anyhow::Result<Self> {
        let mut patterns: Vec<String> = Vec::new();
        let mut rules = Vec::new();

        for role in [SyncRole::Mirror, SyncRole::History] {
            let filter = config.role_filter(role);
            let groups = [
                (IgnoreKind::StartsWith, &filter.ignore_starts_with),
                (IgnoreKind::Contains, &filter.ignore_contains),
                (IgnoreKind::EndsWith, &filter.ignore_ends_with),
            ];
            for (kind, group) in groups {
                for pattern in group {
                    if pattern.is_empty() {
                        continue;
                    }
                    rules.push(IgnoreRule {
                        kind,
                        role,
                        pattern_len: pattern.len(),
                    });
                    patterns.push(pattern.clone());
                }
            }
        }

        let automaton = if patterns.is_empty() {
            None
        } else {
            Some(AhoCorasick::new(&patterns)?)
        };
        Ok(Self { automaton, rules })
    }

    /// Whether `relative` matches any ignore rule for `role`. A raw
    /// automaton hit is confirmed against the rule kind: starts-with rules
    /// must match at offset zero, ends-with rules at the end.
    fn is_ignored(&self, relative: &str, role: SyncRole) -> bool {
        let Some(automaton) = &self.automaton else {
            return false;
        };

        for hit in automaton.find_overlapping_iter(relative) {
            let rule = &self.rules[hit.pattern().as_usize()];
            if rule.role != role {
                continue;
            }
            let confirmed = match rule.kind {
                IgnoreKind::StartsWith => hit.start() == 0,
                IgnoreKind::Contains => true,
                IgnoreKind::EndsWith => hit.end() == relative.len(),
            };
            // Sanity: the automaton reports full pattern matches only.
            debug_assert_eq!(hit.end() - hit.start(), rule.pattern_len);
            if confirmed {
                return true;
            }
        }
        false
    }

    /// Whether a directory subtree can be pruned for every role: each
    /// enabled role must ignore it, otherwise some role still needs it.
    fn dir_prunable(&self, relative: &str, enabled_roles: &[SyncRole]) -> bool {
        !enabled_roles.is_empty()
            && enabled_roles
                .iter()
                .all(|role| self.is_ignored(relative, *role))
    }
}

// ============================================================================
// Extension rules
// ============================================================================

/// Whether a file name passes a role's extension rules.
fn extension_qualifies(file_name: &str, filter: &RoleFilterConfig) -> bool {
    let ext = file_name
        .rsplit_once('.')
        .map(|(stem, ext)| if stem.is_empty() { "" } else { ext })
        .unwrap_or("");

    if !filter.extensions.is_empty()
        && !filter
            .extensions
            .iter()
            .any(|want| ext.eq_ignore_ascii_case(want.trim_start_matches('.')))
    {
        return false;
    }

    for pattern in &filter.excluded_extensions {
        let excluded = match pattern.strip_prefix('*') {
            // "*suffix": any file name ending with the suffix.
            Some(suffix) => file_name.ends_with(suffix),
            None => ext.eq_ignore_ascii_case(pattern.trim_start_matches('.')),
        };
        if excluded {
            return false;
        }
    }
    true
}

// ============================================================================
// EventClassifier
// ============================================================================

/// Turns raw events into role-bound synchronization contexts
pub struct EventClassifier {
    config: Arc<Config>,
    ignores: IgnoreSet,
    enabled_roles: Vec<SyncRole>,
    /// The hidden cache file name; its events are never synchronized.
    cache_file_name: String,
}

impl EventClassifier {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let ignores = IgnoreSet::build(&config)?;
        let enabled_roles = [SyncRole::Mirror, SyncRole::History]
            .into_iter()
            .filter(|role| config.role_enabled(*role))
            .collect();
        let cache_file_name = config.cache.file_name.clone();
        Ok(Self {
            config,
            ignores,
            enabled_roles,
            cache_file_name,
        })
    }

    /// Classifies one event into its mirror and history contexts. Either
    /// slot is `None` when the role is disabled or the path does not
    /// qualify; both are `None` for transient editor artifacts.
    pub fn classify(
        &self,
        event: &FileEvent,
        token: &CancellationToken,
    ) -> (Option<SyncContext>, Option<SyncContext>) {
        if event.is_transient_rename() {
            debug!(path = %event.path.display(), "transient rename artifact, ignoring");
            return (None, None);
        }
        if self.is_internal_file(&event.path) {
            return (None, None);
        }

        let Some((relative, _)) = self.relative_to_root(&event.path, event.side) else {
            warn!(path = %event.path.display(), "event path lies outside the watched trees");
            return (None, None);
        };
        let relative_str = relative.to_string_lossy().into_owned();
        let Some(file_name) = event.path.file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            return (None, None);
        };

        let refreshed = RefreshFlag::new();
        let mirror = self
            .qualifies(&relative_str, &file_name, SyncRole::Mirror)
            .then(|| self.mirror_counterpart(&relative, event.side))
            .map(|counterpart| {
                SyncContext::new(
                    event.clone(),
                    SyncRole::Mirror,
                    counterpart,
                    token.clone(),
                    refreshed.clone(),
                )
            });

        // History only archives the authoritative tree.
        let history = (event.side == Side::Source
            && self.qualifies(&relative_str, &file_name, SyncRole::History))
        .then(|| self.history_counterpart(&relative, event))
        .flatten()
        .map(|counterpart| {
            SyncContext::new(
                event.clone(),
                SyncRole::History,
                counterpart,
                token.clone(),
                refreshed,
            )
        });

        (mirror, history)
    }

    /// Whether a directory subtree can be skipped entirely during scans.
    pub fn dir_ignored(&self, root: &Path, dir: &Path) -> bool {
        let Ok(relative) = dir.strip_prefix(root) else {
            return false;
        };
        if relative.as_os_str().is_empty() {
            return false;
        }
        self.ignores
            .dir_prunable(&relative.to_string_lossy(), &self.enabled_roles)
    }

    /// The counterpart path the mirror role would use for `path`, if the
    /// path lies inside a watched tree. Used for rename cleanup.
    pub fn mirror_counterpart_for(&self, path: &Path, side: Side) -> Option<PathBuf> {
        let (relative, _) = self.relative_to_root(path, side)?;
        Some(self.mirror_counterpart(&relative, side))
    }

    /// Whether this path is one of the daemon's own bookkeeping files.
    pub fn is_internal_file(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        name == self.cache_file_name.as_str() || name.strip_suffix(".tmp").is_some_and(|stem| stem == self.cache_file_name)
    }

    fn qualifies(&self, relative: &str, file_name: &str, role: SyncRole) -> bool {
        if !self.config.role_enabled(role) {
            return false;
        }
        if !extension_qualifies(file_name, self.config.role_filter(role)) {
            return false;
        }
        !self.ignores.is_ignored(relative, role)
    }

    /// Root-relative path plus the root it was relative to.
    fn relative_to_root(&self, path: &Path, side: Side) -> Option<(PathBuf, PathBuf)> {
        let root = match side {
            Side::Source => &self.config.source_root,
            Side::Destination => &self.config.mirror.dest_root,
        };
        path.strip_prefix(root)
            .ok()
            .map(|rel| (rel.to_path_buf(), root.clone()))
    }

    fn mirror_counterpart(&self, relative: &Path, side: Side) -> PathBuf {
        match side {
            Side::Source => self.config.mirror.dest_root.join(relative),
            // Bidirectional: a destination change flows back to the source.
            Side::Destination => self.config.source_root.join(relative),
        }
    }

    /// The versioned history path for this event. The stamp comes from the
    /// snapshot's write time when the producer had one, otherwise from the
    /// observation time.
    fn history_counterpart(&self, relative: &Path, event: &FileEvent) -> Option<PathBuf> {
        let stamp_time = event
            .snapshot
            .as_ref()
            .and_then(|rec: &FileRecord| rec.modified)
            .unwrap_or(event.timestamp);

        match history::version_path(
            &self.config.history.dest_root,
            relative,
            self.config.history.version_format,
            &self.config.history.separator,
            stamp_time,
        ) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(path = %event.path.display(), error = %err, "cannot derive history path");
                None
            }
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================
