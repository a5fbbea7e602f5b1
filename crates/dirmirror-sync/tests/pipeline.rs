//! End-to-end pipeline tests: real directories, a real engine, and the
//! full classify → decide → execute path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use dirmirror_core::config::Config;
use dirmirror_core::domain::event::{EventKind, FileEvent, Side};
use dirmirror_core::history::HistoryVersionFormat;
use dirmirror_sync::MirrorEngine;

struct World {
    engine: Arc<MirrorEngine>,
    source: tempfile::TempDir,
    mirror: tempfile::TempDir,
    history: tempfile::TempDir,
}

fn world(mutate: impl FnOnce(&mut Config)) -> World {
    let source = tempfile::TempDir::new().unwrap();
    let mirror = tempfile::TempDir::new().unwrap();
    let history = tempfile::TempDir::new().unwrap();

    let mut config = Config::default();
    config.source_root = source.path().to_path_buf();
    config.mirror.enabled = true;
    config.mirror.dest_root = mirror.path().to_path_buf();
    config.history.enabled = false;
    config.history.dest_root = history.path().to_path_buf();
    mutate(&mut config);

    let engine =
        Arc::new(MirrorEngine::new(Arc::new(config), CancellationToken::new()).unwrap());
    World {
        engine,
        source,
        mirror,
        history,
    }
}

fn touched(w: &World, name: &str) -> FileEvent {
    FileEvent::live(w.source.path().join(name), EventKind::Touched, Side::Source)
}

fn mirror_mtime(w: &World, name: &str) -> std::time::SystemTime {
    std::fs::metadata(w.mirror.path().join(name))
        .unwrap()
        .modified()
        .unwrap()
}

fn history_names(w: &World) -> Vec<String> {
    std::fs::read_dir(w.history.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn test_initial_scan_mirrors_nested_tree() {
    let w = world(|_| {});
    std::fs::create_dir_all(w.source.path().join("a/b")).unwrap();
    std::fs::write(w.source.path().join("top.txt"), b"top").unwrap();
    std::fs::write(w.source.path().join("a/mid.txt"), b"mid").unwrap();
    std::fs::write(w.source.path().join("a/b/deep.txt"), b"deep").unwrap();

    w.engine.scan_pass(true).await;

    assert_eq!(std::fs::read(w.mirror.path().join("top.txt")).unwrap(), b"top");
    assert_eq!(std::fs::read(w.mirror.path().join("a/mid.txt")).unwrap(), b"mid");
    assert_eq!(
        std::fs::read(w.mirror.path().join("a/b/deep.txt")).unwrap(),
        b"deep"
    );
}

#[tokio::test]
async fn test_repeated_scans_are_idempotent() {
    let w = world(|_| {});
    std::fs::write(w.source.path().join("a.txt"), b"stable").unwrap();

    w.engine.scan_pass(true).await;
    let first = mirror_mtime(&w, "a.txt");

    tokio::time::sleep(Duration::from_millis(20)).await;
    w.engine.scan_pass(false).await;
    w.engine.scan_pass(false).await;

    assert_eq!(mirror_mtime(&w, "a.txt"), first);
}

#[tokio::test]
async fn test_equal_content_is_not_rewritten_despite_newer_timestamp() {
    let w = world(|_| {});
    std::fs::write(w.mirror.path().join("a.txt"), b"same bytes").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    // Source is strictly newer but byte-identical; the content check must
    // win and leave the destination untouched.
    std::fs::write(w.source.path().join("a.txt"), b"same bytes").unwrap();
    let before = mirror_mtime(&w, "a.txt");

    w.engine.dispatch_event(touched(&w, "a.txt")).await;

    assert_eq!(mirror_mtime(&w, "a.txt"), before);
}

#[tokio::test]
async fn test_changed_content_is_rewritten() {
    let w = world(|_| {});
    std::fs::write(w.mirror.path().join("a.txt"), b"old").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(w.source.path().join("a.txt"), b"new").unwrap();

    w.engine.dispatch_event(touched(&w, "a.txt")).await;

    assert_eq!(std::fs::read(w.mirror.path().join("a.txt")).unwrap(), b"new");
}

#[tokio::test]
async fn test_rename_to_backup_name_is_a_no_op() {
    let w = world(|_| {});
    std::fs::write(w.source.path().join("a.txt~"), b"parked").unwrap();
    std::fs::write(w.mirror.path().join("a.txt"), b"kept").unwrap();

    let rename = FileEvent::live(
        w.source.path().join("a.txt~"),
        EventKind::Renamed {
            old: w.source.path().join("a.txt"),
        },
        Side::Source,
    );
    w.engine.dispatch_event(rename).await;

    // The soft-delete convention itself must not ripple into the mirror.
    assert_eq!(std::fs::read(w.mirror.path().join("a.txt")).unwrap(), b"kept");
    assert!(!w.mirror.path().join("a.txt~").exists());
}

#[tokio::test]
async fn test_history_version_name_timestamp_before_ext() {
    let w = world(|c| {
        c.mirror.enabled = false;
        c.history.enabled = true;
        c.history.version_format = HistoryVersionFormat::TimestampBeforeExt;
        c.history.separator = ".".to_string();
    });
    std::fs::write(w.source.path().join("report.txt"), b"v1").unwrap();

    w.engine.dispatch_event(touched(&w, "report.txt")).await;

    let names = history_names(&w);
    assert_eq!(names.len(), 1);
    let name = &names[0];
    assert!(name.starts_with("report."), "unexpected name {name}");
    assert!(name.ends_with(".txt"), "unexpected name {name}");
    let stamp = &name["report.".len()..name.len() - ".txt".len()];
    assert_eq!(stamp.len(), 17, "unexpected stamp in {name}");
    assert!(stamp.chars().all(|c| c.is_ascii_digit()));
}

#[tokio::test]
async fn test_history_version_name_prefix_and_suffix() {
    let cases: [(HistoryVersionFormat, fn(&str) -> bool); 2] = [
        (HistoryVersionFormat::PrefixTimestamp, |name| {
            name.len() > 18
                && name[..17].chars().all(|c| c.is_ascii_digit())
                && name.ends_with("_report.txt")
        }),
        (HistoryVersionFormat::SuffixTimestamp, |name| {
            name.starts_with("report.txt_")
                && name["report.txt_".len()..]
                    .chars()
                    .all(|c| c.is_ascii_digit())
        }),
    ];
    for (format, check) in cases {
        let w = world(|c| {
            c.mirror.enabled = false;
            c.history.enabled = true;
            c.history.version_format = format;
            c.history.separator = "_".to_string();
        });
        std::fs::write(w.source.path().join("report.txt"), b"v1").unwrap();

        w.engine.dispatch_event(touched(&w, "report.txt")).await;

        let names = history_names(&w);
        assert_eq!(names.len(), 1);
        assert!(check(&names[0]), "unexpected name {} for {format:?}", names[0]);
    }
}

#[tokio::test]
async fn test_history_accumulates_versions() {
    let w = world(|c| {
        c.mirror.enabled = false;
        c.history.enabled = true;
    });
    std::fs::write(w.source.path().join("a.log"), b"v1").unwrap();
    w.engine.dispatch_event(touched(&w, "a.log")).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(w.source.path().join("a.log"), b"v2").unwrap();
    w.engine.dispatch_event(touched(&w, "a.log")).await;

    assert_eq!(history_names(&w).len(), 2);
}

#[tokio::test]
async fn test_excluded_extension_is_skipped() {
    let w = world(|c| {
        c.mirror.filter.excluded_extensions = vec!["tmp".to_string()];
    });
    std::fs::write(w.source.path().join("keep.txt"), b"yes").unwrap();
    std::fs::write(w.source.path().join("skip.tmp"), b"no").unwrap();

    w.engine.scan_pass(true).await;

    assert!(w.mirror.path().join("keep.txt").exists());
    assert!(!w.mirror.path().join("skip.tmp").exists());
}

#[tokio::test]
async fn test_ignored_subtree_is_pruned() {
    let w = world(|c| {
        c.mirror.filter.ignore_starts_with = vec!["scratch".to_string()];
    });
    std::fs::create_dir_all(w.source.path().join("scratch")).unwrap();
    std::fs::write(w.source.path().join("scratch/junk.txt"), b"no").unwrap();
    std::fs::write(w.source.path().join("real.txt"), b"yes").unwrap();

    w.engine.scan_pass(true).await;

    assert!(w.mirror.path().join("real.txt").exists());
    assert!(!w.mirror.path().join("scratch").exists());
}

#[tokio::test]
async fn test_persistent_cache_file_appears_in_destination() {
    let w = world(|c| {
        c.cache.persistent = true;
    });
    std::fs::write(w.source.path().join("a.txt"), b"payload").unwrap();

    w.engine.dispatch_event(touched(&w, "a.txt")).await;

    let cache_file = w.mirror.path().join(".dirmirror-cache");
    assert!(cache_file.exists());
    let raw = std::fs::read_to_string(&cache_file).unwrap();
    assert!(raw.contains("a.txt"));
}

#[tokio::test]
async fn test_concurrent_dispatches_leave_consistent_mirror() {
    let w = world(|_| {});
    std::fs::write(w.source.path().join("hot.txt"), b"final contents").unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&w.engine);
        let event = touched(&w, "hot.txt");
        tasks.push(tokio::spawn(async move {
            engine.dispatch_event(event).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(
        std::fs::read(w.mirror.path().join("hot.txt")).unwrap(),
        b"final contents"
    );
    // No stray temp files from interrupted atomic writes.
    let leftovers: Vec<PathBuf> = std::fs::read_dir(w.mirror.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "part"))
        .collect();
    assert!(leftovers.is_empty(), "leftover temp files: {leftovers:?}");
}

#[tokio::test]
async fn test_bidirectional_destination_edit_flows_back() {
    let w = world(|c| c.mirror.bidirectional = true);
    std::fs::write(w.mirror.path().join("b.txt"), b"edited on mirror").unwrap();

    let event = FileEvent::live(
        w.mirror.path().join("b.txt"),
        EventKind::Touched,
        Side::Destination,
    );
    w.engine.dispatch_event(event).await;

    assert_eq!(
        std::fs::read(w.source.path().join("b.txt")).unwrap(),
        b"edited on mirror"
    );
}
