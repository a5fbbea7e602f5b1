//! dirmirror Sync - The synchronization pipeline
//!
//! Every change, whether noticed live by the watcher or synthesized by the
//! periodic scan, flows through the same pipeline:
//!
//! ```text
//! FileEvent
//!    │
//!    ▼
//! EventClassifier ──→ up to two SyncContexts (mirror, history)
//!    │
//!    ▼
//! DecisionEngine ──→ needs update?
//!    │
//!    ▼
//! Executor ──→ locked, space-checked, verified write (or soft delete)
//! ```
//!
//! ## Key Components
//!
//! - [`classify::EventClassifier`] - role qualification and counterpart paths
//! - [`decision::DecisionEngine`] - the ordered update rules
//! - [`executor::Executor`] - the only code that writes to destination trees
//! - [`scanner::ScanReconciler`] - snapshot-diffing periodic scans
//! - [`watcher::FileWatcher`] - live change notifications with debouncing
//! - [`engine::MirrorEngine`] - wires it all together and owns the run loop

pub mod classify;
pub mod decision;
pub mod engine;
pub mod executor;
pub mod scanner;
pub mod watcher;

pub use engine::MirrorEngine;
