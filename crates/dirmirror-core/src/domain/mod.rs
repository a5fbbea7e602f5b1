//! Domain types for the synchronization engine
//!
//! - [`record`] - last-known file metadata (`FileRecord`)
//! - [`event`] - raw and synthesized filesystem events
//! - [`context`] - per-event, per-role synchronization contexts
//! - [`errors`] - the `SyncError` taxonomy

pub mod context;
pub mod errors;
pub mod event;
pub mod record;

pub use context::SyncContext;
pub use errors::{OpClass, SyncError, TransientKind};
pub use event::{EventKind, FileEvent, Side, SyncRole};
pub use record::{FileAttributes, FileRecord};
