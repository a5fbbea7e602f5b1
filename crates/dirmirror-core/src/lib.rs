//! dirmirror Core - Domain logic, configuration, and shared substrate
//!
//! This crate contains the pieces every other dirmirror crate builds on:
//! - **Domain entities** - `FileRecord`, `FileEvent`, `SyncContext`, roles and sides
//! - **Error taxonomy** - `SyncError` with an explicit transient/fatal split
//! - **Configuration** - typed YAML config with validation and defaults
//! - **History naming** - timestamp-versioned filename schemes
//! - **Resilience wrapper** - timeouts, retries, and cancellation for disk I/O
//! - **Path lock queue** - exclusive, reclaimable locks keyed by normalized path
//!
//! # Architecture
//!
//! The domain module contains pure business types with no filesystem I/O.
//! The resilience wrapper is the one place in this crate that touches the
//! watched trees, and only on behalf of its callers. The cache, pipeline,
//! and daemon layers live in `dirmirror-cache`, `dirmirror-sync`, and
//! `dirmirror-daemon`.

pub mod config;
pub mod domain;
pub mod history;
pub mod locks;
pub mod resilience;
