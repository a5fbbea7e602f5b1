//! dirmirror Cache - Metadata caching for destination trees
//!
//! Statting a file on unreliable storage is expensive, so destination and
//! history metadata is cached: an in-memory layer for the running process
//! and an optional persisted layer that survives restarts.
//!
//! ## Architecture
//!
//! The cache only ever holds *non-authoritative* paths. The source tree is
//! the single source of truth and is always statted live; destination and
//! history paths may be answered from cache because this daemon is the only
//! writer there (one-way mirroring). During live bidirectional mirroring
//! the destination is also externally writable, so mirror lookups bypass
//! the cache while history lookups keep using it.
//!
//! ## Key Components
//!
//! - [`MetadataCache`] - in-memory layer plus role-aware bypass rules
//! - [`DirCacheStore`] - one hidden JSON file per directory, written via
//!   temp file + atomic rename, corruption treated as cache-absent

pub mod persist;
pub mod store;

pub use persist::DirCacheStore;
pub use store::MetadataCache;
