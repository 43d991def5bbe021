//! Local mirror of server-held collections.
//!
//! This module holds the resource-agnostic pieces of the cache:
//! - Entries keyed by scope, with fetch status and freshness metadata
//! - List primitives (insert in canonical order, patch, remove, merge by id)
//! - Synchronous read/write/invalidate/evict over watch channels
//! - Snapshot persistence so a cold start can show the last known data

mod entry;
mod storage;
mod store;

pub use entry::{CacheEntry, CacheSource, EntryData, FetchStatus};
pub use storage::{CacheStorage, NoopStorage, PersistedScope, SqliteStorage};
pub use store::CacheStore;
