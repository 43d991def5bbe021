//! Client-side mirror of server-held tasks, ledger entries, categories and
//! profile, with optimistic mutation and realtime push invalidation.
//!
//! Every resource goes through the same generic engine; resources differ
//! only by their [`resources::ResourceDescriptor`].

pub mod cache;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod mutation;
pub mod realtime;
pub mod record;
pub mod remote;
pub mod resources;
pub mod scope;

pub use engine::{EngineConfig, ScopeHandle, ScopeView, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use mutation::{Committed, Mutation};
pub use record::{Record, RecordId};
pub use scope::{Filter, ResourceKind, ScopeKey};
