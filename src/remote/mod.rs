//! The authoritative store the cache mirrors.

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::SyncResult;
use crate::record::{Record, RecordId};
use crate::scope::{Filter, ResourceKind};

pub use memory::MemoryBackend;
pub use rest::RestRemote;

/// Scoped CRUD against the hosted backend.
///
/// Every call is authorized by `owner`; implementations return canonical
/// records as the server stores them.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Records of `resource` owned by `owner`, in the resource's canonical
  /// order.
  async fn query(
    &self,
    resource: ResourceKind,
    owner: &str,
    filter: Option<&Filter>,
  ) -> SyncResult<Vec<Record>>;

  async fn insert(
    &self,
    resource: ResourceKind,
    owner: &str,
    payload: Map<String, Value>,
  ) -> SyncResult<Record>;

  async fn update(
    &self,
    resource: ResourceKind,
    owner: &str,
    id: &RecordId,
    patch: Map<String, Value>,
  ) -> SyncResult<Record>;

  async fn delete(&self, resource: ResourceKind, owner: &str, id: &RecordId) -> SyncResult<()>;
}
