//! In-process backend implementing both the remote store and the push
//! transport. Used by the test suites and the binary's `--memory` mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::RemoteStore;
use crate::error::{SyncError, SyncResult};
use crate::realtime::{ChangeEvent, ChangeOp, Channel, ChannelHandle, ChannelStatus, PushMessage, PushTransport};
use crate::record::{Record, RecordId};
use crate::resources::{compare_field, Placement};
use crate::scope::{Filter, ResourceKind};

struct OpenChannel {
  resource: ResourceKind,
  owner: String,
  tx: mpsc::UnboundedSender<PushMessage>,
}

/// Tables kept in insertion order, with server-assigned numeric ids.
pub struct MemoryBackend {
  tables: Mutex<HashMap<ResourceKind, Vec<Record>>>,
  channels: Mutex<HashMap<ChannelHandle, OpenChannel>>,
  next_id: AtomicU64,
  next_handle: AtomicU64,
  offline: AtomicBool,
  refuse_subscriptions: AtomicBool,
  query_latency: Mutex<Duration>,
  mutation_latency: Mutex<Duration>,
  queries: AtomicUsize,
  subscribes: AtomicUsize,
  peak_channels: AtomicUsize,
}

impl Default for MemoryBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self {
      tables: Mutex::new(HashMap::new()),
      channels: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(1),
      next_handle: AtomicU64::new(1),
      offline: AtomicBool::new(false),
      refuse_subscriptions: AtomicBool::new(false),
      query_latency: Mutex::new(Duration::ZERO),
      mutation_latency: Mutex::new(Duration::ZERO),
      queries: AtomicUsize::new(0),
      subscribes: AtomicUsize::new(0),
      peak_channels: AtomicUsize::new(0),
    }
  }

  fn tables(&self) -> MutexGuard<'_, HashMap<ResourceKind, Vec<Record>>> {
    self.tables.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn channels(&self) -> MutexGuard<'_, HashMap<ChannelHandle, OpenChannel>> {
    self.channels.lock().unwrap_or_else(PoisonError::into_inner)
  }

  // --------------------------------------------------------------------------
  // Test controls
  // --------------------------------------------------------------------------

  /// Make every remote call fail with a transport error.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Make channel subscriptions fail.
  pub fn refuse_subscriptions(&self, refuse: bool) {
    self.refuse_subscriptions.store(refuse, Ordering::SeqCst);
  }

  pub fn set_query_latency(&self, latency: Duration) {
    *self.query_latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
  }

  pub fn set_mutation_latency(&self, latency: Duration) {
    *self.mutation_latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
  }

  /// Number of scoped reads served.
  pub fn query_count(&self) -> usize {
    self.queries.load(Ordering::SeqCst)
  }

  pub fn subscribe_count(&self) -> usize {
    self.subscribes.load(Ordering::SeqCst)
  }

  pub fn open_channels(&self) -> usize {
    self.channels().len()
  }

  /// Most channels ever open at the same time.
  pub fn peak_channels(&self) -> usize {
    self.peak_channels.load(Ordering::SeqCst)
  }

  /// Deliver a status callback on every open channel.
  pub fn broadcast_status(&self, status: ChannelStatus) {
    for channel in self.channels().values() {
      let _ = channel.tx.send(PushMessage::Status(status));
    }
  }

  /// Drop every open channel from the server side; listeners see their
  /// stream end.
  pub fn sever_channels(&self) {
    self.channels().clear();
  }

  pub fn rows(&self, resource: ResourceKind) -> Vec<Record> {
    self.tables().get(&resource).cloned().unwrap_or_default()
  }

  // --------------------------------------------------------------------------
  // Server-side writes (no latency, never offline, still broadcast)
  // --------------------------------------------------------------------------

  /// Insert a row with a server-assigned id.
  pub fn seed(&self, resource: ResourceKind, owner: &str, fields: Value) -> Record {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    self.seed_with_id(resource, owner, id, fields)
  }

  /// Insert a row with a chosen numeric id.
  pub fn seed_with_id(&self, resource: ResourceKind, owner: &str, id: u64, fields: Value) -> Record {
    self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    let mut fields = match fields {
      Value::Object(map) => map,
      _ => Map::new(),
    };
    fields.insert(
      resource.descriptor().owner_field.to_string(),
      Value::String(owner.to_string()),
    );
    let record = Record::new(id, Utc::now(), fields);
    self
      .tables()
      .entry(resource)
      .or_default()
      .push(record.clone());
    self.notify(ChangeOp::Insert, resource, owner, Some(record.id.clone()));
    record
  }

  /// Change a row as another device would.
  pub fn server_update(
    &self,
    resource: ResourceKind,
    owner: &str,
    id: &RecordId,
    patch: Value,
  ) -> SyncResult<Record> {
    let patch = match patch {
      Value::Object(map) => map,
      _ => Map::new(),
    };
    self.write_update(resource, owner, id, &patch)
  }

  pub fn server_delete(&self, resource: ResourceKind, owner: &str, id: &RecordId) -> SyncResult<()> {
    self.write_delete(resource, owner, id)
  }

  fn write_update(
    &self,
    resource: ResourceKind,
    owner: &str,
    id: &RecordId,
    patch: &Map<String, Value>,
  ) -> SyncResult<Record> {
    let owner_field = resource.descriptor().owner_field;
    let updated = {
      let mut tables = self.tables();
      let row = tables
        .get_mut(&resource)
        .and_then(|rows| {
          rows
            .iter_mut()
            .find(|r| &r.id == id && r.get_str(owner_field) == Some(owner))
        })
        .ok_or_else(|| SyncError::NotFound(id.clone()))?;
      row.apply_patch(patch, Utc::now());
      row.clone()
    };
    self.notify(ChangeOp::Update, resource, owner, Some(id.clone()));
    Ok(updated)
  }

  fn write_delete(&self, resource: ResourceKind, owner: &str, id: &RecordId) -> SyncResult<()> {
    let owner_field = resource.descriptor().owner_field;
    {
      let mut tables = self.tables();
      let rows = tables.entry(resource).or_default();
      let before = rows.len();
      rows.retain(|r| !(&r.id == id && r.get_str(owner_field) == Some(owner)));
      if rows.len() == before {
        return Err(SyncError::NotFound(id.clone()));
      }
    }
    self.notify(ChangeOp::Delete, resource, owner, Some(id.clone()));
    Ok(())
  }

  fn notify(&self, operation: ChangeOp, resource: ResourceKind, owner: &str, record_id: Option<RecordId>) {
    let event = ChangeEvent {
      operation,
      resource,
      owner: owner.to_string(),
      record_id,
    };
    for channel in self.channels().values() {
      if channel.resource == resource && channel.owner == owner {
        let _ = channel.tx.send(PushMessage::Change(event.clone()));
      }
    }
  }

  async fn network(&self, latency: &Mutex<Duration>) -> SyncResult<()> {
    let latency = *latency.lock().unwrap_or_else(PoisonError::into_inner);
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
    if self.offline.load(Ordering::SeqCst) {
      return Err(SyncError::Transport("network unreachable".to_string()));
    }
    Ok(())
  }
}

fn matches_filter(record: &Record, filter: Option<&Filter>) -> bool {
  let Some(filter) = filter else {
    return true;
  };
  filter.iter().all(|(field, expected)| match record.get(field) {
    Some(Value::String(s)) => s == expected,
    Some(other) => &other.to_string() == expected,
    None => false,
  })
}

#[async_trait]
impl RemoteStore for MemoryBackend {
  async fn query(
    &self,
    resource: ResourceKind,
    owner: &str,
    filter: Option<&Filter>,
  ) -> SyncResult<Vec<Record>> {
    self.queries.fetch_add(1, Ordering::SeqCst);
    self.network(&self.query_latency).await?;

    let descriptor = resource.descriptor();
    let mut rows: Vec<Record> = self
      .rows(resource)
      .into_iter()
      .filter(|r| r.get_str(descriptor.owner_field) == Some(owner))
      .filter(|r| matches_filter(r, filter))
      .collect();

    match descriptor.placement {
      Placement::NewestFirst => rows.reverse(),
      Placement::OldestFirst => {}
      Placement::ByField(field) => rows.sort_by(|a, b| compare_field(a.get(field), b.get(field))),
    }
    Ok(rows)
  }

  async fn insert(
    &self,
    resource: ResourceKind,
    owner: &str,
    payload: Map<String, Value>,
  ) -> SyncResult<Record> {
    self.network(&self.mutation_latency).await?;
    Ok(self.seed(resource, owner, Value::Object(payload)))
  }

  async fn update(
    &self,
    resource: ResourceKind,
    owner: &str,
    id: &RecordId,
    patch: Map<String, Value>,
  ) -> SyncResult<Record> {
    self.network(&self.mutation_latency).await?;
    self.write_update(resource, owner, id, &patch)
  }

  async fn delete(&self, resource: ResourceKind, owner: &str, id: &RecordId) -> SyncResult<()> {
    self.network(&self.mutation_latency).await?;
    self.write_delete(resource, owner, id)
  }
}

#[async_trait]
impl PushTransport for MemoryBackend {
  async fn subscribe(&self, resource: ResourceKind, owner: &str) -> SyncResult<Channel> {
    self.subscribes.fetch_add(1, Ordering::SeqCst);
    tokio::task::yield_now().await;

    if self.refuse_subscriptions.load(Ordering::SeqCst) {
      return Err(SyncError::Subscription(format!(
        "channel for {} refused",
        resource
      )));
    }

    let handle = ChannelHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(PushMessage::Status(ChannelStatus::Subscribed));

    let mut channels = self.channels();
    channels.insert(
      handle,
      OpenChannel {
        resource,
        owner: owner.to_string(),
        tx,
      },
    );
    self.peak_channels.fetch_max(channels.len(), Ordering::SeqCst);

    Ok(Channel {
      handle,
      messages: rx,
    })
  }

  fn unsubscribe(&self, handle: ChannelHandle) {
    self.channels().remove(&handle);
  }
}
