//! Optimistic mutations.
//!
//! Every mutation follows the same protocol:
//! 1. snapshot each cache entry it touches,
//! 2. apply the change locally right away,
//! 3. issue the remote call,
//! 4. on success merge the canonical record (swapping a provisional id for
//!    the server's), on failure restore the snapshots and return the error,
//! 5. either way, schedule a settle-time refetch of the whole collection.
//!
//! Mutations on one scope may overlap. A rollback restores only its own
//! snapshot, so it can discard the optimistic effect of a mutation applied
//! after it; the settle refetch closes that gap.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cache::{CacheSource, CacheStorage, CacheStore, EntryData, FetchStatus};
use crate::error::{SyncError, SyncResult};
use crate::fetch::FetchCoordinator;
use crate::record::{Record, RecordId};
use crate::remote::RemoteStore;
use crate::resources::ResourceDescriptor;
use crate::scope::{ScopeKey, ScopeRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  Create,
  Update,
  Delete,
  Toggle,
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Operation::Create => write!(f, "create"),
      Operation::Update => write!(f, "update"),
      Operation::Delete => write!(f, "delete"),
      Operation::Toggle => write!(f, "toggle"),
    }
  }
}

/// A change requested by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  Create { payload: Map<String, Value> },
  Update { id: RecordId, patch: Map<String, Value> },
  Delete { id: RecordId },
  /// Flip the resource's toggle field. `current` is the value the caller
  /// saw; the record ends up with its negation.
  Toggle { id: RecordId, current: bool },
}

fn object(value: Value) -> SyncResult<Map<String, Value>> {
  match value {
    Value::Object(map) => Ok(map),
    other => Err(SyncError::Validation(format!(
      "mutation payload must be an object, got {}",
      other
    ))),
  }
}

impl Mutation {
  pub fn create(payload: Value) -> SyncResult<Self> {
    Ok(Mutation::Create {
      payload: object(payload)?,
    })
  }

  pub fn update(id: impl Into<RecordId>, patch: Value) -> SyncResult<Self> {
    Ok(Mutation::Update {
      id: id.into(),
      patch: object(patch)?,
    })
  }

  pub fn delete(id: impl Into<RecordId>) -> Self {
    Mutation::Delete { id: id.into() }
  }

  pub fn toggle(id: impl Into<RecordId>, current: bool) -> Self {
    Mutation::Toggle {
      id: id.into(),
      current,
    }
  }

  pub fn operation(&self) -> Operation {
    match self {
      Mutation::Create { .. } => Operation::Create,
      Mutation::Update { .. } => Operation::Update,
      Mutation::Delete { .. } => Operation::Delete,
      Mutation::Toggle { .. } => Operation::Toggle,
    }
  }

  /// The existing record this mutation targets, if any.
  pub fn target(&self) -> Option<&RecordId> {
    match self {
      Mutation::Create { .. } => None,
      Mutation::Update { id, .. } | Mutation::Delete { id } | Mutation::Toggle { id, .. } => Some(id),
    }
  }

  /// The patch sent for a toggle.
  fn toggle_patch(field: &str, current: bool) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert(field.to_string(), Value::Bool(!current));
    patch
  }

  /// Apply the optimistic effect to `data`. Total: a missing target makes
  /// this a no-op. Returns whether anything changed.
  fn apply(
    &self,
    descriptor: &ResourceDescriptor,
    data: &mut EntryData,
    provisional: Option<&Record>,
    now: DateTime<Utc>,
  ) -> bool {
    match self {
      Mutation::Create { .. } => match provisional {
        Some(record) if !data.contains(&record.id) => {
          data.insert(descriptor, record.clone());
          true
        }
        _ => false,
      },
      Mutation::Update { id, patch } => data.update(id, patch, now),
      Mutation::Delete { id } => data.remove(id).is_some(),
      Mutation::Toggle { id, current } => match descriptor.toggle_field {
        Some(field) => data.update(id, &Self::toggle_patch(field, *current), now),
        None => false,
      },
    }
  }
}

/// Outcome of a committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Committed {
  /// The canonical record after create, update or toggle.
  Saved(Record),
  Deleted(RecordId),
}

impl Committed {
  pub fn record(&self) -> Option<&Record> {
    match self {
      Committed::Saved(record) => Some(record),
      Committed::Deleted(_) => None,
    }
  }

  pub fn id(&self) -> &RecordId {
    match self {
      Committed::Saved(record) => &record.id,
      Committed::Deleted(id) => id,
    }
  }
}

/// Pre-mutation state of one touched entry.
#[derive(Debug, Clone)]
pub struct Snapshot {
  pub scope: ScopeKey,
  pub data: Option<Arc<EntryData>>,
  pub status: FetchStatus,
  pub source: Option<CacheSource>,
}

/// A mutation in flight: what was asked, what was applied locally, and
/// how to undo it.
#[derive(Debug, Clone)]
pub struct MutationEnvelope {
  pub seq: u64,
  pub scope: ScopeKey,
  pub mutation: Mutation,
  /// Provisional record synthesized for a create
  pub optimistic_record: Option<Record>,
  /// Scopes the optimistic effect was applied to
  pub targets: Vec<ScopeKey>,
  pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, Clone)]
struct PendingOp {
  seq: u64,
  mutation: Mutation,
  provisional: Option<Record>,
}

/// Mutations applied locally but not yet settled, per scope.
///
/// A read that lands while mutations are pending re-applies them on top of
/// the server data, so a refetch triggered by an unrelated change does not
/// flash the pre-mutation state.
#[derive(Clone, Default)]
pub struct PendingMutations {
  ops: Arc<Mutex<HashMap<ScopeKey, Vec<PendingOp>>>>,
  seq: Arc<AtomicU64>,
}

impl PendingMutations {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<ScopeKey, Vec<PendingOp>>> {
    self.ops.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn next_seq(&self) -> u64 {
    self.seq.fetch_add(1, Ordering::SeqCst) + 1
  }

  fn register(&self, envelope: &MutationEnvelope) {
    let mut ops = self.lock();
    for scope in &envelope.targets {
      ops.entry(scope.clone()).or_default().push(PendingOp {
        seq: envelope.seq,
        mutation: envelope.mutation.clone(),
        provisional: envelope.optimistic_record.clone(),
      });
    }
  }

  fn release(&self, seq: u64) {
    let mut ops = self.lock();
    ops.retain(|_, list| {
      list.retain(|op| op.seq != seq);
      !list.is_empty()
    });
  }

  /// Number of unsettled mutations touching the scope.
  pub fn count(&self, scope: &ScopeKey) -> usize {
    self.lock().get(scope).map_or(0, Vec::len)
  }

  /// Re-apply pending optimistic effects to freshly read data. Returns
  /// whether any were applied.
  pub fn rebase(&self, scope: &ScopeKey, data: &mut EntryData, now: DateTime<Utc>) -> bool {
    let ops = self.lock();
    let Some(list) = ops.get(scope) else {
      return false;
    };
    let descriptor = scope.resource().descriptor();
    let mut changed = false;
    for op in list {
      changed |= op.mutation.apply(descriptor, data, op.provisional.as_ref(), now);
    }
    changed
  }
}

#[derive(Clone)]
pub struct MutationCoordinator {
  remote: Arc<dyn RemoteStore>,
  store: CacheStore,
  fetcher: FetchCoordinator,
  registry: ScopeRegistry,
  storage: Arc<dyn CacheStorage>,
  pending: PendingMutations,
  settle_delay: Duration,
}

impl MutationCoordinator {
  pub fn new(
    remote: Arc<dyn RemoteStore>,
    store: CacheStore,
    fetcher: FetchCoordinator,
    registry: ScopeRegistry,
    storage: Arc<dyn CacheStorage>,
    pending: PendingMutations,
    settle_delay: Duration,
  ) -> Self {
    Self {
      remote,
      store,
      fetcher,
      registry,
      storage,
      pending,
      settle_delay,
    }
  }

  /// Run a mutation against `scope` with optimistic apply and rollback.
  ///
  /// Resolves with the server's answer, or rejects after every touched
  /// entry has been restored.
  pub async fn mutate(&self, scope: &ScopeKey, mutation: Mutation) -> SyncResult<Committed> {
    let descriptor = scope.resource().descriptor();
    validate(descriptor, &mutation)?;

    let envelope = self.apply_optimistic(scope, mutation);
    debug!(
      "{} on {} applied to {} scope(s)",
      envelope.mutation.operation(),
      scope,
      envelope.snapshots.len()
    );

    let result = self.send(descriptor, &envelope).await;
    self.pending.release(envelope.seq);

    match &result {
      Ok(committed) => self.commit(descriptor, &envelope, committed),
      Err(err) => {
        warn!(
          "{} on {} rejected, rolling back: {}",
          envelope.mutation.operation(),
          scope,
          err
        );
        self.rollback(&envelope);
      }
    }

    self.schedule_settle(scope);
    result
  }

  /// Snapshot and optimistically change every entry the mutation touches:
  /// the target scope, plus sibling scopes of the same collection that
  /// already hold the targeted record.
  fn apply_optimistic(&self, scope: &ScopeKey, mutation: Mutation) -> MutationEnvelope {
    let descriptor = scope.resource().descriptor();
    let now = Utc::now();

    let optimistic_record = match &mutation {
      Mutation::Create { payload } => {
        let mut record = Record::provisional(payload, now);
        record.fields.insert(
          descriptor.owner_field.to_string(),
          Value::String(scope.owner().to_string()),
        );
        Some(record)
      }
      _ => None,
    };

    let mut targets = vec![scope.clone()];
    if let Some(id) = mutation.target() {
      for sibling in self.store.scopes_for(scope.resource(), scope.owner()) {
        if &sibling != scope && self.store.read(&sibling).data.is_some_and(|d| d.contains(id)) {
          targets.push(sibling);
        }
      }
    }

    let mut envelope = MutationEnvelope {
      seq: self.pending.next_seq(),
      scope: scope.clone(),
      mutation,
      optimistic_record,
      snapshots: Vec::with_capacity(targets.len()),
      targets,
    };
    // Registered first, so a read landing from here on re-applies it.
    self.pending.register(&envelope);

    for target in &envelope.targets {
      // A read requested before this change must not overwrite it.
      self.fetcher.restart(target);

      let snapshot = self.store.modify_existing(target, |entry| {
        let snapshot = Snapshot {
          scope: target.clone(),
          data: entry.data.clone(),
          status: entry.status,
          source: entry.source,
        };
        let changed = entry
          .edit_data(|data| {
            envelope
              .mutation
              .apply(descriptor, data, envelope.optimistic_record.as_ref(), now)
          })
          .unwrap_or(false);
        if changed {
          entry.source = Some(CacheSource::Optimistic);
        }
        snapshot
      });
      envelope.snapshots.extend(snapshot);
    }
    envelope
  }

  async fn send(
    &self,
    descriptor: &ResourceDescriptor,
    envelope: &MutationEnvelope,
  ) -> SyncResult<Committed> {
    let resource = envelope.scope.resource();
    let owner = envelope.scope.owner();

    match &envelope.mutation {
      Mutation::Create { payload } => {
        let mut payload = payload.clone();
        payload.insert(
          descriptor.owner_field.to_string(),
          Value::String(owner.to_string()),
        );
        self
          .remote
          .insert(resource, owner, payload)
          .await
          .map(Committed::Saved)
      }
      Mutation::Update { id, patch } => self
        .remote
        .update(resource, owner, id, patch.clone())
        .await
        .map(Committed::Saved),
      Mutation::Delete { id } => {
        self.remote.delete(resource, owner, id).await?;
        Ok(Committed::Deleted(id.clone()))
      }
      Mutation::Toggle { id, current } => {
        let field = descriptor
          .toggle_field
          .ok_or_else(|| SyncError::Validation(format!("{} has no toggle field", resource)))?;
        self
          .remote
          .update(resource, owner, id, Mutation::toggle_patch(field, *current))
          .await
          .map(Committed::Saved)
      }
    }
  }

  /// Merge the server's answer into whatever entries exist now.
  fn commit(&self, descriptor: &ResourceDescriptor, envelope: &MutationEnvelope, committed: &Committed) {
    let replacing = envelope.optimistic_record.as_ref().map(|r| &r.id);

    for target in &envelope.targets {
      let merged = self.store.modify_existing(target, |entry| {
        let records = entry.edit_data(|data| {
          match (committed, replacing) {
            (Committed::Saved(record), Some(temp)) => data.merge(descriptor, record.clone(), Some(temp)),
            (Committed::Saved(record), None) => {
              // Only refresh records the scope still holds; an update never
              // resurrects a row a filter or a delete removed.
              if data.contains(&record.id) {
                data.merge(descriptor, record.clone(), None);
              }
            }
            (Committed::Deleted(id), _) => {
              data.remove(id);
            }
          }
          data.records().to_vec()
        })?;

        if entry.status != FetchStatus::Loading && entry.fetched_at.is_some() {
          entry.status = FetchStatus::Ready;
        }
        entry.source = Some(if self.pending.count(target) > 0 {
          CacheSource::Optimistic
        } else {
          CacheSource::Network
        });
        Some(records)
      });

      if let Some(Some(records)) = merged {
        if let Err(e) = self.storage.save(target, &records) {
          warn!("failed to persist {}: {}", target, e);
        }
      }
    }
  }

  /// Put every touched entry back the way this mutation found it.
  fn rollback(&self, envelope: &MutationEnvelope) {
    for snapshot in &envelope.snapshots {
      self.store.modify_existing(&snapshot.scope, |entry| {
        // Evicted and recreated since; nothing of ours to undo.
        if entry.data.is_none() {
          return;
        }
        entry.data = snapshot.data.clone();
        entry.source = snapshot.source;
        // Loading is only ever set by a read; a snapshot taken mid-read must
        // not bring it back once that read has landed.
        if entry.status != FetchStatus::Loading && snapshot.status != FetchStatus::Loading {
          entry.status = snapshot.status;
        }
      });
    }
  }

  fn schedule_settle(&self, scope: &ScopeKey) {
    let this = self.clone();
    let scope = scope.clone();
    tokio::spawn(async move {
      if !this.settle_delay.is_zero() {
        tokio::time::sleep(this.settle_delay).await;
      }
      this.settle(&scope).await;
    });
  }

  /// Invalidate every cached scope of the mutated collection and refetch
  /// the ones still in use.
  pub async fn settle(&self, scope: &ScopeKey) {
    let siblings = self.store.scopes_for(scope.resource(), scope.owner());
    for sibling in &siblings {
      self.store.invalidate(sibling);
    }

    let active: Vec<&ScopeKey> = siblings
      .iter()
      .filter(|s| self.registry.is_active(s))
      .collect();
    let results = join_all(active.iter().map(|s| self.fetcher.ensure_fresh(s))).await;
    for (s, result) in active.iter().zip(results) {
      if let Err(e) = result {
        debug!("settle refetch of {} failed: {}", s, e);
      }
    }
  }
}

fn validate(descriptor: &ResourceDescriptor, mutation: &Mutation) -> SyncResult<()> {
  if let Some(id) = mutation.target() {
    if id.is_temporary() {
      return Err(SyncError::Validation(format!(
        "record {} is still waiting for server confirmation",
        id
      )));
    }
  }
  if matches!(mutation, Mutation::Toggle { .. }) && descriptor.toggle_field.is_none() {
    return Err(SyncError::Validation(format!(
      "{} records cannot be toggled",
      descriptor.kind
    )));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::NoopStorage;
  use crate::remote::MemoryBackend;
  use crate::scope::{Filter, ResourceKind};
  use serde_json::json;

  struct Fixture {
    backend: Arc<MemoryBackend>,
    store: CacheStore,
    fetcher: FetchCoordinator,
    mutator: MutationCoordinator,
    registry: ScopeRegistry,
  }

  fn fixture() -> Fixture {
    let backend = Arc::new(MemoryBackend::new());
    let store = CacheStore::new();
    let pending = PendingMutations::new();
    let storage: Arc<dyn CacheStorage> = Arc::new(NoopStorage);
    let registry = ScopeRegistry::new();
    let fetcher = FetchCoordinator::new(
      backend.clone(),
      store.clone(),
      storage.clone(),
      pending.clone(),
      Duration::from_secs(30),
    );
    let mutator = MutationCoordinator::new(
      backend.clone(),
      store.clone(),
      fetcher.clone(),
      registry.clone(),
      storage,
      pending,
      Duration::ZERO,
    );
    Fixture {
      backend,
      store,
      fetcher,
      mutator,
      registry,
    }
  }

  fn tasks() -> ScopeKey {
    ScopeKey::new(ResourceKind::Task, "u1")
  }

  fn titles(store: &CacheStore, scope: &ScopeKey) -> Vec<String> {
    store
      .read(scope)
      .records()
      .iter()
      .filter_map(|r| r.get_str("title").map(String::from))
      .collect()
  }

  #[tokio::test]
  async fn test_create_offline_shows_then_rolls_back() {
    let f = fixture();
    f.fetcher.ensure_fresh(&tasks()).await.unwrap();
    f.backend.set_mutation_latency(Duration::from_millis(40));
    f.backend.set_offline(true);

    let mutator = f.mutator.clone();
    let pending = tokio::spawn(async move {
      mutator
        .mutate(&tasks(), Mutation::create(json!({ "title": "Buy milk" })).unwrap())
        .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let entry = f.store.read(&tasks());
    assert_eq!(entry.records().len(), 1);
    assert_eq!(entry.records()[0].get_str("title"), Some("Buy milk"));
    assert!(entry.records()[0].is_provisional());
    assert_eq!(entry.source, Some(CacheSource::Optimistic));

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_transport());
    assert!(f.store.read(&tasks()).records().is_empty());
  }

  #[tokio::test]
  async fn test_create_replaces_temporary_id() {
    let f = fixture();
    f.backend.seed(ResourceKind::Task, "u1", json!({ "title": "older" }));
    f.fetcher.ensure_fresh(&tasks()).await.unwrap();

    let committed = f
      .mutator
      .mutate(&tasks(), Mutation::create(json!({ "title": "Buy milk" })).unwrap())
      .await
      .unwrap();

    let entry = f.store.read(&tasks());
    assert!(entry.records().iter().all(|r| !r.is_provisional()));
    assert_eq!(entry.records()[0].id, *committed.id());
    assert_eq!(titles(&f.store, &tasks()), vec!["Buy milk", "older"]);
    assert_eq!(entry.status, FetchStatus::Ready);
    assert_eq!(f.pending_count(&tasks()), 0);
  }

  #[tokio::test]
  async fn test_failed_update_restores_every_touched_scope() {
    let f = fixture();
    let record = f
      .backend
      .seed(ResourceKind::Task, "u1", json!({ "title": "Pay rent", "done": false }));
    f.backend
      .seed(ResourceKind::Category, "u1", json!({ "name": "Food" }));
    let open = tasks().with_filter(Filter::new().where_eq("done", "false"));
    let categories = ScopeKey::new(ResourceKind::Category, "u1");
    for s in [&tasks(), &open, &categories] {
      f.fetcher.ensure_fresh(s).await.unwrap();
    }
    let before: Vec<_> = [&tasks(), &open, &categories]
      .iter()
      .map(|s| f.store.read(s).data)
      .collect();

    f.backend.set_offline(true);
    let result = f
      .mutator
      .mutate(
        &tasks(),
        Mutation::update(record.id.clone(), json!({ "title": "Pay rent!" })).unwrap(),
      )
      .await;

    assert!(result.is_err());
    let after: Vec<_> = [&tasks(), &open, &categories]
      .iter()
      .map(|s| f.store.read(s).data)
      .collect();
    assert_eq!(after, before);
  }

  #[tokio::test]
  async fn test_update_applies_to_siblings_holding_the_record() {
    let f = fixture();
    let record = f
      .backend
      .seed(ResourceKind::Task, "u1", json!({ "title": "Pay rent", "done": false }));
    let open = tasks().with_filter(Filter::new().where_eq("done", "false"));
    f.fetcher.ensure_fresh(&tasks()).await.unwrap();
    f.fetcher.ensure_fresh(&open).await.unwrap();

    f.mutator
      .mutate(&tasks(), Mutation::update(record.id, json!({ "title": "Rent paid" })).unwrap())
      .await
      .unwrap();

    assert_eq!(titles(&f.store, &tasks()), vec!["Rent paid"]);
    assert_eq!(titles(&f.store, &open), vec!["Rent paid"]);
  }

  #[tokio::test]
  async fn test_update_racing_delete_is_local_noop() {
    let f = fixture();
    f.backend.seed(ResourceKind::Task, "u1", json!({ "title": "a" }));
    f.fetcher.ensure_fresh(&tasks()).await.unwrap();
    let before = f.store.read(&tasks()).data;

    let err = f
      .mutator
      .mutate(&tasks(), Mutation::update(99u64, json!({ "title": "ghost" })).unwrap())
      .await
      .unwrap_err();

    assert_eq!(err, SyncError::NotFound(RecordId::from(99u64)));
    assert_eq!(f.store.read(&tasks()).data, before);
  }

  #[tokio::test]
  async fn test_delete_removes_and_reports_id() {
    let f = fixture();
    let record = f.backend.seed(ResourceKind::Task, "u1", json!({ "title": "a" }));
    f.fetcher.ensure_fresh(&tasks()).await.unwrap();

    let committed = f
      .mutator
      .mutate(&tasks(), Mutation::delete(record.id.clone()))
      .await
      .unwrap();

    assert_eq!(committed, Committed::Deleted(record.id));
    assert!(f.store.read(&tasks()).records().is_empty());
    assert!(f.backend.rows(ResourceKind::Task).is_empty());
  }

  #[tokio::test]
  async fn test_toggle_flips_flag() {
    let f = fixture();
    let record = f
      .backend
      .seed(ResourceKind::Task, "u1", json!({ "title": "a", "done": false }));
    f.fetcher.ensure_fresh(&tasks()).await.unwrap();

    let committed = f
      .mutator
      .mutate(&tasks(), Mutation::toggle(record.id, false))
      .await
      .unwrap();

    assert_eq!(committed.record().and_then(|r| r.get_bool("done")), Some(true));
    assert_eq!(f.store.read(&tasks()).records()[0].get_bool("done"), Some(true));
  }

  #[tokio::test]
  async fn test_rejected_before_apply() {
    let f = fixture();
    f.fetcher.ensure_fresh(&tasks()).await.unwrap();

    let err = f
      .mutator
      .mutate(&tasks(), Mutation::delete(RecordId::temporary()))
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    let categories = ScopeKey::new(ResourceKind::Category, "u1");
    let err = f
      .mutator
      .mutate(&categories, Mutation::toggle(1u64, true))
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert!(Mutation::create(json!("not an object")).is_err());
  }

  #[tokio::test]
  async fn test_refetch_during_mutation_keeps_optimistic_state() {
    let f = fixture();
    let record = f
      .backend
      .seed(ResourceKind::Task, "u1", json!({ "title": "a", "done": false }));
    f.fetcher.ensure_fresh(&tasks()).await.unwrap();
    f.backend.set_mutation_latency(Duration::from_millis(40));

    let mutator = f.mutator.clone();
    let id = record.id.clone();
    let toggle = tokio::spawn(async move { mutator.mutate(&tasks(), Mutation::toggle(id, false)).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    f.fetcher.refetch(&tasks()).await.unwrap();
    let entry = f.store.read(&tasks());
    assert_eq!(entry.records()[0].get_bool("done"), Some(true));
    assert_eq!(entry.source, Some(CacheSource::Optimistic));

    toggle.await.unwrap().unwrap();
    assert_eq!(f.store.read(&tasks()).records()[0].get_bool("done"), Some(true));
  }

  #[tokio::test]
  async fn test_settle_refetches_active_scopes_only() {
    let f = fixture();
    let open = tasks().with_filter(Filter::new().where_eq("done", "false"));
    f.fetcher.ensure_fresh(&tasks()).await.unwrap();
    f.fetcher.ensure_fresh(&open).await.unwrap();
    f.registry.attach(&tasks(), true);
    let reads = f.backend.query_count();

    f.mutator.settle(&tasks()).await;

    assert_eq!(f.backend.query_count(), reads + 1);
    assert!(!f.store.read(&tasks()).stale);
    assert!(f.store.read(&open).stale);
  }

  #[tokio::test]
  async fn test_rollback_after_read_lands_keeps_ready() {
    let f = fixture();
    f.backend.seed(ResourceKind::Task, "u1", json!({ "title": "a" }));
    f.fetcher.ensure_fresh(&tasks()).await.unwrap();
    f.backend.set_query_latency(Duration::from_millis(20));
    f.backend.set_mutation_latency(Duration::from_millis(80));
    f.store.invalidate(&tasks());
    f.fetcher.prefetch(&tasks());
    assert_eq!(f.store.read(&tasks()).status, FetchStatus::Loading);

    let err = f
      .mutator
      .mutate(&tasks(), Mutation::update(99u64, json!({ "title": "gone" })).unwrap())
      .await
      .unwrap_err();
    assert_eq!(err, SyncError::NotFound(RecordId::from(99u64)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let entry = f.store.read(&tasks());
    assert_eq!(entry.status, FetchStatus::Ready);
    assert_eq!(titles(&f.store, &tasks()), vec!["a"]);

    // A later caller starts its own read instead of joining a dead one.
    tokio::time::timeout(Duration::from_secs(1), f.fetcher.ensure_fresh(&tasks()))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(f.store.read(&tasks()).status, FetchStatus::Ready);
  }

  impl Fixture {
    fn pending_count(&self, scope: &ScopeKey) -> usize {
      self.mutator.pending.count(scope)
    }
  }
}
