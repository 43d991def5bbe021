//! The sync engine facade.
//!
//! One [`SyncEngine`] per process wires the cache store, the fetch and
//! mutation coordinators and the realtime manager together. Consumers
//! declare interest with [`SyncEngine::use_scope`] and hold the returned
//! [`ScopeHandle`] for as long as they render the scope.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheSource, CacheStorage, CacheStore, EntryData, FetchStatus, NoopStorage};
use crate::error::{SyncError, SyncResult};
use crate::fetch::FetchCoordinator;
use crate::mutation::{Committed, Mutation, MutationCoordinator, PendingMutations};
use crate::realtime::{PushTransport, SyncManager};
use crate::remote::RemoteStore;
use crate::scope::{ScopeKey, ScopeRegistry};

/// Timing knobs of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
  /// How long a successful read satisfies `ensure_fresh`
  pub stale_window: Duration,
  /// How long an unused entry survives before the sweep may evict it
  pub retention: Duration,
  /// Delay between a mutation settling and the collection refetch
  pub settle_delay: Duration,
  /// Refresh interval for scopes without a push channel
  pub poll_interval: Duration,
  pub sweep_interval: Duration,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      stale_window: Duration::from_secs(30),
      retention: Duration::from_secs(5 * 60),
      settle_delay: Duration::from_millis(250),
      poll_interval: Duration::from_secs(30),
      sweep_interval: Duration::from_secs(60),
    }
  }
}

impl EngineConfig {
  pub fn with_stale_window(mut self, window: Duration) -> Self {
    self.stale_window = window;
    self
  }

  pub fn with_retention(mut self, retention: Duration) -> Self {
    self.retention = retention;
    self
  }

  pub fn with_settle_delay(mut self, delay: Duration) -> Self {
    self.settle_delay = delay;
    self
  }

  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
    self.sweep_interval = interval;
    self
  }
}

struct EngineInner {
  config: EngineConfig,
  store: CacheStore,
  registry: ScopeRegistry,
  fetcher: FetchCoordinator,
  mutator: MutationCoordinator,
  realtime: SyncManager,
  sweeper: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SyncEngine {
  inner: Arc<EngineInner>,
}

impl SyncEngine {
  /// Engine without persistence.
  pub fn new(config: EngineConfig, remote: Arc<dyn RemoteStore>, transport: Arc<dyn PushTransport>) -> Self {
    Self::with_storage(config, remote, transport, Arc::new(NoopStorage))
  }

  pub fn with_storage(
    config: EngineConfig,
    remote: Arc<dyn RemoteStore>,
    transport: Arc<dyn PushTransport>,
    storage: Arc<dyn CacheStorage>,
  ) -> Self {
    let store = CacheStore::new();
    let registry = ScopeRegistry::new();
    let pending = PendingMutations::new();

    let fetcher = FetchCoordinator::new(
      remote.clone(),
      store.clone(),
      storage.clone(),
      pending.clone(),
      config.stale_window,
    );
    let mutator = MutationCoordinator::new(
      remote,
      store.clone(),
      fetcher.clone(),
      registry.clone(),
      storage,
      pending,
      config.settle_delay,
    );
    let realtime = SyncManager::new(
      transport,
      store.clone(),
      fetcher.clone(),
      registry.clone(),
      config.poll_interval,
    );

    Self {
      inner: Arc::new(EngineInner {
        config,
        store,
        registry,
        fetcher,
        mutator,
        realtime,
        sweeper: Mutex::new(None),
      }),
    }
  }

  /// Enable subscriptions and the retention sweeper. Must be called from
  /// within a tokio runtime.
  pub fn start(&self) {
    self.inner.realtime.start();

    let engine = self.clone();
    let every = self.inner.config.sweep_interval;
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let evicted = engine.sweep();
        if !evicted.is_empty() {
          debug!("retention sweep evicted {} scope(s)", evicted.len());
        }
      }
    });

    let mut sweeper = self.inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(previous) = sweeper.replace(task) {
      previous.abort();
    }
  }

  /// Close every channel and stop background work. Cached data stays
  /// readable.
  pub fn stop(&self) {
    let task = self
      .inner
      .sweeper
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(task) = task {
      task.abort();
    }
    self.inner.realtime.stop();
  }

  pub fn config(&self) -> &EngineConfig {
    &self.inner.config
  }

  pub fn store(&self) -> &CacheStore {
    &self.inner.store
  }

  pub fn realtime(&self) -> &SyncManager {
    &self.inner.realtime
  }

  pub fn registry(&self) -> &ScopeRegistry {
    &self.inner.registry
  }

  /// Attach a consumer to `scope`.
  ///
  /// With `enabled` the scope is fetched if stale and kept live through
  /// push updates until the last enabled handle drops. A disabled handle
  /// only observes whatever the cache holds.
  pub fn use_scope(&self, scope: ScopeKey, enabled: bool) -> ScopeHandle {
    let rx = self.inner.store.subscribe(&scope);
    self.inner.registry.attach(&scope, enabled);

    if enabled {
      self.inner.fetcher.prefetch(&scope);
      if self.inner.realtime.is_running() {
        let realtime = self.inner.realtime.clone();
        let target = scope.clone();
        tokio::spawn(async move {
          if let Err(e) = realtime.activate(&target).await {
            warn!("could not activate {}: {}", target, e);
          }
        });
      }
    }

    ScopeHandle {
      engine: self.clone(),
      scope,
      enabled,
      rx,
    }
  }

  fn release(&self, scope: &ScopeKey, enabled: bool) {
    let left = self.inner.registry.detach(scope, enabled);
    if !enabled || left > 0 {
      return;
    }

    self.inner.fetcher.cancel(scope);
    match tokio::runtime::Handle::try_current() {
      Ok(runtime) => {
        let realtime = self.inner.realtime.clone();
        let scope = scope.clone();
        runtime.spawn(async move { realtime.deactivate(&scope).await });
      }
      Err(_) => {
        self.inner.realtime.teardown(scope);
      }
    }
  }

  pub async fn mutate(&self, scope: &ScopeKey, mutation: Mutation) -> SyncResult<Committed> {
    self.inner.mutator.mutate(scope, mutation).await
  }

  /// One-off reads without a handle still count as use for retention.
  pub async fn ensure_fresh(&self, scope: &ScopeKey) -> SyncResult<()> {
    self.inner.registry.touch(scope);
    self.inner.fetcher.ensure_fresh(scope).await
  }

  pub async fn refetch(&self, scope: &ScopeKey) -> SyncResult<()> {
    self.inner.registry.touch(scope);
    self.inner.fetcher.refetch(scope).await
  }

  pub fn invalidate(&self, scope: &ScopeKey) {
    self.inner.store.invalidate(scope);
  }

  pub fn read(&self, scope: &ScopeKey) -> CacheEntry {
    self.inner.store.read(scope)
  }

  /// Evict entries idle past the retention window.
  pub fn sweep(&self) -> Vec<ScopeKey> {
    let realtime = &self.inner.realtime;
    self
      .inner
      .fetcher
      .sweep(&self.inner.registry, |s| realtime.is_live(s), self.inner.config.retention)
  }
}

/// What a consumer renders.
#[derive(Debug, Clone)]
pub struct ScopeView {
  pub data: Option<Arc<EntryData>>,
  pub status: FetchStatus,
  pub error: Option<SyncError>,
  pub fetched_at: Option<DateTime<Utc>>,
  pub source: Option<CacheSource>,
  pub stale: bool,
}

impl From<&CacheEntry> for ScopeView {
  fn from(entry: &CacheEntry) -> Self {
    Self {
      data: entry.data.clone(),
      status: entry.status,
      error: entry.last_error.clone(),
      fetched_at: entry.fetched_at,
      source: entry.source,
      stale: entry.stale,
    }
  }
}

impl ScopeView {
  pub fn records(&self) -> &[crate::record::Record] {
    self.data.as_deref().map_or(&[], EntryData::records)
  }

  pub fn is_loading(&self) -> bool {
    self.status == FetchStatus::Loading
  }
}

/// A consumer's attachment to a scope. Dropping it detaches.
pub struct ScopeHandle {
  engine: SyncEngine,
  scope: ScopeKey,
  enabled: bool,
  rx: watch::Receiver<CacheEntry>,
}

impl ScopeHandle {
  pub fn scope(&self) -> &ScopeKey {
    &self.scope
  }

  pub fn view(&self) -> ScopeView {
    ScopeView::from(&*self.rx.borrow())
  }

  pub fn data(&self) -> Option<Arc<EntryData>> {
    self.rx.borrow().data.clone()
  }

  /// Wait for the next change to the entry.
  pub async fn changed(&mut self) -> SyncResult<ScopeView> {
    self.rx.changed().await.map_err(|_| SyncError::Cancelled)?;
    Ok(self.view())
  }

  /// Wait until the entry is ready or has failed. Never resolves for a
  /// disabled handle on a scope nobody fetches.
  pub async fn settled(&mut self) -> SyncResult<ScopeView> {
    let entry = self
      .rx
      .wait_for(|e| matches!(e.status, FetchStatus::Ready | FetchStatus::Error))
      .await
      .map_err(|_| SyncError::Cancelled)?;
    match (&entry.status, &entry.last_error) {
      (FetchStatus::Error, Some(err)) => Err(err.clone()),
      _ => Ok(ScopeView::from(&*entry)),
    }
  }

  pub async fn mutate(&self, mutation: Mutation) -> SyncResult<Committed> {
    self.engine.mutate(&self.scope, mutation).await
  }

  pub async fn refetch(&self) -> SyncResult<()> {
    self.engine.refetch(&self.scope).await
  }
}

impl Drop for ScopeHandle {
  fn drop(&mut self) {
    self.engine.release(&self.scope, self.enabled);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::realtime::SubscriptionState;
  use crate::record::RecordId;
  use crate::remote::MemoryBackend;
  use crate::scope::ResourceKind;
  use serde_json::json;

  fn engine(backend: &Arc<MemoryBackend>, config: EngineConfig) -> SyncEngine {
    let engine = SyncEngine::new(config, backend.clone(), backend.clone());
    engine.start();
    engine
  }

  fn quick() -> EngineConfig {
    EngineConfig::default().with_settle_delay(Duration::from_millis(5))
  }

  fn tasks() -> ScopeKey {
    ScopeKey::new(ResourceKind::Task, "u1")
  }

  async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
      if check() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within one second");
  }

  #[tokio::test]
  async fn test_offline_create_shows_then_rolls_back() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(&backend, quick());
    let mut handle = engine.use_scope(tasks(), true);
    assert!(handle.settled().await.unwrap().records().is_empty());

    backend.set_offline(true);
    backend.set_mutation_latency(Duration::from_millis(40));
    let mutating = engine.clone();
    let create = tokio::spawn(async move {
      mutating
        .mutate(&tasks(), Mutation::create(json!({ "title": "Buy milk" })).unwrap())
        .await
    });

    eventually(|| handle.view().records().len() == 1).await;
    let shown = handle.view();
    assert_eq!(shown.records()[0].get_str("title"), Some("Buy milk"));
    assert!(shown.records()[0].id.is_temporary());

    assert!(create.await.unwrap().unwrap_err().is_transport());
    assert!(handle.view().records().is_empty());
  }

  #[tokio::test]
  async fn test_toggle_survives_unrelated_push() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_with_id(ResourceKind::Task, "u1", 7, json!({ "title": "seven", "done": false }));
    backend.seed_with_id(ResourceKind::Task, "u1", 42, json!({ "title": "answer", "done": false }));
    let engine = engine(&backend, quick());
    let mut handle = engine.use_scope(tasks(), true);
    handle.settled().await.unwrap();
    eventually(|| {
      engine.realtime().subscription(&tasks()).map(|s| s.state) == Some(SubscriptionState::Subscribed)
    })
    .await;

    backend.set_mutation_latency(Duration::from_millis(50));
    let mutating = engine.clone();
    let toggle = tokio::spawn(async move {
      mutating
        .mutate(&tasks(), Mutation::toggle(42u64, false))
        .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    backend
      .server_update(ResourceKind::Task, "u1", &RecordId::from(7u64), json!({ "title": "seven, edited" }))
      .unwrap();

    let done = |view: &ScopeView, id: u64| {
      view
        .data
        .as_ref()
        .and_then(|d| d.find(&RecordId::from(id)).and_then(|r| r.get_bool("done")))
    };
    eventually(|| {
      let view = handle.view();
      view
        .data
        .as_ref()
        .and_then(|d| d.find(&RecordId::from(7u64)).and_then(|r| r.get_str("title").map(String::from)))
        .as_deref()
        == Some("seven, edited")
    })
    .await;
    assert_eq!(done(&handle.view(), 42), Some(true));

    toggle.await.unwrap().unwrap();
    assert_eq!(done(&handle.view(), 42), Some(true));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(done(&handle.view(), 42), Some(true));
  }

  #[tokio::test]
  async fn test_two_consumers_share_subscription_and_data() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(&backend, quick());
    let mut first = engine.use_scope(tasks(), true);
    let second = engine.use_scope(tasks(), true);
    first.settled().await.unwrap();
    eventually(|| engine.realtime().is_live(&tasks())).await;

    engine
      .mutate(&tasks(), Mutation::create(json!({ "title": "shared" })).unwrap())
      .await
      .unwrap();

    let (a, b) = (first.data().unwrap(), second.data().unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.len(), 1);
    assert_eq!(backend.subscribe_count(), 1);
    assert_eq!(backend.peak_channels(), 1);
  }

  #[tokio::test]
  async fn test_rapid_attach_detach_keeps_one_channel() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(&backend, quick());

    for _ in 0..25 {
      let handle = engine.use_scope(tasks(), true);
      tokio::task::yield_now().await;
      drop(handle);
    }
    let _kept = engine.use_scope(tasks(), true);

    eventually(|| engine.realtime().is_live(&tasks()) && backend.open_channels() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.open_channels(), 1);
    assert!(backend.peak_channels() <= 1);
  }

  #[tokio::test]
  async fn test_last_detach_closes_channel() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(&backend, quick());
    let handle = engine.use_scope(tasks(), true);
    eventually(|| backend.open_channels() == 1).await;

    drop(handle);

    eventually(|| backend.open_channels() == 0).await;
    assert!(!engine.realtime().is_live(&tasks()));
  }

  #[tokio::test]
  async fn test_disabled_handle_does_not_fetch() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(&backend, quick());
    let handle = engine.use_scope(tasks(), false);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(backend.query_count(), 0);
    assert_eq!(backend.subscribe_count(), 0);
    assert_eq!(handle.view().status, FetchStatus::Absent);
  }

  #[tokio::test]
  async fn test_fresh_scope_is_not_refetched_on_reattach() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(&backend, quick());
    let mut handle = engine.use_scope(tasks(), true);
    handle.settled().await.unwrap();
    drop(handle);

    let mut again = engine.use_scope(tasks(), true);
    again.settled().await.unwrap();
    assert_eq!(backend.query_count(), 1);
  }

  #[tokio::test]
  async fn test_sweep_evicts_only_released_scopes() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(&backend, quick().with_retention(Duration::ZERO));
    let categories = ScopeKey::new(ResourceKind::Category, "u1");

    let mut kept = engine.use_scope(tasks(), true);
    let mut released = engine.use_scope(categories.clone(), true);
    kept.settled().await.unwrap();
    released.settled().await.unwrap();
    drop(released);
    eventually(|| !engine.realtime().is_live(&categories)).await;

    assert_eq!(engine.sweep(), vec![categories.clone()]);
    assert!(!engine.store().contains(&categories));
    assert!(engine.store().contains(&tasks()));
  }

  #[tokio::test]
  async fn test_handleless_read_postpones_eviction() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine(&backend, quick().with_retention(Duration::from_millis(100)));

    let mut handle = engine.use_scope(tasks(), true);
    assert!(handle.view().is_loading());
    handle.settled().await.unwrap();
    assert!(!handle.view().is_loading());
    drop(handle);
    eventually(|| !engine.realtime().is_live(&tasks())).await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    engine.ensure_fresh(&tasks()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(engine.sweep().is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(engine.sweep(), vec![tasks()]);
  }

  #[tokio::test]
  async fn test_cold_start_offline_serves_persisted_snapshot() {
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(ResourceKind::Task, "u1", json!({ "title": "remembered" }));

    let first = SyncEngine::with_storage(quick(), backend.clone(), backend.clone(), storage.clone());
    first.ensure_fresh(&tasks()).await.unwrap();
    first.stop();

    backend.set_offline(true);
    let second = SyncEngine::with_storage(quick(), backend.clone(), backend.clone(), storage);
    let mut handle = second.use_scope(tasks(), true);

    assert!(handle.settled().await.unwrap_err().is_transport());
    let view = handle.view();
    assert_eq!(view.status, FetchStatus::Error);
    assert_eq!(view.source, Some(CacheSource::Persisted));
    assert_eq!(view.records()[0].get_str("title"), Some("remembered"));
  }
}
