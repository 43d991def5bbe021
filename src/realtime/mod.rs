//! Realtime push invalidation.
//!
//! The [`SyncManager`] keeps at most one channel per active scope. Each
//! channel gets a listener task that invalidates and refetches the scope on
//! every matching change. Scopes whose channel cannot be opened, or whose
//! stream ends, are refreshed by polling instead.

pub mod transport;

pub use transport::{
  Channel, ChannelHandle, ChannelStatus, ChangeEvent, ChangeOp, PollingOnly, PushMessage, PushTransport,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::error::{SyncError, SyncResult};
use crate::fetch::FetchCoordinator;
use crate::scope::{ScopeKey, ScopeRegistry};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Where a scope's live updates currently come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
  /// Channel open, waiting for the transport to confirm
  Connecting,
  Subscribed,
  /// Transport dropped the connection and is retrying
  Reconnecting,
  /// No channel; the scope is refetched on a fixed interval
  Polling,
}

impl fmt::Display for SubscriptionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SubscriptionState::Connecting => write!(f, "connecting"),
      SubscriptionState::Subscribed => write!(f, "subscribed"),
      SubscriptionState::Reconnecting => write!(f, "reconnecting"),
      SubscriptionState::Polling => write!(f, "polling"),
    }
  }
}

/// Public view of a scope's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
  pub scope: ScopeKey,
  pub handle: Option<ChannelHandle>,
  pub state: SubscriptionState,
}

struct Slot {
  generation: u64,
  handle: Option<ChannelHandle>,
  state: SubscriptionState,
  task: JoinHandle<()>,
}

struct SyncInner {
  transport: Arc<dyn PushTransport>,
  store: CacheStore,
  fetcher: FetchCoordinator,
  registry: ScopeRegistry,
  poll_interval: Duration,
  running: AtomicBool,
  generation: AtomicU64,
  slots: Mutex<HashMap<ScopeKey, Slot>>,
  /// Serializes activate/deactivate per scope across the subscribe await.
  gates: Mutex<HashMap<ScopeKey, Arc<tokio::sync::Mutex<()>>>>,
}

/// Owns every push channel of the process. Constructed once and shared by
/// cloning; `start` and `stop` bound its lifetime.
#[derive(Clone)]
pub struct SyncManager {
  inner: Arc<SyncInner>,
}

impl SyncManager {
  pub fn new(
    transport: Arc<dyn PushTransport>,
    store: CacheStore,
    fetcher: FetchCoordinator,
    registry: ScopeRegistry,
    poll_interval: Duration,
  ) -> Self {
    Self {
      inner: Arc::new(SyncInner {
        transport,
        store,
        fetcher,
        registry,
        poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        running: AtomicBool::new(false),
        generation: AtomicU64::new(0),
        slots: Mutex::new(HashMap::new()),
        gates: Mutex::new(HashMap::new()),
      }),
    }
  }

  pub fn start(&self) {
    self.inner.running.store(true, Ordering::SeqCst);
  }

  /// Close every channel and stop every listener and poller.
  pub fn stop(&self) {
    self.inner.running.store(false, Ordering::SeqCst);
    let drained: Vec<(ScopeKey, Slot)> = self.inner.slots().drain().collect();
    for (scope, slot) in drained {
      self.inner.close(&scope, slot);
    }
    // Gates stay: an activation may still hold one across this stop.
  }

  pub fn is_running(&self) -> bool {
    self.inner.running.load(Ordering::SeqCst)
  }

  /// Open the scope's channel if it has none. A scope that is no longer
  /// active by the time the gate is acquired is left alone.
  pub async fn activate(&self, scope: &ScopeKey) -> SyncResult<()> {
    if !self.is_running() {
      return Err(SyncError::Stopped);
    }

    let gate = self.inner.gate(scope);
    let _guard = gate.lock().await;

    if !self.inner.registry.is_active(scope) || self.inner.slots().contains_key(scope) {
      return Ok(());
    }

    let subscribed = self
      .inner
      .transport
      .subscribe(scope.resource(), scope.owner())
      .await;

    match subscribed {
      Ok(channel) => {
        if !self.is_running() || !self.inner.registry.is_active(scope) {
          debug!("{} went inactive while subscribing, closing {}", scope, channel.handle);
          self.inner.transport.unsubscribe(channel.handle);
          return Ok(());
        }
        info!("subscribed to {} on channel {}", scope, channel.handle);
        let handle = channel.handle;
        self.inner.install(scope, Some(handle), SubscriptionState::Connecting, |inner, generation| {
          tokio::spawn(listen(inner, scope.clone(), generation, channel.messages))
        });
        Ok(())
      }
      Err(e) => {
        warn!("subscription for {} failed, polling instead: {}", scope, e);
        if self.is_running() && self.inner.registry.is_active(scope) {
          self.inner.install(scope, None, SubscriptionState::Polling, |inner, generation| {
            tokio::spawn(poll(inner, scope.clone(), generation))
          });
        }
        Ok(())
      }
    }
  }

  /// Close the scope's channel unless a consumer re-activated it meanwhile.
  pub async fn deactivate(&self, scope: &ScopeKey) {
    let gate = self.inner.gate(scope);
    let _guard = gate.lock().await;
    if self.inner.registry.is_active(scope) {
      return;
    }
    self.teardown(scope);
  }

  /// Close the scope's channel now. Returns whether one was open.
  pub fn teardown(&self, scope: &ScopeKey) -> bool {
    let slot = self.inner.slots().remove(scope);
    match slot {
      Some(slot) => {
        self.inner.close(scope, slot);
        true
      }
      None => false,
    }
  }

  /// Whether the scope has a channel or poller.
  pub fn is_live(&self, scope: &ScopeKey) -> bool {
    self.inner.slots().contains_key(scope)
  }

  pub fn subscription(&self, scope: &ScopeKey) -> Option<Subscription> {
    self.inner.slots().get(scope).map(|slot| Subscription {
      scope: scope.clone(),
      handle: slot.handle,
      state: slot.state,
    })
  }

  pub fn live_count(&self) -> usize {
    self.inner.slots().len()
  }
}

impl SyncInner {
  fn slots(&self) -> MutexGuard<'_, HashMap<ScopeKey, Slot>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn gates(&self) -> MutexGuard<'_, HashMap<ScopeKey, Arc<tokio::sync::Mutex<()>>>> {
    self.gates.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn gate(&self, scope: &ScopeKey) -> Arc<tokio::sync::Mutex<()>> {
    self.gates().entry(scope.clone()).or_default().clone()
  }

  /// Fill the scope's slot. Any previous occupant is closed first, so two
  /// channels never coexist for one scope.
  fn install(
    self: &Arc<Self>,
    scope: &ScopeKey,
    handle: Option<ChannelHandle>,
    state: SubscriptionState,
    spawn: impl FnOnce(Arc<SyncInner>, u64) -> JoinHandle<()>,
  ) {
    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let mut slots = self.slots();
    if let Some(previous) = slots.remove(scope) {
      self.close(scope, previous);
    }
    let task = spawn(self.clone(), generation);
    slots.insert(
      scope.clone(),
      Slot {
        generation,
        handle,
        state,
        task,
      },
    );
  }

  fn close(&self, scope: &ScopeKey, slot: Slot) {
    slot.task.abort();
    if let Some(handle) = slot.handle {
      self.transport.unsubscribe(handle);
      info!("closed channel {} for {}", handle, scope);
    } else {
      debug!("stopped polling {}", scope);
    }
  }

  /// Record a state change from the slot's own task. Tasks of a replaced
  /// slot are ignored.
  fn set_state(&self, scope: &ScopeKey, generation: u64, state: SubscriptionState) -> bool {
    match self.slots().get_mut(scope) {
      Some(slot) if slot.generation == generation => {
        slot.state = state;
        if state == SubscriptionState::Polling {
          slot.handle = None;
        }
        true
      }
      _ => false,
    }
  }

  fn refresh(&self, scope: &ScopeKey) {
    self.store.invalidate(scope);
    let fetcher = self.fetcher.clone();
    let scope = scope.clone();
    tokio::spawn(async move {
      if let Err(e) = fetcher.ensure_fresh(&scope).await {
        debug!("push refresh of {} failed: {}", scope, e);
      }
    });
  }
}

async fn listen(
  inner: Arc<SyncInner>,
  scope: ScopeKey,
  generation: u64,
  mut messages: mpsc::UnboundedReceiver<PushMessage>,
) {
  let mut reconnecting = false;

  while let Some(message) = messages.recv().await {
    match message {
      PushMessage::Change(event) if event.matches(&scope) => {
        debug!("{:?} on {} invalidates {}", event.operation, event.resource, scope);
        inner.refresh(&scope);
      }
      PushMessage::Change(_) => {}
      PushMessage::Status(ChannelStatus::Subscribed) => {
        inner.set_state(&scope, generation, SubscriptionState::Subscribed);
        // Changes made while disconnected were never delivered.
        if reconnecting {
          reconnecting = false;
          inner.refresh(&scope);
        }
      }
      PushMessage::Status(ChannelStatus::Reconnecting) => {
        reconnecting = true;
        inner.set_state(&scope, generation, SubscriptionState::Reconnecting);
      }
      PushMessage::Status(ChannelStatus::Closed) => break,
    }
  }

  if !inner.set_state(&scope, generation, SubscriptionState::Polling) {
    return;
  }
  warn!("channel for {} ended, polling instead", scope);
  inner.refresh(&scope);
  poll(inner, scope, generation).await;
}

async fn poll(inner: Arc<SyncInner>, scope: ScopeKey, generation: u64) {
  let mut ticker = tokio::time::interval(inner.poll_interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  // The first tick completes immediately; the initial fetch is the
  // consumer's.
  ticker.tick().await;

  loop {
    ticker.tick().await;
    let current = inner.slots().get(&scope).is_some_and(|s| s.generation == generation);
    if !current {
      return;
    }
    if let Err(e) = inner.fetcher.poll(&scope).await {
      debug!("poll of {} failed: {}", scope, e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, NoopStorage};
  use crate::mutation::PendingMutations;
  use crate::remote::MemoryBackend;
  use crate::scope::ResourceKind;
  use serde_json::json;

  struct Fixture {
    backend: Arc<MemoryBackend>,
    store: CacheStore,
    fetcher: FetchCoordinator,
    registry: ScopeRegistry,
    manager: SyncManager,
  }

  fn fixture(poll_interval: Duration) -> Fixture {
    let backend = Arc::new(MemoryBackend::new());
    let store = CacheStore::new();
    let storage: Arc<dyn CacheStorage> = Arc::new(NoopStorage);
    let fetcher = FetchCoordinator::new(
      backend.clone(),
      store.clone(),
      storage,
      PendingMutations::new(),
      Duration::from_secs(30),
    );
    let registry = ScopeRegistry::new();
    let manager = SyncManager::new(
      backend.clone(),
      store.clone(),
      fetcher.clone(),
      registry.clone(),
      poll_interval,
    );
    manager.start();
    Fixture {
      backend,
      store,
      fetcher,
      registry,
      manager,
    }
  }

  fn tasks(owner: &str) -> ScopeKey {
    ScopeKey::new(ResourceKind::Task, owner)
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
  async fn test_concurrent_activations_open_one_channel() {
    let f = fixture(Duration::from_secs(30));
    let scope = tasks("u1");
    f.registry.attach(&scope, true);

    let (a, b, c) = tokio::join!(
      f.manager.activate(&scope),
      f.manager.activate(&scope),
      f.manager.activate(&scope)
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    assert_eq!(f.backend.subscribe_count(), 1);
    assert_eq!(f.backend.open_channels(), 1);
    assert_eq!(f.manager.live_count(), 1);
  }

  #[tokio::test]
  async fn test_activate_after_detach_is_skipped() {
    let f = fixture(Duration::from_secs(30));
    let scope = tasks("u1");

    f.manager.activate(&scope).await.unwrap();

    assert_eq!(f.backend.subscribe_count(), 0);
    assert!(!f.manager.is_live(&scope));
  }

  #[tokio::test]
  async fn test_push_change_refreshes_scope() {
    let f = fixture(Duration::from_secs(30));
    let scope = tasks("u1");
    f.registry.attach(&scope, true);
    f.fetcher.ensure_fresh(&scope).await.unwrap();
    f.manager.activate(&scope).await.unwrap();
    eventually(|| {
      f.manager.subscription(&scope).map(|s| s.state) == Some(SubscriptionState::Subscribed)
    })
    .await;

    f.backend.seed(ResourceKind::Task, "u1", json!({ "title": "from another device" }));

    eventually(|| f.store.read(&scope).records().len() == 1).await;
    assert_eq!(f.backend.query_count(), 2);
  }

  #[tokio::test]
  async fn test_push_delete_refreshes_scope() {
    let f = fixture(Duration::from_secs(30));
    let scope = tasks("u1");
    let record = f.backend.seed(ResourceKind::Task, "u1", json!({ "title": "doomed" }));
    f.registry.attach(&scope, true);
    f.fetcher.ensure_fresh(&scope).await.unwrap();
    f.manager.activate(&scope).await.unwrap();
    eventually(|| {
      f.manager.subscription(&scope).map(|s| s.state) == Some(SubscriptionState::Subscribed)
    })
    .await;
    assert_eq!(f.store.read(&scope).records().len(), 1);

    f.backend
      .server_delete(ResourceKind::Task, "u1", &record.id)
      .unwrap();

    eventually(|| f.store.read(&scope).records().is_empty()).await;
  }

  #[tokio::test]
  async fn test_other_owner_changes_are_ignored() {
    let f = fixture(Duration::from_secs(30));
    let scope = tasks("u1");
    f.registry.attach(&scope, true);
    f.fetcher.ensure_fresh(&scope).await.unwrap();
    f.manager.activate(&scope).await.unwrap();

    f.backend.seed(ResourceKind::Task, "u2", json!({ "title": "not mine" }));
    f.backend.seed(ResourceKind::Category, "u1", json!({ "name": "Food" }));
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(f.backend.query_count(), 1);
    assert!(!f.store.read(&scope).stale);
  }

  #[tokio::test]
  async fn test_refused_subscription_falls_back_to_polling() {
    let f = fixture(Duration::from_millis(20));
    let scope = tasks("u1");
    f.registry.attach(&scope, true);
    f.backend.refuse_subscriptions(true);
    f.fetcher.ensure_fresh(&scope).await.unwrap();

    assert!(f.manager.activate(&scope).await.is_ok());
    assert_eq!(
      f.manager.subscription(&scope).map(|s| s.state),
      Some(SubscriptionState::Polling)
    );

    f.backend.seed(ResourceKind::Task, "u1", json!({ "title": "picked up by poll" }));
    eventually(|| f.store.read(&scope).records().len() == 1).await;
  }

  #[tokio::test]
  async fn test_reconnect_triggers_refresh() {
    let f = fixture(Duration::from_secs(30));
    let scope = tasks("u1");
    f.registry.attach(&scope, true);
    f.fetcher.ensure_fresh(&scope).await.unwrap();
    f.manager.activate(&scope).await.unwrap();

    f.backend.broadcast_status(ChannelStatus::Reconnecting);
    eventually(|| {
      f.manager.subscription(&scope).map(|s| s.state) == Some(SubscriptionState::Reconnecting)
    })
    .await;
    f.backend.broadcast_status(ChannelStatus::Subscribed);

    eventually(|| f.backend.query_count() == 2).await;
  }

  #[tokio::test]
  async fn test_severed_stream_switches_to_polling() {
    let f = fixture(Duration::from_secs(30));
    let scope = tasks("u1");
    f.registry.attach(&scope, true);
    f.manager.activate(&scope).await.unwrap();

    f.backend.sever_channels();

    eventually(|| {
      f.manager.subscription(&scope).map(|s| s.state) == Some(SubscriptionState::Polling)
    })
    .await;
    assert!(f.manager.subscription(&scope).is_some_and(|s| s.handle.is_none()));
  }

  #[tokio::test]
  async fn test_deactivate_respects_reattached_consumer() {
    let f = fixture(Duration::from_secs(30));
    let scope = tasks("u1");
    f.registry.attach(&scope, true);
    f.manager.activate(&scope).await.unwrap();

    f.registry.detach(&scope, true);
    f.registry.attach(&scope, true);
    f.manager.deactivate(&scope).await;
    assert!(f.manager.is_live(&scope));

    f.registry.detach(&scope, true);
    f.manager.deactivate(&scope).await;
    assert!(!f.manager.is_live(&scope));
    assert_eq!(f.backend.open_channels(), 0);
  }

  #[tokio::test]
  async fn test_stop_closes_everything() {
    let f = fixture(Duration::from_secs(30));
    for owner in ["u1", "u2"] {
      f.registry.attach(&tasks(owner), true);
      f.manager.activate(&tasks(owner)).await.unwrap();
    }
    assert_eq!(f.backend.open_channels(), 2);

    f.manager.stop();

    assert_eq!(f.backend.open_channels(), 0);
    assert_eq!(f.manager.live_count(), 0);
    assert_eq!(f.manager.activate(&tasks("u1")).await, Err(SyncError::Stopped));
  }

  #[tokio::test]
  async fn test_restart_after_stop_still_opens_one_channel() {
    let f = fixture(Duration::from_secs(30));
    let scope = tasks("u1");
    f.registry.attach(&scope, true);
    f.manager.activate(&scope).await.unwrap();

    f.manager.stop();
    f.manager.start();
    let before = f.backend.subscribe_count();
    let (a, b, c) = tokio::join!(
      f.manager.activate(&scope),
      f.manager.activate(&scope),
      f.manager.activate(&scope)
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    assert_eq!(f.backend.subscribe_count(), before + 1);
    assert_eq!(f.backend.open_channels(), 1);
    assert_eq!(f.manager.live_count(), 1);
  }

  #[tokio::test]
  async fn test_poll_tick_joins_read_in_flight() {
    let f = fixture(Duration::from_millis(20));
    let scope = tasks("u1");
    f.registry.attach(&scope, true);
    f.backend.refuse_subscriptions(true);
    f.fetcher.ensure_fresh(&scope).await.unwrap();
    f.manager.activate(&scope).await.unwrap();

    // Reads outlast two poll ticks; ticks must not pile up extra reads.
    f.backend.set_query_latency(Duration::from_millis(50));
    let reads = f.backend.query_count();
    f.store.invalidate(&scope);
    f.fetcher.prefetch(&scope);
    tokio::time::sleep(Duration::from_millis(45)).await;

    assert_eq!(f.backend.query_count(), reads + 1);
  }
}
