//! In-memory cache store.
//!
//! One watch channel per scope holds the current entry. Reads and writes
//! are synchronous and happen under a single map lock that is never held
//! across an await, so every write is atomic with respect to the tasks
//! sharing the store. Consumers observe an entry by subscribing to its
//! channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use super::entry::CacheEntry;
use crate::scope::{ResourceKind, ScopeKey};

#[derive(Clone, Default)]
pub struct CacheStore {
  entries: Arc<Mutex<HashMap<ScopeKey, watch::Sender<CacheEntry>>>>,
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<ScopeKey, watch::Sender<CacheEntry>>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Current entry for the scope; an absent entry if none exists.
  pub fn read(&self, scope: &ScopeKey) -> CacheEntry {
    match self.lock().get(scope) {
      Some(tx) => tx.borrow().clone(),
      None => CacheEntry::absent(scope.clone()),
    }
  }

  pub fn contains(&self, scope: &ScopeKey) -> bool {
    self.lock().contains_key(scope)
  }

  /// Transform the entry, creating it if needed. Last write wins.
  pub fn write(&self, scope: &ScopeKey, transform: impl FnOnce(&mut CacheEntry)) {
    self.modify(scope, transform)
  }

  /// Like [`write`](Self::write) but hands back a value computed from the
  /// entry inside the same critical section.
  pub(crate) fn modify<R>(&self, scope: &ScopeKey, f: impl FnOnce(&mut CacheEntry) -> R) -> R {
    let mut entries = self.lock();
    let tx = entries
      .entry(scope.clone())
      .or_insert_with(|| watch::Sender::new(CacheEntry::absent(scope.clone())));
    let mut entry = tx.borrow().clone();
    let out = f(&mut entry);
    tx.send_replace(entry);
    out
  }

  /// Transform the entry only if it exists.
  pub(crate) fn modify_existing<R>(
    &self,
    scope: &ScopeKey,
    f: impl FnOnce(&mut CacheEntry) -> R,
  ) -> Option<R> {
    let entries = self.lock();
    let tx = entries.get(scope)?;
    let mut entry = tx.borrow().clone();
    let out = f(&mut entry);
    tx.send_replace(entry);
    Some(out)
  }

  /// Mark the entry stale without touching its data, so consumers keep
  /// showing the last known state while a refetch runs.
  pub fn invalidate(&self, scope: &ScopeKey) {
    self.modify_existing(scope, |entry| entry.stale = true);
  }

  /// Drop the entry. Observers see their channel close.
  pub fn evict(&self, scope: &ScopeKey) -> bool {
    self.lock().remove(scope).is_some()
  }

  /// Observe the entry, creating an absent one if needed.
  pub fn subscribe(&self, scope: &ScopeKey) -> watch::Receiver<CacheEntry> {
    let mut entries = self.lock();
    entries
      .entry(scope.clone())
      .or_insert_with(|| watch::Sender::new(CacheEntry::absent(scope.clone())))
      .subscribe()
  }

  pub fn scopes(&self) -> Vec<ScopeKey> {
    self.lock().keys().cloned().collect()
  }

  /// Every cached scope holding `resource` records of `owner`.
  pub fn scopes_for(&self, resource: ResourceKind, owner: &str) -> Vec<ScopeKey> {
    self
      .lock()
      .keys()
      .filter(|scope| scope.same_collection(resource, owner))
      .cloned()
      .collect()
  }
}
