//! Scoped reads against the remote store.
//!
//! Reads run as spawned tasks that write their result into the cache store;
//! callers wait on the entry's watch channel. A caller going away never
//! strands an entry in `loading`, and concurrent callers for one scope share
//! a single read.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::cache::{CacheSource, CacheStorage, CacheStore, EntryData, FetchStatus};
use crate::error::{SyncError, SyncResult};
use crate::mutation::PendingMutations;
use crate::remote::RemoteStore;
use crate::scope::{ScopeKey, ScopeRegistry};

/// Why a read is being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
  /// Read only if the entry is not fresh.
  Ensure,
  /// Read now, superseding any read in flight.
  Force,
  /// Replace the read in flight, if any.
  Restart,
  /// Read regardless of freshness, unless a read is already running.
  Poll,
}

/// What a freshness check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchPlan {
  /// Entry is fresh, nothing to do.
  Fresh,
  /// A read is already running; wait for it.
  Join(u64),
  /// A new read was started with this epoch.
  Started(u64),
}

#[derive(Clone)]
pub struct FetchCoordinator {
  remote: Arc<dyn RemoteStore>,
  store: CacheStore,
  storage: Arc<dyn CacheStorage>,
  pending: PendingMutations,
  /// How long a successful read satisfies `ensure_fresh`
  stale_window: Duration,
}

impl FetchCoordinator {
  pub fn new(
    remote: Arc<dyn RemoteStore>,
    store: CacheStore,
    storage: Arc<dyn CacheStorage>,
    pending: PendingMutations,
    stale_window: Duration,
  ) -> Self {
    Self {
      remote,
      store,
      storage,
      pending,
      stale_window,
    }
  }

  pub fn stale_window(&self) -> Duration {
    self.stale_window
  }

  /// Make sure the scope holds data no older than the stale window.
  ///
  /// No-op when the entry is ready, not invalidated and fresh. Joins a read
  /// already in flight. Otherwise starts one; the entry's data stays
  /// visible while it runs.
  pub async fn ensure_fresh(&self, scope: &ScopeKey) -> SyncResult<()> {
    let plan = self.plan(scope, Trigger::Ensure);
    self.finish(scope, plan).await
  }

  /// Read the scope now, superseding any read in flight.
  pub async fn refetch(&self, scope: &ScopeKey) -> SyncResult<()> {
    let plan = self.plan(scope, Trigger::Force);
    self.finish(scope, plan).await
  }

  /// Read the scope on a timer: joins a read in flight, otherwise reads
  /// even when the entry is still fresh.
  pub async fn poll(&self, scope: &ScopeKey) -> SyncResult<()> {
    let plan = self.plan(scope, Trigger::Poll);
    self.finish(scope, plan).await
  }

  /// Start a read if one is needed, without waiting for it.
  pub fn prefetch(&self, scope: &ScopeKey) {
    self.plan(scope, Trigger::Ensure);
  }

  /// Replace the read in flight with a new one, so no response requested
  /// before now can land. Callers waiting on the old read follow the new
  /// one. Returns whether a read was in flight.
  pub fn restart(&self, scope: &ScopeKey) -> bool {
    self.store.contains(scope)
      && matches!(self.plan(scope, Trigger::Restart), FetchPlan::Started(_))
  }

  /// Abandon the read in flight for the scope, if any. Its result will be
  /// discarded when it arrives. Returns whether a read was cancelled.
  pub fn cancel(&self, scope: &ScopeKey) -> bool {
    self
      .store
      .modify_existing(scope, |entry| {
        if entry.status != FetchStatus::Loading {
          return false;
        }
        entry.fetch_epoch += 1;
        entry.stale = true;
        entry.status = if entry.fetched_at.is_some() {
          FetchStatus::Ready
        } else {
          FetchStatus::Absent
        };
        true
      })
      .unwrap_or(false)
  }

  /// Evict entries nobody has used for `retention`, skipping scopes whose
  /// subscription is still live. Returns the evicted scopes.
  pub fn sweep(
    &self,
    registry: &ScopeRegistry,
    is_live: impl Fn(&ScopeKey) -> bool,
    retention: Duration,
  ) -> Vec<ScopeKey> {
    let mut evicted = Vec::new();
    for scope in self.store.scopes() {
      if !registry.idle_for(&scope, retention) || is_live(&scope) {
        continue;
      }
      self.cancel(&scope);
      if self.store.evict(&scope) {
        registry.forget(&scope);
        debug!("evicted idle scope {}", scope);
        evicted.push(scope);
      }
    }
    evicted
  }

  fn plan(&self, scope: &ScopeKey, trigger: Trigger) -> FetchPlan {
    let now = Utc::now();
    let window = self.stale_window;

    let (plan, hydrate) = self.store.modify(scope, |entry| {
      let loading = entry.status == FetchStatus::Loading;
      match trigger {
        Trigger::Ensure if loading && !entry.stale => return (FetchPlan::Join(entry.fetch_epoch), false),
        Trigger::Ensure if entry.is_fresh(window, now) => return (FetchPlan::Fresh, false),
        Trigger::Restart if !loading => return (FetchPlan::Fresh, false),
        Trigger::Poll if loading => return (FetchPlan::Join(entry.fetch_epoch), false),
        _ => {}
      }
      entry.fetch_epoch += 1;
      entry.status = FetchStatus::Loading;
      entry.stale = false;
      (FetchPlan::Started(entry.fetch_epoch), entry.data.is_none())
    });

    if let FetchPlan::Started(epoch) = plan {
      debug!("fetching {} (epoch {})", scope, epoch);
      let this = self.clone();
      let scope = scope.clone();
      tokio::spawn(async move { this.run(scope, epoch, hydrate).await });
    }
    plan
  }

  async fn run(&self, scope: ScopeKey, epoch: u64, hydrate: bool) {
    let descriptor = scope.resource().descriptor();

    if hydrate {
      self.hydrate(&scope, epoch);
    }

    let result = self
      .remote
      .query(scope.resource(), scope.owner(), scope.filter())
      .await;

    match result {
      Ok(records) => {
        let landed = self
          .store
          .modify_existing(&scope, |entry| {
            if entry.fetch_epoch != epoch {
              return false;
            }
            let mut data = EntryData::from_records(descriptor, records.clone());
            let rebased = self.pending.rebase(&scope, &mut data, Utc::now());
            entry.data = Some(Arc::new(data));
            entry.status = FetchStatus::Ready;
            entry.fetched_at = Some(Utc::now());
            entry.last_error = None;
            entry.source = Some(if rebased {
              CacheSource::Optimistic
            } else {
              CacheSource::Network
            });
            true
          })
          .unwrap_or(false);

        if !landed {
          debug!("discarding superseded read of {}", scope);
          return;
        }
        if let Err(e) = self.storage.save(&scope, &records) {
          warn!("failed to persist {}: {}", scope, e);
        }
      }
      Err(err) => {
        debug!("read of {} failed: {}", scope, err);
        self.store.modify_existing(&scope, |entry| {
          if entry.fetch_epoch == epoch {
            entry.status = FetchStatus::Error;
            entry.last_error = Some(err);
          }
        });
      }
    }
  }

  /// Seed an entry that has never held data with its persisted snapshot.
  fn hydrate(&self, scope: &ScopeKey, epoch: u64) {
    let snapshot = match self.storage.load(scope) {
      Ok(Some(snapshot)) => snapshot,
      Ok(None) => return,
      Err(e) => {
        warn!("failed to load snapshot for {}: {}", scope, e);
        return;
      }
    };

    let descriptor = scope.resource().descriptor();
    self.store.modify_existing(scope, |entry| {
      if entry.fetch_epoch == epoch && entry.data.is_none() {
        debug!("hydrated {} from snapshot saved {}", scope, snapshot.saved_at);
        entry.data = Some(Arc::new(EntryData::from_records(descriptor, snapshot.records)));
        entry.source = Some(CacheSource::Persisted);
      }
    });
  }

  async fn finish(&self, scope: &ScopeKey, plan: FetchPlan) -> SyncResult<()> {
    let mut epoch = match plan {
      FetchPlan::Fresh => return Ok(()),
      FetchPlan::Join(epoch) | FetchPlan::Started(epoch) => epoch,
    };

    let mut rx = self.store.subscribe(scope);
    loop {
      let entry = rx
        .wait_for(|e| e.fetch_epoch != epoch || e.status != FetchStatus::Loading)
        .await
        .map_err(|_| SyncError::Cancelled)?
        .clone();

      if entry.fetch_epoch != epoch {
        if entry.status == FetchStatus::Loading {
          // Superseded by a newer read; follow it.
          epoch = entry.fetch_epoch;
          continue;
        }
        return Err(SyncError::Cancelled);
      }

      return match entry.status {
        FetchStatus::Ready => Ok(()),
        FetchStatus::Error => Err(
          entry
            .last_error
            .unwrap_or_else(|| SyncError::Transport("read failed".to_string())),
        ),
        _ => Err(SyncError::Cancelled),
      };
    }
  }
}
