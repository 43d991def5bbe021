//! Cache entries and the list primitives mutations are built from.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::SyncError;
use crate::record::{Record, RecordId};
use crate::resources::ResourceDescriptor;
use crate::scope::ScopeKey;

/// Fetch lifecycle of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
  /// No successful fetch yet in this process.
  Absent,
  Loading,
  Ready,
  Error,
}

/// Where the data currently held by an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Last successful remote read
  Network,
  /// Snapshot loaded from disk, not yet confirmed by the server
  Persisted,
  /// Carries at least one local change the server has not confirmed
  Optimistic,
}

/// Materialized data of one scope.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryData {
  /// Records in server order.
  List(Vec<Record>),
  Single(Option<Record>),
}

impl EntryData {
  /// Shape a server result according to the resource.
  pub fn from_records(descriptor: &ResourceDescriptor, records: Vec<Record>) -> Self {
    if descriptor.singleton {
      EntryData::Single(records.into_iter().next())
    } else {
      EntryData::List(records)
    }
  }

  pub fn records(&self) -> &[Record] {
    match self {
      EntryData::List(list) => list,
      EntryData::Single(one) => one.as_slice(),
    }
  }

  pub fn len(&self) -> usize {
    self.records().len()
  }

  pub fn is_empty(&self) -> bool {
    self.records().is_empty()
  }

  pub fn find(&self, id: &RecordId) -> Option<&Record> {
    self.records().iter().find(|r| &r.id == id)
  }

  pub fn contains(&self, id: &RecordId) -> bool {
    self.find(id).is_some()
  }

  fn find_mut(&mut self, id: &RecordId) -> Option<&mut Record> {
    match self {
      EntryData::List(list) => list.iter_mut().find(|r| &r.id == id),
      EntryData::Single(one) => one.as_mut().filter(|r| &r.id == id),
    }
  }

  /// Place a new record according to the resource's ordering. A singleton
  /// is replaced outright.
  pub fn insert(&mut self, descriptor: &ResourceDescriptor, record: Record) {
    match self {
      EntryData::List(list) => {
        let at = descriptor.insert_position(list, &record);
        list.insert(at, record);
      }
      EntryData::Single(one) => *one = Some(record),
    }
  }

  /// Patch a record in place. Returns false when the record is not held.
  pub fn update(&mut self, id: &RecordId, patch: &Map<String, Value>, now: DateTime<Utc>) -> bool {
    match self.find_mut(id) {
      Some(record) => {
        record.apply_patch(patch, now);
        true
      }
      None => false,
    }
  }

  pub fn remove(&mut self, id: &RecordId) -> Option<Record> {
    match self {
      EntryData::List(list) => {
        let at = list.iter().position(|r| &r.id == id)?;
        Some(list.remove(at))
      }
      EntryData::Single(one) => {
        if one.as_ref().is_some_and(|r| &r.id == id) {
          one.take()
        } else {
          None
        }
      }
    }
  }

  /// Merge a server-confirmed record.
  ///
  /// The slot is found by `replacing` (the provisional id of an optimistic
  /// create) first, then by the record's own id; otherwise the record is
  /// inserted in canonical position. Merging the same record twice leaves
  /// the data unchanged.
  pub fn merge(&mut self, descriptor: &ResourceDescriptor, record: Record, replacing: Option<&RecordId>) {
    if let EntryData::List(list) = self {
      let slot = replacing
        .and_then(|temp| list.iter().position(|r| &r.id == temp))
        .or_else(|| list.iter().position(|r| r.id == record.id));

      if let Some(at) = slot {
        list[at] = record;
        // A refetch may already have delivered the server copy while the
        // provisional one was still present.
        let id = list[at].id.clone();
        let mut index = 0;
        list.retain(|r| {
          let keep = index == at || r.id != id;
          index += 1;
          keep
        });
        return;
      }
    }
    self.insert(descriptor, record);
  }
}

/// The cached materialization of one scope plus freshness metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub scope: ScopeKey,
  pub data: Option<Arc<EntryData>>,
  /// Time of the last successful remote read
  pub fetched_at: Option<DateTime<Utc>>,
  pub status: FetchStatus,
  pub last_error: Option<SyncError>,
  /// Set by invalidation; forces the next `ensure_fresh` to refetch.
  pub stale: bool,
  pub source: Option<CacheSource>,
  /// Bumped whenever a fetch starts or is cancelled; a completing fetch
  /// only lands if the epoch still matches.
  pub(crate) fetch_epoch: u64,
}

impl CacheEntry {
  pub fn absent(scope: ScopeKey) -> Self {
    Self {
      scope,
      data: None,
      fetched_at: None,
      status: FetchStatus::Absent,
      last_error: None,
      stale: false,
      source: None,
      fetch_epoch: 0,
    }
  }

  pub fn records(&self) -> &[Record] {
    self.data.as_deref().map_or(&[], EntryData::records)
  }

  /// Whether a read can be skipped: ready, not invalidated, and younger
  /// than `window`.
  pub fn is_fresh(&self, window: Duration, now: DateTime<Utc>) -> bool {
    if self.status != FetchStatus::Ready || self.stale {
      return false;
    }
    match (self.fetched_at, chrono::Duration::from_std(window)) {
      (Some(at), Ok(window)) => now - at < window,
      _ => false,
    }
  }

  /// Apply `f` to a copy of the data and swap it in, so observers holding
  /// the previous `Arc` keep an unchanged view. Returns `None` when the
  /// entry holds no data.
  pub fn edit_data<R>(&mut self, f: impl FnOnce(&mut EntryData) -> R) -> Option<R> {
    let current = self.data.as_ref()?;
    let mut next = EntryData::clone(current);
    let out = f(&mut next);
    self.data = Some(Arc::new(next));
    Some(out)
  }
}
