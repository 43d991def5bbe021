//! Scope keys and consumer accounting.
//!
//! A [`ScopeKey`] names one cached collection: a resource type, the owner it
//! belongs to, and an optional equality filter. Every cache entry, realtime
//! subscription and mutation is addressed by exactly one key.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SyncError;
use crate::resources::{self, ResourceDescriptor};

/// The resource types the client caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
  Task,
  LedgerEntry,
  Category,
  Profile,
}

impl ResourceKind {
  pub const ALL: [ResourceKind; 4] = [
    ResourceKind::Task,
    ResourceKind::LedgerEntry,
    ResourceKind::Category,
    ResourceKind::Profile,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceKind::Task => "task",
      ResourceKind::LedgerEntry => "ledger_entry",
      ResourceKind::Category => "category",
      ResourceKind::Profile => "profile",
    }
  }

  pub fn descriptor(&self) -> &'static ResourceDescriptor {
    resources::descriptor(*self)
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceKind {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "task" | "tasks" => Ok(ResourceKind::Task),
      "ledger_entry" | "ledger" | "entry" | "entries" => Ok(ResourceKind::LedgerEntry),
      "category" | "categories" => Ok(ResourceKind::Category),
      "profile" => Ok(ResourceKind::Profile),
      other => Err(SyncError::Config(format!("unknown resource type '{}'", other))),
    }
  }
}

/// Equality constraints narrowing a scope, e.g. `month = 2026-10`.
///
/// Backed by a `BTreeMap` so two filters with the same constraints compare
/// and hash equal regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Filter(BTreeMap<String, String>);

impl Filter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
    self.0.insert(field.into(), value.into());
    self
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
    self.0.iter()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

/// Address of one cached collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
  resource: ResourceKind,
  owner: String,
  filter: Option<Filter>,
}

impl ScopeKey {
  pub fn new(resource: ResourceKind, owner: impl Into<String>) -> Self {
    Self {
      resource,
      owner: owner.into(),
      filter: None,
    }
  }

  /// Narrow the scope. An empty filter is the same scope as no filter.
  pub fn with_filter(mut self, filter: Filter) -> Self {
    self.filter = if filter.is_empty() { None } else { Some(filter) };
    self
  }

  pub fn resource(&self) -> ResourceKind {
    self.resource
  }

  pub fn owner(&self) -> &str {
    &self.owner
  }

  pub fn filter(&self) -> Option<&Filter> {
    self.filter.as_ref()
  }

  /// True when this scope holds `resource` records of `owner`, whatever its
  /// filter.
  pub fn same_collection(&self, resource: ResourceKind, owner: &str) -> bool {
    self.resource == resource && self.owner == owner
  }

  /// Stable, fixed-length key used for persisted snapshots.
  pub fn cache_hash(&self) -> String {
    let mut input = format!("{}:{}", self.resource, self.owner);
    if let Some(filter) = &self.filter {
      for (field, value) in filter.iter() {
        input.push_str(&format!(":{}={}", field, value));
      }
    }

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn description(&self) -> String {
    match &self.filter {
      None => format!("{} for {}", self.resource, self.owner),
      Some(filter) => {
        let parts: Vec<String> = filter.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{} for {} where {}", self.resource, self.owner, parts.join(", "))
      }
    }
  }
}

impl fmt::Display for ScopeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description())
  }
}

#[derive(Debug, Clone)]
struct ScopeUsage {
  enabled: usize,
  observers: usize,
  last_used: Instant,
}

/// Tracks which consumers are attached to which scope.
///
/// A scope is *active* while at least one consumer with fetching enabled
/// is attached; that is what keeps its realtime subscription open. Passive
/// observers only pin the entry against retention eviction.
#[derive(Clone, Default)]
pub struct ScopeRegistry {
  usage: Arc<Mutex<HashMap<ScopeKey, ScopeUsage>>>,
}

impl ScopeRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a consumer. Returns the number of enabled consumers after
  /// attaching.
  pub fn attach(&self, scope: &ScopeKey, enabled: bool) -> usize {
    let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
    let entry = usage.entry(scope.clone()).or_insert(ScopeUsage {
      enabled: 0,
      observers: 0,
      last_used: Instant::now(),
    });
    if enabled {
      entry.enabled += 1;
    } else {
      entry.observers += 1;
    }
    entry.last_used = Instant::now();
    entry.enabled
  }

  /// Unregister a consumer. Returns the number of enabled consumers left.
  pub fn detach(&self, scope: &ScopeKey, enabled: bool) -> usize {
    let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
    match usage.get_mut(scope) {
      Some(entry) => {
        if enabled {
          entry.enabled = entry.enabled.saturating_sub(1);
        } else {
          entry.observers = entry.observers.saturating_sub(1);
        }
        entry.last_used = Instant::now();
        entry.enabled
      }
      None => 0,
    }
  }

  pub fn is_active(&self, scope: &ScopeKey) -> bool {
    let usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
    usage.get(scope).is_some_and(|u| u.enabled > 0)
  }

  pub fn consumers(&self, scope: &ScopeKey) -> usize {
    let usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
    usage.get(scope).map_or(0, |u| u.enabled + u.observers)
  }

  /// Mark the scope as used now, pushing back its retention deadline.
  pub fn touch(&self, scope: &ScopeKey) {
    let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(entry) = usage.get_mut(scope) {
      entry.last_used = Instant::now();
    }
  }

  /// Whether nothing has been attached to the scope for at least
  /// `retention`. Scopes never attached count as idle.
  pub fn idle_for(&self, scope: &ScopeKey, retention: Duration) -> bool {
    let usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
    match usage.get(scope) {
      Some(u) => u.enabled + u.observers == 0 && u.last_used.elapsed() >= retention,
      None => true,
    }
  }

  /// Drop the bookkeeping for an evicted scope.
  pub fn forget(&self, scope: &ScopeKey) {
    let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
    if usage.get(scope).is_some_and(|u| u.enabled + u.observers == 0) {
      usage.remove(scope);
    }
  }
}
