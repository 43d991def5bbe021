//! Resource descriptors and typed views of the cached resources.
//!
//! The engine is generic: everything it needs to know about a resource
//! type (where it lives remotely, how lists are ordered, which flag a toggle
//! flips) comes from a [`ResourceDescriptor`].

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{Record, RecordId};
use crate::scope::ResourceKind;

/// Canonical ordering of a resource's collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
  /// Most recently created first.
  NewestFirst,
  OldestFirst,
  /// Ascending by an attribute.
  ByField(&'static str),
}

#[derive(Debug)]
pub struct ResourceDescriptor {
  pub kind: ResourceKind,
  /// Remote table name
  pub table: &'static str,
  /// Column holding the owner id
  pub owner_field: &'static str,
  pub placement: Placement,
  /// Boolean attribute flipped by a toggle, if the resource has one
  pub toggle_field: Option<&'static str>,
  /// Scopes hold one record rather than a list
  pub singleton: bool,
}

impl ResourceDescriptor {
  /// Index at which a new record belongs in a list kept in canonical order.
  pub fn insert_position(&self, list: &[Record], record: &Record) -> usize {
    match self.placement {
      Placement::NewestFirst => 0,
      Placement::OldestFirst => list.len(),
      Placement::ByField(field) => list
        .iter()
        .position(|existing| compare_field(existing.get(field), record.get(field)) == Ordering::Greater)
        .unwrap_or(list.len()),
    }
  }

  /// Sort clause understood by the REST backend.
  pub fn order_clause(&self) -> String {
    match self.placement {
      Placement::NewestFirst => "created_at.desc".to_string(),
      Placement::OldestFirst => "created_at.asc".to_string(),
      Placement::ByField(field) => format!("{}.asc", field),
    }
  }
}

/// Order two attribute values; missing values sort last.
pub fn compare_field(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  match (a, b) {
    (Some(Value::Number(x)), Some(Value::Number(y))) => {
      let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
      x.partial_cmp(&y).unwrap_or(Ordering::Equal)
    }
    (Some(Value::String(x)), Some(Value::String(y))) => x.to_lowercase().cmp(&y.to_lowercase()),
    (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    (Some(_), None) => Ordering::Less,
    (None, Some(_)) => Ordering::Greater,
    (None, None) => Ordering::Equal,
  }
}

pub static TASKS: ResourceDescriptor = ResourceDescriptor {
  kind: ResourceKind::Task,
  table: "tasks",
  owner_field: "user_id",
  placement: Placement::NewestFirst,
  toggle_field: Some("done"),
  singleton: false,
};

pub static LEDGER_ENTRIES: ResourceDescriptor = ResourceDescriptor {
  kind: ResourceKind::LedgerEntry,
  table: "transactions",
  owner_field: "user_id",
  placement: Placement::NewestFirst,
  toggle_field: None,
  singleton: false,
};

pub static CATEGORIES: ResourceDescriptor = ResourceDescriptor {
  kind: ResourceKind::Category,
  table: "categories",
  owner_field: "user_id",
  placement: Placement::ByField("name"),
  toggle_field: None,
  singleton: false,
};

pub static PROFILE: ResourceDescriptor = ResourceDescriptor {
  kind: ResourceKind::Profile,
  table: "profiles",
  owner_field: "user_id",
  placement: Placement::OldestFirst,
  toggle_field: None,
  singleton: true,
};

pub fn descriptor(kind: ResourceKind) -> &'static ResourceDescriptor {
  match kind {
    ResourceKind::Task => &TASKS,
    ResourceKind::LedgerEntry => &LEDGER_ENTRIES,
    ResourceKind::Category => &CATEGORIES,
    ResourceKind::Profile => &PROFILE,
  }
}

// ============================================================================
// Typed views
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
  pub id: RecordId,
  pub title: String,
  #[serde(default)]
  pub done: bool,
  pub due_on: Option<String>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
  Income,
  Expense,
}

/// A single income or expense line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
  pub id: RecordId,
  pub amount: f64,
  #[serde(rename = "type")]
  pub kind: EntryKind,
  pub category_id: Option<RecordId>,
  pub note: Option<String>,
  pub occurred_on: Option<String>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
  pub id: RecordId,
  pub name: String,
  pub color: Option<String>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
  pub id: RecordId,
  pub display_name: Option<String>,
  pub currency: Option<String>,
  pub updated_at: DateTime<Utc>,
}
