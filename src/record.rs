//! Records held in the cache: a stable id, a modification time and the
//! resource-specific attributes as a JSON object.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

const TEMP_PREFIX: &str = "temp-";

/// Identity of a record.
///
/// Server ids are whatever the remote store assigned. Temporary ids are
/// minted locally for optimistic creates and always start with `temp-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordId {
  Server(String),
  Temp(String),
}

impl RecordId {
  /// Mint a fresh provisional id.
  pub fn temporary() -> Self {
    RecordId::Temp(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()))
  }

  /// Parse an id string, recognising the provisional prefix.
  pub fn parse(s: impl Into<String>) -> Self {
    let s = s.into();
    if s.starts_with(TEMP_PREFIX) {
      RecordId::Temp(s)
    } else {
      RecordId::Server(s)
    }
  }

  pub fn is_temporary(&self) -> bool {
    matches!(self, RecordId::Temp(_))
  }

  pub fn as_str(&self) -> &str {
    match self {
      RecordId::Server(s) | RecordId::Temp(s) => s,
    }
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl From<&str> for RecordId {
  fn from(s: &str) -> Self {
    RecordId::parse(s)
  }
}

impl From<u64> for RecordId {
  fn from(n: u64) -> Self {
    RecordId::Server(n.to_string())
  }
}

impl Serialize for RecordId {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for RecordId {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    struct IdVisitor;

    impl Visitor<'_> for IdVisitor {
      type Value = RecordId;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a string or integer record id")
      }

      fn visit_str<E: de::Error>(self, v: &str) -> Result<RecordId, E> {
        Ok(RecordId::parse(v))
      }

      fn visit_u64<E: de::Error>(self, v: u64) -> Result<RecordId, E> {
        Ok(RecordId::from(v))
      }

      fn visit_i64<E: de::Error>(self, v: i64) -> Result<RecordId, E> {
        Ok(RecordId::Server(v.to_string()))
      }
    }

    deserializer.deserialize_any(IdVisitor)
  }
}

/// A domain entity as cached locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: RecordId,
  pub updated_at: DateTime<Utc>,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Record {
  pub fn new(id: impl Into<RecordId>, updated_at: DateTime<Utc>, fields: Map<String, Value>) -> Self {
    Self {
      id: id.into(),
      updated_at,
      fields,
    }
  }

  /// Build the optimistic stand-in for a record that is being created.
  pub fn provisional(payload: &Map<String, Value>, now: DateTime<Utc>) -> Self {
    let mut record = Self::new(RecordId::temporary(), now, Map::new());
    record.apply_patch(payload, now);
    record
  }

  /// Convert a row as returned by a remote store.
  ///
  /// Numeric ids are accepted. A missing `updated_at` falls back to now so
  /// resources without a modification column still order sensibly.
  pub fn from_row(row: Value) -> SyncResult<Self> {
    let mut fields = match row {
      Value::Object(map) => map,
      other => {
        return Err(SyncError::Serialization(format!(
          "expected an object row, got {}",
          other
        )))
      }
    };

    let id = match fields.remove("id") {
      Some(Value::String(s)) => RecordId::parse(s),
      Some(Value::Number(n)) => RecordId::Server(n.to_string()),
      _ => return Err(SyncError::Serialization("row without an id".to_string())),
    };

    let updated_at = match fields.remove("updated_at") {
      Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Serialization(format!("bad updated_at '{}': {}", s, e)))?,
      _ => Utc::now(),
    };

    Ok(Self {
      id,
      updated_at,
      fields,
    })
  }

  pub fn is_provisional(&self) -> bool {
    self.id.is_temporary()
  }

  /// Overwrite the given fields and bump `updated_at`.
  ///
  /// `id` and `updated_at` keys in the patch are ignored; identity only
  /// changes through server reconciliation.
  pub fn apply_patch(&mut self, patch: &Map<String, Value>, now: DateTime<Utc>) {
    for (key, value) in patch {
      if key == "id" || key == "updated_at" {
        continue;
      }
      self.fields.insert(key.clone(), value.clone());
    }
    self.updated_at = now;
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.fields.get(field)
  }

  pub fn get_str(&self, field: &str) -> Option<&str> {
    self.fields.get(field).and_then(Value::as_str)
  }

  pub fn get_bool(&self, field: &str) -> Option<bool> {
    self.fields.get(field).and_then(Value::as_bool)
  }

  /// Decode into a typed resource view.
  pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<T> {
    let value = serde_json::to_value(self)?;
    Ok(serde_json::from_value(value)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn fields(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
  }

  #[test]
  fn test_temporary_ids_are_marked() {
    let id = RecordId::temporary();
    assert!(id.is_temporary());
    assert!(id.as_str().starts_with("temp-"));
    assert_eq!(RecordId::parse(id.as_str()), id);
    assert!(!RecordId::parse("42").is_temporary());
  }

  #[test]
  fn test_from_row_accepts_numeric_ids() {
    let record = Record::from_row(json!({
      "id": 42,
      "updated_at": "2026-10-01T12:00:00Z",
      "title": "Buy milk",
      "done": false
    }))
    .unwrap();

    assert_eq!(record.id, RecordId::Server("42".into()));
    assert_eq!(record.get_str("title"), Some("Buy milk"));
    assert_eq!(record.get_bool("done"), Some(false));
    assert!(!record.fields.contains_key("id"));
  }

  #[test]
  fn test_from_row_rejects_rows_without_id() {
    let err = Record::from_row(json!({ "title": "orphan" })).unwrap_err();
    assert!(matches!(err, SyncError::Serialization(_)));
  }

  #[test]
  fn test_patch_never_touches_identity() {
    let then = Utc::now() - chrono::Duration::minutes(5);
    let mut record = Record::new("7", then, fields(json!({ "title": "old" })));
    let now = Utc::now();

    record.apply_patch(&fields(json!({ "id": "99", "title": "new" })), now);

    assert_eq!(record.id, RecordId::Server("7".into()));
    assert_eq!(record.get_str("title"), Some("new"));
    assert_eq!(record.updated_at, now);
  }

  #[test]
  fn test_serialized_form_is_flat() {
    let record = Record::provisional(&fields(json!({ "title": "Buy milk" })), Utc::now());
    let value = serde_json::to_value(&record).unwrap();

    assert_eq!(value["title"], "Buy milk");
    assert!(value["id"].as_str().unwrap().starts_with("temp-"));

    let back: Record = serde_json::from_value(value).unwrap();
    assert_eq!(back, record);
  }
}
