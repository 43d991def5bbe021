//! Persistent snapshots of cached scopes for offline cold starts.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::record::Record;
use crate::scope::ScopeKey;

/// A snapshot read back from storage.
#[derive(Debug, Clone)]
pub struct PersistedScope {
  /// Records in the order they were cached
  pub records: Vec<Record>,
  /// When the snapshot was written
  pub saved_at: DateTime<Utc>,
}

/// Trait for snapshot storage backends.
pub trait CacheStorage: Send + Sync {
  /// Replace the snapshot of a scope.
  fn save(&self, scope: &ScopeKey, records: &[Record]) -> SyncResult<()>;

  /// Read the snapshot of a scope, if one was saved.
  fn load(&self, scope: &ScopeKey) -> SyncResult<Option<PersistedScope>>;

  /// Forget a scope's snapshot.
  fn remove(&self, scope: &ScopeKey) -> SyncResult<()>;
}

/// Storage that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn save(&self, _scope: &ScopeKey, _records: &[Record]) -> SyncResult<()> {
    Ok(()) // Discard
  }

  fn load(&self, _scope: &ScopeKey) -> SyncResult<Option<PersistedScope>> {
    Ok(None) // Always miss
  }

  fn remove(&self, _scope: &ScopeKey) -> SyncResult<()> {
    Ok(())
  }
}

/// SQLite-based snapshot storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the snapshot database at the default location.
  pub fn open() -> SyncResult<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the snapshot database at `path`.
  pub fn open_at(path: &Path) -> SyncResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::Storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::Storage(format!("Failed to open cache database at {}: {}", path.display(), e))
    })?;

    Self::with_connection(conn)
  }

  /// Snapshot database that lives only as long as this value.
  pub fn open_in_memory() -> SyncResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> SyncResult<Self> {
    conn
      .execute_batch(SNAPSHOT_SCHEMA)
      .map_err(|e| SyncError::Storage(format!("Failed to run cache migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> SyncResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("tally").join("cache.db"))
  }

  fn lock(&self) -> SyncResult<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))
  }
}

/// Schema for snapshot tables.
const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scope_snapshots (
    scope_hash TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    resource TEXT NOT NULL,
    owner TEXT NOT NULL,
    data BLOB NOT NULL,
    record_count INTEGER NOT NULL,
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_scope_snapshots_owner
    ON scope_snapshots(resource, owner);
"#;

impl CacheStorage for SqliteStorage {
  fn save(&self, scope: &ScopeKey, records: &[Record]) -> SyncResult<()> {
    let data = serde_json::to_vec(records)?;
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO scope_snapshots
           (scope_hash, description, resource, owner, data, record_count, saved_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          scope.cache_hash(),
          scope.description(),
          scope.resource().as_str(),
          scope.owner(),
          data,
          records.len()
        ],
      )
      .map_err(|e| SyncError::Storage(format!("Failed to store snapshot: {}", e)))?;

    Ok(())
  }

  fn load(&self, scope: &ScopeKey) -> SyncResult<Option<PersistedScope>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, saved_at FROM scope_snapshots WHERE scope_hash = ?",
        params![scope.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| SyncError::Storage(format!("Failed to read snapshot: {}", e)))?;

    match row {
      Some((data, saved_at)) => {
        let records: Vec<Record> = serde_json::from_slice(&data)?;
        Ok(Some(PersistedScope {
          records,
          saved_at: parse_datetime(&saved_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn remove(&self, scope: &ScopeKey) -> SyncResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM scope_snapshots WHERE scope_hash = ?",
      params![scope.cache_hash()],
    )?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> SyncResult<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| SyncError::Storage(format!("Failed to parse datetime '{}': {}", s, e)))
}
