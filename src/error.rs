//! Error types for the sync engine.

use thiserror::Error;

use crate::record::RecordId;

/// Errors surfaced by the cache, fetch, mutation and realtime layers.
///
/// The enum is `Clone` so a fetch failure can be parked on a cache entry
/// and handed to every observer of that scope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// Remote call failed before the server could answer (network, auth).
  #[error("transport error: {0}")]
  Transport(String),

  /// Remote store rejected the request.
  #[error("rejected by server: {0}")]
  Validation(String),

  #[error("record not found: {0}")]
  NotFound(RecordId),

  /// A realtime channel could not be opened or was lost.
  #[error("subscription error: {0}")]
  Subscription(String),

  #[error("cache storage error: {0}")]
  Storage(String),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("configuration error: {0}")]
  Config(String),

  /// The fetch was cancelled because its scope was deactivated or
  /// superseded by a mutation.
  #[error("operation cancelled")]
  Cancelled,

  #[error("sync engine is stopped")]
  Stopped,
}

impl SyncError {
  /// True for failures that say nothing about the request itself.
  pub fn is_transport(&self) -> bool {
    matches!(self, SyncError::Transport(_))
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    SyncError::Storage(e.to_string())
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    SyncError::Serialization(e.to_string())
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      SyncError::Serialization(e.to_string())
    } else {
      SyncError::Transport(e.to_string())
    }
  }
}

/// Result type for sync engine operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
