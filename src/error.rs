//! Error types for the cache and sync engine.

use std::time::Duration;
use thiserror::Error;

/// Result alias for cache store and queue operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the persistence layer.
#[derive(Error, Debug)]
pub enum CacheError {
  /// `init()` has not been called, or `close()` already was
  #[error("cache store is not initialized")]
  NotInitialized,

  /// Platform persistence could not be opened at all
  #[error("storage unavailable: {0}")]
  StorageUnavailable(String),

  /// SQLite errors while reading or writing
  #[error("storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  /// Payload could not be encoded
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("lock poisoned: {0}")]
  LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for CacheError {
  fn from(err: std::sync::PoisonError<T>) -> Self {
    CacheError::LockPoisoned(err.to_string())
  }
}

/// Errors reported by a sync attempt.
///
/// One outcome is shared by every caller attached to the same in-flight
/// sync, so this type is `Clone` and carries messages rather than sources.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  /// The remote fetch failed
  #[error("network sync failed: {0}")]
  NetworkSyncFailed(String),

  /// The remote fetch did not finish in time
  #[error("sync timed out after {0:?}")]
  Timeout(Duration),

  /// Some queued mutations could not be replayed
  #[error("{failed} queued operation(s) failed to replay")]
  QueueReplayFailed { failed: usize },

  /// Local storage failed while committing or reading
  #[error("storage error during sync: {0}")]
  Storage(String),
}

impl From<CacheError> for SyncError {
  fn from(err: CacheError) -> Self {
    SyncError::Storage(err.to_string())
  }
}
