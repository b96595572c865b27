//! Error types for the offline engine.
//!
//! Most of these are logged and swallowed by the layer that owns them; only
//! the CLI turns them into hard failures.

use thiserror::Error;

use crate::clients::InstanceId;
use crate::lifecycle::WorkerState;

/// Failure inside one of the SQLite-backed stores.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("Database error: {message}")]
  Database {
    message: String,
    #[source]
    source: rusqlite::Error,
  },

  #[error("Failed to (de)serialize stored value: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Failed to prepare storage location: {0}")]
  Io(#[from] std::io::Error),

  #[error("Corrupt stored value: {0}")]
  Corrupt(String),

  #[error("Storage lock poisoned")]
  LockPoisoned,

  #[error("Only GET requests can be cached, got {0}")]
  NotCacheable(String),
}

impl StorageError {
  pub fn db(message: impl Into<String>, source: rusqlite::Error) -> Self {
    Self::Database {
      message: message.into(),
      source,
    }
  }
}

/// A live network fetch failed before producing a response.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
  #[error("Network error for {url}: {message}")]
  Network { url: String, message: String },

  #[error("Request to {url} timed out")]
  Timeout { url: String },

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
  /// The durable store could not be opened; every operation is a no-op.
  #[error("Sync queue store is unavailable")]
  Unavailable,

  #[error(transparent)]
  Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Error)]
#[allow(dead_code)] // Only raised by backend replayers
pub enum ReplayError {
  #[error("Replay of queued action {id} ({action}) failed: {message}")]
  Rejected {
    id: i64,
    action: String,
    message: String,
  },
}

#[derive(Debug, Clone, Error)]
pub enum RegistrationError {
  #[error("Background sync is not supported")]
  Unsupported,

  #[error("Deferred sync registration channel closed")]
  Closed,
}

#[derive(Debug, Clone, Error)]
pub enum NotifyError {
  #[error("Instance {0} is no longer connected")]
  Disconnected(InstanceId),
}

#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
  #[error("Worker is {actual}, expected {expected}")]
  InvalidState {
    expected: WorkerState,
    actual: WorkerState,
  },
}
