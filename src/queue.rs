//! Durable FIFO of offline actions waiting to be replayed.
//!
//! Lives in its own database so cache purges never touch it. If the store
//! cannot be opened the queue degrades to a no-op: every operation fails with
//! `QueueError::Unavailable` and callers treat the queue as empty.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

use crate::db::{schema::SYNC_SCHEMA, Database};
use crate::error::{QueueError, StorageError};

/// One queued action. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
  pub id: i64,
  pub action: String,
  pub data: Value,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
}

pub struct QueueStore {
  db: Option<Database>,
}

impl QueueStore {
  /// Open the queue at `path`. Failure leaves the store unavailable instead of erroring.
  pub fn open(path: &Path) -> Self {
    match Database::open(path, SYNC_SCHEMA) {
      Ok(db) => Self { db: Some(db) },
      Err(e) => {
        warn!("Sync queue store at {} unavailable: {}", path.display(), e);
        Self::unavailable()
      }
    }
  }

  pub fn open_in_memory() -> Self {
    match Database::open_in_memory(SYNC_SCHEMA) {
      Ok(db) => Self { db: Some(db) },
      Err(e) => {
        warn!("In-memory sync queue unavailable: {}", e);
        Self::unavailable()
      }
    }
  }

  pub fn unavailable() -> Self {
    Self { db: None }
  }

  pub fn is_available(&self) -> bool {
    self.db.is_some()
  }

  fn db(&self, operation: &str) -> Result<&Database, QueueError> {
    self.db.as_ref().ok_or_else(|| {
      warn!("Sync queue unavailable, {} skipped", operation);
      QueueError::Unavailable
    })
  }

  /// Append an action. Returns once the row is committed.
  pub fn enqueue(&self, action: &str, data: Value) -> Result<QueuedAction, QueueError> {
    let db = self.db("enqueue")?;
    let timestamp = Utc::now();
    let raw = serde_json::to_string(&data).map_err(StorageError::from)?;

    let conn = db.conn()?;
    conn
      .execute(
        "INSERT INTO sync_queue (action, data, timestamp) VALUES (?, ?, ?)",
        params![action, raw, timestamp.timestamp_millis()],
      )
      .map_err(|e| StorageError::db("Failed to enqueue action", e))?;
    let id = conn.last_insert_rowid();

    debug!("Queued action {} ({})", id, action);
    Ok(QueuedAction {
      id,
      action: action.to_string(),
      data,
      timestamp,
    })
  }

  /// Snapshot of every queued action in insertion order. Nothing is removed.
  pub fn drain_all(&self) -> Result<Vec<QueuedAction>, QueueError> {
    let db = self.db("drain")?;
    let conn = db.conn()?;
    let mut stmt = conn
      .prepare("SELECT id, action, data, timestamp FROM sync_queue ORDER BY id")
      .map_err(|e| StorageError::db("Failed to prepare queue read", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, i64>(3)?,
        ))
      })
      .map_err(|e| StorageError::db("Failed to read queue", e))?
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| StorageError::db("Failed to read queued action", e))?;

    rows
      .into_iter()
      .map(|(id, action, data, timestamp)| -> Result<QueuedAction, QueueError> {
        let data = serde_json::from_str(&data).map_err(StorageError::from)?;
        let timestamp = DateTime::from_timestamp_millis(timestamp)
          .ok_or_else(|| StorageError::Corrupt(format!("bad timestamp on queued action {}", id)))?;
        Ok(QueuedAction {
          id,
          action,
          data,
          timestamp,
        })
      })
      .collect()
  }

  /// Remove every queued action. Returns how many were removed.
  pub fn clear_all(&self) -> Result<usize, QueueError> {
    let db = self.db("clear")?;
    let conn = db.conn()?;
    let removed = conn
      .execute("DELETE FROM sync_queue", [])
      .map_err(|e| StorageError::db("Failed to clear queue", e))?;
    Ok(removed)
  }

  /// Remove actions up to and including `last_id`, keeping anything queued later.
  pub fn clear_through(&self, last_id: i64) -> Result<usize, QueueError> {
    let db = self.db("clear")?;
    let conn = db.conn()?;
    let removed = conn
      .execute("DELETE FROM sync_queue WHERE id <= ?", params![last_id])
      .map_err(|e| StorageError::db("Failed to clear drained actions", e))?;
    Ok(removed)
  }

  pub fn len(&self) -> Result<usize, QueueError> {
    let db = self.db("count")?;
    let conn = db.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
      .map_err(|e| StorageError::db("Failed to count queue", e))?;
    Ok(count as usize)
  }
}
