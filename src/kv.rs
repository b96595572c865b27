//! String-keyed settings store with a last-write-wins merge.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

use crate::db::{schema::SYNC_SCHEMA, Database};
use crate::error::StorageError;

pub struct KvStore {
  db: Database,
}

impl KvStore {
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    Ok(Self {
      db: Database::open(path, SYNC_SCHEMA)?,
    })
  }

  pub fn open_in_memory() -> Result<Self, StorageError> {
    Ok(Self {
      db: Database::open_in_memory(SYNC_SCHEMA)?,
    })
  }

  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
    let conn = self.db.conn()?;
    let raw: Option<String> = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| StorageError::db("Failed to read setting", e))?;

    match raw {
      Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
      None => Ok(None),
    }
  }

  /// Unconditional write, stamped with the current time.
  pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)",
        params![key, raw, Utc::now().timestamp_millis()],
      )
      .map_err(|e| StorageError::db("Failed to write setting", e))?;
    Ok(())
  }

  /// Write `value` only if `timestamp` is newer than what is stored.
  ///
  /// Returns whether the write was applied. Ties keep the stored value.
  pub fn merge_lww<T: Serialize>(
    &self,
    key: &str,
    value: &T,
    timestamp: DateTime<Utc>,
  ) -> Result<bool, StorageError> {
    let raw = serde_json::to_string(value)?;
    let conn = self.db.conn()?;
    let changed = conn
      .execute(
        "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
         WHERE excluded.updated_at > kv_store.updated_at",
        params![key, raw, timestamp.timestamp_millis()],
      )
      .map_err(|e| StorageError::db("Failed to merge setting", e))?;
    Ok(changed > 0)
  }

  pub fn remove(&self, key: &str) -> Result<bool, StorageError> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| StorageError::db("Failed to remove setting", e))?;
    Ok(removed > 0)
  }

  pub fn keys(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv_store ORDER BY key")
      .map_err(|e| StorageError::db("Failed to prepare key listing", e))?;
    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| StorageError::db("Failed to list keys", e))?
      .collect::<Result<Vec<String>, _>>()
      .map_err(|e| StorageError::db("Failed to read key", e))?;
    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  #[test]
  fn test_set_get_remove() {
    let kv = KvStore::open_in_memory().unwrap();
    assert_eq!(kv.get::<String>("theme").unwrap(), None);

    kv.set("theme", &"dark").unwrap();
    assert_eq!(kv.get::<String>("theme").unwrap().as_deref(), Some("dark"));
    assert_eq!(kv.keys().unwrap(), vec!["theme"]);

    assert!(kv.remove("theme").unwrap());
    assert!(!kv.remove("theme").unwrap());
    assert!(kv.keys().unwrap().is_empty());
  }

  #[test]
  fn test_merge_lww_keeps_newest() {
    let kv = KvStore::open_in_memory().unwrap();
    let now = Utc::now();

    assert!(kv.merge_lww("herd", &json!({"count": 10}), now).unwrap());
    // Older write loses
    assert!(!kv
      .merge_lww("herd", &json!({"count": 3}), now - Duration::seconds(5))
      .unwrap());
    // Same timestamp keeps stored value
    assert!(!kv.merge_lww("herd", &json!({"count": 4}), now).unwrap());
    assert_eq!(
      kv.get::<serde_json::Value>("herd").unwrap(),
      Some(json!({"count": 10}))
    );

    assert!(kv
      .merge_lww("herd", &json!({"count": 12}), now + Duration::seconds(1))
      .unwrap());
    assert_eq!(
      kv.get::<serde_json::Value>("herd").unwrap(),
      Some(json!({"count": 12}))
    );
  }
}
