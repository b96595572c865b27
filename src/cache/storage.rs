//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::db::{schema::CACHE_SCHEMA, Database};
use crate::error::StorageError;
use crate::http::{RequestKey, Response};

/// A stored response with its capture time.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Trait for named-cache storage backends.
///
/// Every method is one atomic step at the storage layer; callers never need
/// to hold anything across two calls.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist yet.
  fn open_cache(&self, name: &str) -> Result<(), StorageError>;

  /// All cache names in creation order.
  fn cache_names(&self) -> Result<Vec<String>, StorageError>;

  /// Drop a cache and every entry it owns. Returns whether it existed.
  fn delete_cache(&self, name: &str) -> Result<bool, StorageError>;

  /// Insert or overwrite the entry for `key` in the named cache.
  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<(), StorageError>;

  fn get(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>, StorageError>;

  fn entry_count(&self, name: &str) -> Result<usize, StorageError>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    Ok(Self {
      db: Database::open(path, CACHE_SCHEMA)?,
    })
  }

  pub fn open_in_memory() -> Result<Self, StorageError> {
    Ok(Self {
      db: Database::open_in_memory(CACHE_SCHEMA)?,
    })
  }
}

impl CacheStorage for SqliteStorage {
  fn open_cache(&self, name: &str) -> Result<(), StorageError> {
    let conn = self.db.conn()?;
    conn
      .execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![name])
      .map_err(|e| StorageError::db(format!("Failed to open cache {}", name), e))?;
    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY id")
      .map_err(|e| StorageError::db("Failed to prepare cache listing", e))?;
    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| StorageError::db("Failed to list caches", e))?
      .collect::<Result<Vec<String>, _>>()
      .map_err(|e| StorageError::db("Failed to read cache name", e))?;
    Ok(names)
  }

  fn delete_cache(&self, name: &str) -> Result<bool, StorageError> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| StorageError::db("Failed to begin transaction", e))?;

    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![name])
      .map_err(|e| StorageError::db(format!("Failed to delete entries of {}", name), e))?;
    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![name])
      .map_err(|e| StorageError::db(format!("Failed to delete cache {}", name), e))?;

    tx.commit()
      .map_err(|e| StorageError::db("Failed to commit transaction", e))?;
    Ok(removed > 0)
  }

  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<(), StorageError> {
    let headers = serde_json::to_string(&response.header_pairs())?;
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| StorageError::db("Failed to begin transaction", e))?;

    tx.execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![name])
      .map_err(|e| StorageError::db(format!("Failed to open cache {}", name), e))?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_hash, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        request_hash(key),
        key.method,
        key.url,
        response.status.as_u16(),
        headers,
        response.body
      ],
    )
    .map_err(|e| StorageError::db(format!("Failed to store {}", key), e))?;

    tx.commit()
      .map_err(|e| StorageError::db("Failed to commit transaction", e))?;
    Ok(())
  }

  fn get(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>, StorageError> {
    let conn = self.db.conn()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND request_hash = ?",
        params![name, request_hash(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| StorageError::db(format!("Failed to look up {}", key), e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let pairs: Vec<(String, String)> = serde_json::from_str(&headers)?;
        let response = Response::from_parts(status, &pairs, body).ok_or_else(|| {
          StorageError::Corrupt(format!("Invalid stored status {} for {}", status, key))
        })?;
        Ok(Some(CachedResponse {
          response,
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn entry_count(&self, name: &str) -> Result<usize, StorageError> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| StorageError::db("Failed to count entries", e))?;
    Ok(count as usize)
  }
}

/// SHA256 of the request identity for stable, fixed-length keys.
fn request_hash(key: &RequestKey) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.method.as_bytes());
  hasher.update(b" ");
  hasher.update(key.url.as_bytes());
  hex::encode(hasher.finalize())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StorageError::Corrupt(format!("Failed to parse datetime '{}': {}", s, e)))
}
