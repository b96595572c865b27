pub mod schema;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::StorageError;

/// SQLite connection wrapper shared by the durable stores.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path` and apply `schema`.
  pub fn open(path: &Path, schema: &str) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)
      .map_err(|e| StorageError::db(format!("Failed to open database at {}", path.display()), e))?;

    Self::from_connection(conn, schema)
  }

  /// Private in-memory database, used by tests and when nothing should persist.
  pub fn open_in_memory(schema: &str) -> Result<Self, StorageError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StorageError::db("Failed to open in-memory database", e))?;
    Self::from_connection(conn, schema)
  }

  fn from_connection(conn: Connection, schema: &str) -> Result<Self, StorageError> {
    conn
      .execute_batch(schema)
      .map_err(|e| StorageError::db("Failed to run migrations", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Lock the connection for the duration of one operation.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self.conn.lock().map_err(|_| StorageError::LockPoisoned)
  }
}
