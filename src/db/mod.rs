pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::StorageError;

/// Shared SQLite handle for the cache, the write queue and the document index.
///
/// Several processes may open the same file; WAL mode plus a busy timeout
/// lets them interleave short transactions.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    conn
      .pragma_update(None, "journal_mode", "WAL")
      .map_err(|e| eyre!("Failed to enable WAL journal: {}", e))?;
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("offline.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    for (table, column, definition) in schema::ADDED_COLUMNS {
      let present: i64 = conn
        .query_row(
          &format!("SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = ?", table),
          params![column],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to inspect {}: {}", table, e))?;
      if present == 0 {
        conn
          .execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition))
          .map_err(|e| eyre!("Failed to add {}.{}: {}", table, column, e))?;
      }
    }

    Ok(())
  }

  /// Lock the connection for a unit of work.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::LockPoisoned(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrations_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("offline.db");

    let db = Database::open(Some(&path)).unwrap();
    drop(db);

    // Second open re-applies the schema on an existing file
    let db = Database::open(Some(&path)).unwrap();
    let conn = db.conn().unwrap();
    let tables: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
         ('cache_generations', 'cache_entries', 'queue_items', 'documents')",
        [],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(tables, 4);
  }

  #[test]
  fn test_claim_columns_added_to_older_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");
    {
      let conn = Connection::open(&path).unwrap();
      conn
        .execute_batch(
          "CREATE TABLE queue_items (
             seq INTEGER PRIMARY KEY AUTOINCREMENT,
             id TEXT NOT NULL UNIQUE,
             created_at TEXT NOT NULL,
             operation TEXT NOT NULL,
             target TEXT NOT NULL,
             payload TEXT NOT NULL,
             attempts INTEGER NOT NULL DEFAULT 0,
             last_error TEXT,
             status TEXT NOT NULL,
             updated_at TEXT NOT NULL
           );",
        )
        .unwrap();
    }

    let db = Database::open(Some(&path)).unwrap();
    let conn = db.conn().unwrap();
    let added: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM pragma_table_info('queue_items')
         WHERE name IN ('claimed_by', 'claimed_at')",
        [],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(added, 2);
  }
}
