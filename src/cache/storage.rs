//! SQLite cache storage.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use url::Url;

use super::entry::{CacheEntry, CacheKey};
use super::traits::{CacheStorage, GenerationInfo, GenerationState};
use crate::db::Database;
use crate::error::StorageError;

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

fn write_entry(conn: &Connection, generation: &str, entry: &CacheEntry) -> Result<(), StorageError> {
  let headers = serde_json::to_string(&entry.headers)?;
  conn.execute(
    "INSERT OR REPLACE INTO cache_entries
       (generation, cache_key, method, url, status, headers, body, stored_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    params![
      generation,
      entry.key.digest(),
      entry.key.method,
      entry.key.url.as_str(),
      entry.status,
      headers,
      entry.body,
      entry.stored_at.to_rfc3339(),
    ],
  )?;
  Ok(())
}

fn delete_generation(conn: &Connection, generation: &str) -> Result<(), StorageError> {
  conn.execute(
    "DELETE FROM cache_entries WHERE generation = ?",
    params![generation],
  )?;
  conn.execute(
    "DELETE FROM cache_generations WHERE generation = ?",
    params![generation],
  )?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn put_generation(&self, generation: &str, entries: &[CacheEntry]) -> Result<(), StorageError> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    // Reinstalling a generation replaces it; it must not be serving.
    let state: Option<String> = tx
      .query_row(
        "SELECT state FROM cache_generations WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()?;
    let state = state
      .as_deref()
      .and_then(GenerationState::parse)
      .unwrap_or(GenerationState::Installed);

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation],
    )?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_generations (generation, state, created_at)
       VALUES (?, ?, datetime('now'))",
      params![generation, state.as_str()],
    )?;
    for entry in entries {
      write_entry(&tx, generation, entry)?;
    }

    // Dropping the transaction on any error above rolls everything back
    tx.commit()?;
    Ok(())
  }

  fn put_entry(&self, generation: &str, entry: &CacheEntry) -> Result<bool, StorageError> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let exists: Option<i64> = tx
      .query_row(
        "SELECT 1 FROM cache_generations WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()?;
    if exists.is_none() {
      return Ok(false);
    }

    write_entry(&tx, generation, entry)?;
    tx.commit()?;
    Ok(true)
  }

  fn get_entry(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>, StorageError> {
    let conn = self.db.conn()?;

    let row: Option<(String, String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT method, url, status, headers, body, stored_at FROM cache_entries
         WHERE generation = ? AND cache_key = ?",
        params![generation, key.digest()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()?;

    let (method, url, status, headers, body, stored_at) = match row {
      Some(row) => row,
      None => return Ok(None),
    };

    let corrupt = |reason: String| StorageError::Corrupt {
      id: url.clone(),
      reason,
    };
    let parsed_url = Url::parse(&url).map_err(|e| corrupt(e.to_string()))?;
    let stored_at = DateTime::parse_from_rfc3339(&stored_at)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| corrupt(e.to_string()))?;

    Ok(Some(CacheEntry {
      key: CacheKey {
        method,
        url: parsed_url,
      },
      status,
      headers: serde_json::from_str(&headers)?,
      body,
      stored_at,
    }))
  }

  fn generations(&self) -> Result<Vec<GenerationInfo>, StorageError> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(
      "SELECT g.generation, g.state, COUNT(e.cache_key) FROM cache_generations g
       LEFT JOIN cache_entries e ON e.generation = g.generation
       GROUP BY g.generation
       ORDER BY g.created_at, g.rowid",
    )?;

    let rows = stmt.query_map([], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, i64>(2)?,
      ))
    })?;

    let mut generations = Vec::new();
    for row in rows {
      let (generation, state, entries) = row?;
      let state = GenerationState::parse(&state).ok_or_else(|| StorageError::Corrupt {
        id: generation.clone(),
        reason: format!("unknown generation state '{}'", state),
      })?;
      generations.push(GenerationInfo {
        generation,
        state,
        entries: entries as usize,
      });
    }
    Ok(generations)
  }

  fn active_generation(&self) -> Result<Option<String>, StorageError> {
    let conn = self.db.conn()?;
    let active = conn
      .query_row(
        "SELECT generation FROM cache_generations WHERE state = 'active' LIMIT 1",
        [],
        |row| row.get(0),
      )
      .optional()?;
    Ok(active)
  }

  fn mark_active(&self, generation: &str) -> Result<bool, StorageError> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    tx.execute(
      "UPDATE cache_generations SET state = 'installed'
       WHERE state = 'active' AND generation != ?",
      params![generation],
    )?;
    let updated = tx.execute(
      "UPDATE cache_generations SET state = 'active' WHERE generation = ?",
      params![generation],
    )?;
    if updated == 0 {
      // Unknown generation: leave the current active one in place
      return Ok(false);
    }

    tx.commit()?;
    Ok(true)
  }

  fn delete_generations_except(&self, keep: Option<&str>) -> Result<usize, StorageError> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let doomed: Vec<String> = {
      let mut stmt = tx.prepare("SELECT generation FROM cache_generations")?;
      let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
      rows
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|g| Some(g.as_str()) != keep)
        .collect()
    };

    for generation in &doomed {
      delete_generation(&tx, generation)?;
    }

    // Entries can outlive a generation row if a writer died mid-install
    match keep {
      Some(keep) => tx.execute(
        "DELETE FROM cache_entries WHERE generation != ?",
        params![keep],
      )?,
      None => tx.execute("DELETE FROM cache_entries", [])?,
    };

    tx.commit()?;
    Ok(doomed.len())
  }

  fn delete_superseded_generations(&self) -> Result<usize, StorageError> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let doomed: Vec<String> = {
      let mut stmt = tx.prepare(
        "SELECT g.generation FROM cache_generations g, cache_generations a
         WHERE a.state = 'active' AND g.state != 'active'
           AND (g.created_at < a.created_at
                OR (g.created_at = a.created_at AND g.rowid < a.rowid))",
      )?;
      let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
      rows.collect::<Result<Vec<_>, _>>()?
    };

    for generation in &doomed {
      delete_generation(&tx, generation)?;
    }
    tx.execute(
      "DELETE FROM cache_entries
       WHERE generation NOT IN (SELECT generation FROM cache_generations)",
      [],
    )?;

    tx.commit()?;
    Ok(doomed.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::HttpResponse;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn entry(path: &str, body: &str) -> CacheEntry {
    let url = Url::parse("https://fleet.example.com").unwrap().join(path).unwrap();
    let response = HttpResponse::new(url.clone(), 200, body);
    CacheEntry::from_response(CacheKey::new("GET", &url), &response)
  }

  #[test]
  fn test_put_and_get_generation() {
    let storage = storage();
    storage
      .put_generation("v1", &[entry("/", "home"), entry("/offline", "offline")])
      .unwrap();

    let hit = storage.get_entry("v1", &entry("/", "").key).unwrap().unwrap();
    assert_eq!(hit.body, b"home");
    assert!(storage.get_entry("v2", &entry("/", "").key).unwrap().is_none());

    let generations = storage.generations().unwrap();
    assert_eq!(generations.len(), 1);
    assert_eq!(generations[0].state, GenerationState::Installed);
    assert_eq!(generations[0].entries, 2);
  }

  #[test]
  fn test_mark_active_keeps_single_active() {
    let storage = storage();
    storage.put_generation("v1", &[]).unwrap();
    storage.put_generation("v2", &[]).unwrap();

    assert!(storage.mark_active("v1").unwrap());
    assert!(storage.mark_active("v2").unwrap());
    assert!(!storage.mark_active("v3").unwrap());

    let active: Vec<_> = storage
      .generations()
      .unwrap()
      .into_iter()
      .filter(|g| g.state == GenerationState::Active)
      .map(|g| g.generation)
      .collect();
    assert_eq!(active, vec!["v2".to_string()]);
  }

  #[test]
  fn test_put_entry_replaces_existing() {
    let storage = storage();
    storage.put_generation("v1", &[entry("/", "old")]).unwrap();

    assert!(storage.put_entry("v1", &entry("/", "new")).unwrap());
    assert!(!storage.put_entry("missing", &entry("/", "new")).unwrap());

    let hit = storage.get_entry("v1", &entry("/", "").key).unwrap().unwrap();
    assert_eq!(hit.body, b"new");
  }

  #[test]
  fn test_delete_generations_except() {
    let storage = storage();
    storage.put_generation("v1", &[entry("/", "a")]).unwrap();
    storage.put_generation("v2", &[entry("/", "b")]).unwrap();
    storage.put_generation("v3", &[entry("/", "c")]).unwrap();

    assert_eq!(storage.delete_generations_except(Some("v2")).unwrap(), 2);
    let names: Vec<_> = storage
      .generations()
      .unwrap()
      .into_iter()
      .map(|g| g.generation)
      .collect();
    assert_eq!(names, vec!["v2".to_string()]);

    assert_eq!(storage.delete_generations_except(None).unwrap(), 1);
    assert!(storage.generations().unwrap().is_empty());
  }

  #[test]
  fn test_delete_superseded_keeps_newer_installed() {
    let storage = storage();
    storage.put_generation("v1", &[entry("/", "a")]).unwrap();
    storage.put_generation("v2", &[entry("/", "b")]).unwrap();
    storage.mark_active("v2").unwrap();
    // Installed after v2, waiting for clients elsewhere
    storage.put_generation("v3", &[entry("/", "c")]).unwrap();

    assert_eq!(storage.delete_superseded_generations().unwrap(), 1);
    let names: Vec<_> = storage
      .generations()
      .unwrap()
      .into_iter()
      .map(|g| g.generation)
      .collect();
    assert_eq!(names, vec!["v2".to_string(), "v3".to_string()]);
    assert!(storage.get_entry("v3", &entry("/", "").key).unwrap().is_some());
    assert!(storage.get_entry("v1", &entry("/", "").key).unwrap().is_none());
  }

  #[test]
  fn test_delete_superseded_without_active_keeps_all() {
    let storage = storage();
    storage.put_generation("v1", &[]).unwrap();
    storage.put_generation("v2", &[]).unwrap();

    assert_eq!(storage.delete_superseded_generations().unwrap(), 0);
    assert_eq!(storage.generations().unwrap().len(), 2);
  }
}
