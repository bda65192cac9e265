//! Durable queue storage.
//!
//! Items are appended once and then only move through guarded state
//! transitions (`UPDATE ... WHERE status = expected`), so several processes
//! sharing the database never clobber each other's view of an item.
//!
//! An IN_FLIGHT item carries its claimer (`claimed_by`) and claim time
//! (`claimed_at`). Only the claimer may settle it, and another replayer may
//! take it back only once the claim's lease has run out.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use std::time::Duration;

use super::item::{OperationKind, QueueItem, QueueStatus};
use crate::db::Database;
use crate::error::StorageError;

/// Trait for write-queue storage backends.
pub trait QueueStore: Send + Sync {
  fn append(&self, item: &QueueItem) -> Result<(), StorageError>;

  fn get(&self, id: &str) -> Result<Option<QueueItem>, StorageError>;

  /// Every unsettled item (PENDING, IN_FLIGHT, FAILED) in submission order.
  fn list(&self) -> Result<Vec<QueueItem>, StorageError>;

  /// PENDING → IN_FLIGHT on behalf of `owner`. Returns false if the item
  /// was not PENDING.
  fn claim(&self, id: &str, owner: &str) -> Result<bool, StorageError>;

  /// Delete an applied item. Returns false if `owner` no longer holds it.
  fn complete(&self, id: &str, owner: &str) -> Result<bool, StorageError>;

  /// Record a failed attempt of an item `owner` holds and move it to `next`.
  /// Returns false if the claim was lost.
  fn record_failure(
    &self,
    id: &str,
    owner: &str,
    attempts: u32,
    error: &str,
    next: QueueStatus,
  ) -> Result<bool, StorageError>;

  /// Delete `id` if it is in `expected`.
  fn remove(&self, id: &str, expected: QueueStatus) -> Result<bool, StorageError>;

  /// FAILED → PENDING with a fresh attempt budget.
  fn requeue_failed(&self, id: &str) -> Result<bool, StorageError>;

  /// Persist a new target/payload for a PENDING item.
  fn update_pending(&self, item: &QueueItem) -> Result<bool, StorageError>;

  /// IN_FLIGHT → PENDING for items held by `owner` or whose claim is older
  /// than `lease`. Claims of other live replayers are left alone.
  fn recover_in_flight(&self, owner: &str, lease: Duration) -> Result<usize, StorageError>;
}

pub struct SqliteQueueStore {
  db: Arc<Database>,
}

impl SqliteQueueStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

const COLUMNS: &str = "id, created_at, operation, target, payload, attempts, last_error, status";

type RawItem = (
  String,
  String,
  String,
  String,
  String,
  u32,
  Option<String>,
  String,
);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawItem> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
    row.get(7)?,
  ))
}

fn decode(raw: RawItem) -> Result<QueueItem, StorageError> {
  let (id, created_at, operation, target, payload, attempts, last_error, status) = raw;
  let corrupt = |reason: String| StorageError::Corrupt {
    id: id.clone(),
    reason,
  };

  let created_at = DateTime::parse_from_rfc3339(&created_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| corrupt(e.to_string()))?;
  let operation = OperationKind::parse(&operation)
    .ok_or_else(|| corrupt(format!("unknown operation '{}'", operation)))?;
  let status =
    QueueStatus::parse(&status).ok_or_else(|| corrupt(format!("unknown status '{}'", status)))?;
  let payload = serde_json::from_str(&payload)?;

  Ok(QueueItem {
    id,
    created_at,
    operation,
    target,
    payload,
    attempts,
    last_error,
    status,
  })
}

impl QueueStore for SqliteQueueStore {
  fn append(&self, item: &QueueItem) -> Result<(), StorageError> {
    let payload = serde_json::to_string(&item.payload)?;
    let conn = self.db.conn()?;
    conn.execute(
      "INSERT INTO queue_items
         (id, created_at, operation, target, payload, attempts, last_error, status, updated_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        item.id,
        item.created_at.to_rfc3339(),
        item.operation.as_str(),
        item.target,
        payload,
        item.attempts,
        item.last_error,
        item.status.as_str(),
        Utc::now().to_rfc3339(),
      ],
    )?;
    Ok(())
  }

  fn get(&self, id: &str) -> Result<Option<QueueItem>, StorageError> {
    let conn = self.db.conn()?;
    let raw = conn
      .query_row(
        &format!("SELECT {} FROM queue_items WHERE id = ?", COLUMNS),
        params![id],
        read_row,
      )
      .optional()?;
    raw.map(decode).transpose()
  }

  fn list(&self) -> Result<Vec<QueueItem>, StorageError> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM queue_items WHERE status != 'DONE' ORDER BY seq",
      COLUMNS
    ))?;
    let rows = stmt.query_map([], read_row)?;

    let mut items = Vec::new();
    for raw in rows {
      items.push(decode(raw?)?);
    }
    Ok(items)
  }

  fn claim(&self, id: &str, owner: &str) -> Result<bool, StorageError> {
    let now = Utc::now();
    let conn = self.db.conn()?;
    let updated = conn.execute(
      "UPDATE queue_items
       SET status = 'IN_FLIGHT', claimed_by = ?, claimed_at = ?, updated_at = ?
       WHERE id = ? AND status = 'PENDING'",
      params![owner, now.timestamp_millis(), now.to_rfc3339(), id],
    )?;
    Ok(updated == 1)
  }

  fn complete(&self, id: &str, owner: &str) -> Result<bool, StorageError> {
    let conn = self.db.conn()?;
    let deleted = conn.execute(
      "DELETE FROM queue_items WHERE id = ? AND status = 'IN_FLIGHT' AND claimed_by = ?",
      params![id, owner],
    )?;
    Ok(deleted == 1)
  }

  fn record_failure(
    &self,
    id: &str,
    owner: &str,
    attempts: u32,
    error: &str,
    next: QueueStatus,
  ) -> Result<bool, StorageError> {
    let conn = self.db.conn()?;
    let updated = conn.execute(
      "UPDATE queue_items
       SET status = ?, attempts = ?, last_error = ?, updated_at = ?,
           claimed_by = NULL, claimed_at = NULL
       WHERE id = ? AND status = 'IN_FLIGHT' AND claimed_by = ?",
      params![
        next.as_str(),
        attempts,
        error,
        Utc::now().to_rfc3339(),
        id,
        owner
      ],
    )?;
    Ok(updated == 1)
  }

  fn remove(&self, id: &str, expected: QueueStatus) -> Result<bool, StorageError> {
    let conn = self.db.conn()?;
    let deleted = conn.execute(
      "DELETE FROM queue_items WHERE id = ? AND status = ?",
      params![id, expected.as_str()],
    )?;
    Ok(deleted == 1)
  }

  fn requeue_failed(&self, id: &str) -> Result<bool, StorageError> {
    let conn = self.db.conn()?;
    let updated = conn.execute(
      "UPDATE queue_items SET status = 'PENDING', attempts = 0, updated_at = ?
       WHERE id = ? AND status = 'FAILED'",
      params![Utc::now().to_rfc3339(), id],
    )?;
    Ok(updated == 1)
  }

  fn update_pending(&self, item: &QueueItem) -> Result<bool, StorageError> {
    let payload = serde_json::to_string(&item.payload)?;
    let conn = self.db.conn()?;
    let updated = conn.execute(
      "UPDATE queue_items SET target = ?, payload = ?, updated_at = ?
       WHERE id = ? AND status = 'PENDING'",
      params![item.target, payload, Utc::now().to_rfc3339(), item.id],
    )?;
    Ok(updated == 1)
  }

  fn recover_in_flight(&self, owner: &str, lease: Duration) -> Result<usize, StorageError> {
    let now = Utc::now();
    let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
    let expired_before = now.timestamp_millis().saturating_sub(lease_ms);

    let conn = self.db.conn()?;
    // Rows without a claimer predate claim tracking
    let updated = conn.execute(
      "UPDATE queue_items
       SET status = 'PENDING', claimed_by = NULL, claimed_at = NULL, updated_at = ?
       WHERE status = 'IN_FLIGHT'
         AND (claimed_by IS NULL OR claimed_by = ? OR claimed_at IS NULL OR claimed_at <= ?)",
      params![now.to_rfc3339(), owner, expired_before],
    )?;
    Ok(updated)
  }
}
