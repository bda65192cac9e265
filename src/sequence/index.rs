//! Local index of known document identifiers.

use async_trait::async_trait;
use rusqlite::{params, ErrorCode};
use std::sync::Arc;
use tracing::debug;

use super::{DocumentFamily, DocumentId, IdSource, PartitionKey};
use crate::db::Database;
use crate::error::{AllocationError, CreateError, StorageError};

/// SQLite table of identifiers created on this device or learned from the
/// server. The primary key is the local uniqueness guard for optimistic ids.
pub struct SqliteDocumentIndex {
  db: Arc<Database>,
}

impl SqliteDocumentIndex {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Take `id` for a new document; `Conflict` if it is already known.
  pub fn claim(&self, id: &DocumentId) -> Result<(), CreateError> {
    let conn = self
      .db
      .conn()
      .map_err(|e| CreateError::Failed(e.to_string()))?;
    let result = conn.execute(
      "INSERT INTO documents (document_id, family, partition_key) VALUES (?, ?, ?)",
      params![id.to_string(), id.family.prefix(), id.partition.to_string()],
    );

    match result {
      Ok(_) => {
        debug!(id = %id, "Claimed document id");
        Ok(())
      }
      Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
        Err(CreateError::Conflict(id.to_string()))
      }
      Err(e) => Err(CreateError::Failed(e.to_string())),
    }
  }

  /// Remember an identifier that exists elsewhere. Returns false if known.
  pub fn record(&self, id: &DocumentId) -> Result<bool, StorageError> {
    let conn = self.db.conn()?;
    let inserted = conn.execute(
      "INSERT OR IGNORE INTO documents (document_id, family, partition_key) VALUES (?, ?, ?)",
      params![id.to_string(), id.family.prefix(), id.partition.to_string()],
    )?;
    Ok(inserted == 1)
  }

  pub fn ids(&self, family: DocumentFamily, partition: &PartitionKey) -> Result<Vec<String>, StorageError> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(
      "SELECT document_id FROM documents WHERE family = ? AND partition_key = ? ORDER BY document_id",
    )?;
    let ids = stmt
      .query_map(params![family.prefix(), partition.to_string()], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
  }
}

#[async_trait]
impl IdSource for SqliteDocumentIndex {
  async fn existing_ids(
    &self,
    family: DocumentFamily,
    partition: &PartitionKey,
  ) -> Result<Vec<String>, AllocationError> {
    Ok(self.ids(family, partition)?)
  }
}
