//! Human-readable document identifiers.
//!
//! The next sequence number is derived from the identifiers that already
//! exist in a partition. Two callers can therefore compute the same number;
//! `create_with_retry` closes the gap by re-allocating whenever creation hits
//! a uniqueness violation, a bounded number of times.

mod family;
mod index;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AllocationError, CreateError};

pub use family::{DocumentFamily, DocumentId, Granularity, PartitionKey};
pub use index::SqliteDocumentIndex;

/// Where existing identifiers are read from.
#[async_trait]
pub trait IdSource: Send + Sync {
  /// Identifiers of `family` in `partition`, in any order. Entries that do
  /// not parse as identifiers of that partition are ignored by the allocator.
  async fn existing_ids(
    &self,
    family: DocumentFamily,
    partition: &PartitionKey,
  ) -> Result<Vec<String>, AllocationError>;
}

pub struct SequenceAllocator {
  source: Arc<dyn IdSource>,
  max_retries: u32,
}

impl SequenceAllocator {
  pub fn new(source: Arc<dyn IdSource>, max_retries: u32) -> Self {
    Self {
      source,
      max_retries,
    }
  }

  /// One past the highest existing sequence number in the partition, or 1.
  pub async fn next_id(
    &self,
    family: DocumentFamily,
    partition: PartitionKey,
  ) -> Result<DocumentId, AllocationError> {
    self.next_above(family, partition, 0).await
  }

  async fn next_above(
    &self,
    family: DocumentFamily,
    partition: PartitionKey,
    floor: u32,
  ) -> Result<DocumentId, AllocationError> {
    if !partition.matches(family) {
      return Err(AllocationError::Source(format!(
        "partition {} does not fit {} identifiers",
        partition, family
      )));
    }

    let existing = self.source.existing_ids(family, &partition).await?;
    let max = existing
      .iter()
      .filter_map(|s| DocumentId::parse(s))
      .filter(|id| id.family == family && id.partition == partition)
      .map(|id| id.seq)
      .max()
      .unwrap_or(0)
      .max(floor);

    let seq = max
      .checked_add(1)
      .ok_or_else(|| AllocationError::Source(format!("sequence overflow in {}", partition)))?;
    Ok(DocumentId::new(family, partition, seq))
  }

  /// Allocate an identifier and hand it to `create`, re-allocating on
  /// `CreateError::Conflict` up to `max_retries` times.
  ///
  /// Any other creation failure is returned as is.
  pub async fn create_with_retry<T, F, Fut>(
    &self,
    family: DocumentFamily,
    partition: PartitionKey,
    mut create: F,
  ) -> Result<(DocumentId, T), AllocationError>
  where
    F: FnMut(DocumentId) -> Fut,
    Fut: Future<Output = Result<T, CreateError>>,
  {
    let attempts = self.max_retries + 1;
    // A lagging source may still omit the winner; never offer its number again
    let mut floor = 0;

    for attempt in 1..=attempts {
      let id = self.next_above(family, partition, floor).await?;
      debug!(id = %id, attempt, "Allocated document id");

      match create(id).await {
        Ok(created) => return Ok((id, created)),
        Err(CreateError::Conflict(taken)) => {
          warn!(id = %taken, attempt, "Document id already taken, re-allocating");
          floor = id.seq;
        }
        Err(e) => return Err(AllocationError::Create(e)),
      }
    }

    Err(AllocationError::Exhausted {
      family: family.prefix().to_string(),
      partition: partition.to_string(),
      attempts,
    })
  }
}
