//! Typed error kinds for the offline layer.
//!
//! Application plumbing (config, CLI, session construction) uses `color_eyre`.
//! Everything at the cache, queue and allocator boundaries returns one of
//! these so callers can match on the failure kind.

use std::time::Duration;
use thiserror::Error;

/// Persistent storage failures (SQLite, serialization, poisoned locks).
#[derive(Error, Debug)]
pub enum StorageError {
  #[error("Lock poisoned: {0}")]
  LockPoisoned(String),

  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("Failed to serialize record: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("Corrupt record {id}: {reason}")]
  Corrupt { id: String, reason: String },
}

/// A single network fetch did not produce a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error("Request timed out after {0:?}")]
  Timeout(Duration),

  #[error("Transport error: {0}")]
  Transport(String),

  #[error("Unsupported request: {0}")]
  Unsupported(String),
}

/// One or more assets failed to pre-populate a cache generation.
///
/// Nothing from the failed generation is committed; the previously active
/// generation keeps serving.
#[derive(Error, Debug)]
#[error("Failed to install cache generation {generation}: {} asset(s) failed", failures.len())]
pub struct InstallFailure {
  pub generation: String,
  /// `(url, reason)` for every asset that could not be stored
  pub failures: Vec<(String, String)>,
}

/// Administrative cache operations (activation, purge, listing).
#[derive(Error, Debug)]
pub enum CacheError {
  #[error("Cache generation {0} is not installed")]
  UnknownGeneration(String),

  #[error(transparent)]
  Storage(#[from] StorageError),
}

/// The caller-supplied apply operation failed for a queued mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
  /// Worth retrying: transport failure, timeout, server-side error.
  #[error("{0}")]
  Transient(String),

  /// The server rejected the mutation; retrying cannot help.
  #[error("rejected: {0}")]
  Permanent(String),
}

impl ApplyError {
  pub fn is_permanent(&self) -> bool {
    matches!(self, ApplyError::Permanent(_))
  }
}

impl From<FetchError> for ApplyError {
  fn from(e: FetchError) -> Self {
    ApplyError::Transient(e.to_string())
  }
}

/// Creating a document under an allocated identifier failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CreateError {
  /// The identifier is already taken (uniqueness violation).
  #[error("Identifier {0} already exists")]
  Conflict(String),

  #[error("Failed to create document: {0}")]
  Failed(String),
}

/// Sequence allocation failures that reach the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
  #[error("Failed to read existing identifiers: {0}")]
  Source(String),

  #[error("Could not allocate a {family} identifier in partition {partition} after {attempts} attempts")]
  Exhausted {
    family: String,
    partition: String,
    attempts: u32,
  },

  #[error(transparent)]
  Create(CreateError),
}

impl From<StorageError> for AllocationError {
  fn from(e: StorageError) -> Self {
    AllocationError::Source(e.to_string())
  }
}
