//! Storage contract for cache generations.

use serde::Serialize;

use super::entry::{CacheEntry, CacheKey};
use crate::error::StorageError;

/// Lifecycle state of a stored generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
  /// Fully populated, not serving
  Installed,
  /// The one generation lookups read from
  Active,
}

impl GenerationState {
  pub fn as_str(&self) -> &'static str {
    match self {
      GenerationState::Installed => "installed",
      GenerationState::Active => "active",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "installed" => Some(GenerationState::Installed),
      "active" => Some(GenerationState::Active),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationInfo {
  pub generation: String,
  pub state: GenerationState,
  pub entries: usize,
}

/// Trait for cache storage backends.
///
/// Every method is a single atomic unit from a reader's point of view.
pub trait CacheStorage: Send + Sync {
  /// Replace the whole content of `generation` with `entries` and mark it
  /// installed. Either everything is written or nothing is.
  fn put_generation(&self, generation: &str, entries: &[CacheEntry]) -> Result<(), StorageError>;

  /// Insert or replace one entry in an existing generation.
  /// Returns false if the generation does not exist.
  fn put_entry(&self, generation: &str, entry: &CacheEntry) -> Result<bool, StorageError>;

  fn get_entry(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>, StorageError>;

  /// All stored generations, oldest first.
  fn generations(&self) -> Result<Vec<GenerationInfo>, StorageError>;

  fn active_generation(&self) -> Result<Option<String>, StorageError>;

  /// Make `generation` the only active one, demoting any other.
  /// Returns false if the generation does not exist.
  fn mark_active(&self, generation: &str) -> Result<bool, StorageError>;

  /// Delete every generation except `keep` (all of them if `None`).
  /// Returns the number of generations deleted.
  fn delete_generations_except(&self, keep: Option<&str>) -> Result<usize, StorageError>;

  /// Delete generations installed before the active one. Generations
  /// installed after it may be waiting to replace it and are kept, as is
  /// everything when nothing is active. Returns the number deleted.
  fn delete_superseded_generations(&self) -> Result<usize, StorageError>;
}
