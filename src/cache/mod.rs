//! Versioned request cache for offline support.
//!
//! This module provides:
//! - Generations: named snapshots of request/response pairs, one of them active
//! - All-or-nothing install of a generation from a list of URLs
//! - Activation that deletes every other generation
//! - Best-effort runtime population of the active generation

mod entry;
mod layer;
mod storage;
mod traits;

pub use entry::{CacheEntry, CacheKey};
pub use layer::VersionedCache;
pub use storage::SqliteStorage;
pub use traits::{CacheStorage, GenerationInfo, GenerationState};
