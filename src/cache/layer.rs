//! Versioned cache that orchestrates generations with network fetching.

use futures::future::join_all;
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::entry::{CacheEntry, CacheKey};
use super::traits::{CacheStorage, GenerationInfo};
use crate::error::{CacheError, InstallFailure};
use crate::net::{Fetcher, HttpRequest, HttpResponse};
use crate::router::RoutePolicy;

/// Request→response cache scoped to named generations.
///
/// Lookups and runtime stores only ever touch the active generation.
/// Installing a generation is all-or-nothing, and activating one deletes
/// every other generation.
pub struct VersionedCache<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  policy: RoutePolicy,
}

impl<S: CacheStorage> VersionedCache<S> {
  pub fn new(storage: S, fetcher: Arc<dyn Fetcher>, policy: RoutePolicy) -> Self {
    Self {
      storage: Arc::new(storage),
      fetcher,
      policy,
    }
  }

  pub fn policy(&self) -> &RoutePolicy {
    &self.policy
  }

  /// Fetch every URL and store the responses as `generation`.
  ///
  /// Nothing is written unless every fetch returned a successful response.
  pub async fn install(&self, generation: &str, urls: &[Url]) -> Result<usize, InstallFailure> {
    info!(generation, assets = urls.len(), "Installing cache generation");

    let fetches = urls.iter().map(|url| async move {
      let request = HttpRequest::get(url.clone());
      let result = self.fetcher.fetch(&request).await;
      (url, result)
    });

    let mut entries = Vec::with_capacity(urls.len());
    let mut failures = Vec::new();
    for (url, result) in join_all(fetches).await {
      match result {
        Ok(response) if response.is_success() => {
          entries.push(CacheEntry::from_response(
            CacheKey::new(Method::GET.as_str(), url),
            &response,
          ));
        }
        Ok(response) => failures.push((url.to_string(), format!("status {}", response.status))),
        Err(e) => failures.push((url.to_string(), e.to_string())),
      }
    }

    if !failures.is_empty() {
      for (url, reason) in &failures {
        warn!(generation, url = %url, reason = %reason, "Asset failed to install");
      }
      return Err(InstallFailure {
        generation: generation.to_string(),
        failures,
      });
    }

    self
      .storage
      .put_generation(generation, &entries)
      .map_err(|e| InstallFailure {
        generation: generation.to_string(),
        failures: vec![("<storage>".to_string(), e.to_string())],
      })?;

    info!(generation, entries = entries.len(), "Cache generation installed");
    Ok(entries.len())
  }

  /// Mark `generation` active and delete every other generation.
  ///
  /// Returns false when it was already the active generation (no-op).
  pub fn activate(&self, generation: &str) -> Result<bool, CacheError> {
    if self.storage.active_generation()?.as_deref() == Some(generation) {
      // Still collect strays so the invariant holds after a crash
      self.storage.delete_generations_except(Some(generation))?;
      return Ok(false);
    }

    if !self.storage.mark_active(generation)? {
      return Err(CacheError::UnknownGeneration(generation.to_string()));
    }
    let purged = self.storage.delete_generations_except(Some(generation))?;

    info!(generation, purged, "Cache generation activated");
    Ok(true)
  }

  /// Read `(method, url)` from the active generation.
  ///
  /// Storage problems are logged and reported as a miss.
  pub fn lookup(&self, method: &str, url: &Url) -> Option<CacheEntry> {
    let generation = match self.storage.active_generation() {
      Ok(Some(generation)) => generation,
      Ok(None) => return None,
      Err(e) => {
        warn!(error = %e, "Cache lookup failed");
        return None;
      }
    };

    match self.storage.get_entry(&generation, &CacheKey::new(method, url)) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %url, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Best-effort write into the active generation.
  ///
  /// Responses that are cross-origin, unsuccessful or classified never-cache
  /// are silently skipped. Returns whether the entry was written.
  pub fn store(&self, method: &str, url: &Url, response: &HttpResponse) -> bool {
    if !self.policy.is_cacheable(method, url, response) {
      return false;
    }

    let generation = match self.storage.active_generation() {
      Ok(Some(generation)) => generation,
      Ok(None) => return false,
      Err(e) => {
        warn!(error = %e, "Cache store failed");
        return false;
      }
    };

    let entry = CacheEntry::from_response(CacheKey::new(method, url), response);
    match self.storage.put_entry(&generation, &entry) {
      Ok(written) => {
        debug!(url = %url, generation, written, "Cache store");
        written
      }
      Err(e) => {
        warn!(url = %url, error = %e, "Cache store failed");
        false
      }
    }
  }

  /// Delete all generations other than `generation`; `None` deletes them all.
  pub fn purge_except(&self, generation: Option<&str>) -> Result<usize, CacheError> {
    let purged = self.storage.delete_generations_except(generation)?;
    if purged > 0 {
      info!(keep = ?generation, purged, "Purged cache generations");
    }
    Ok(purged)
  }

  /// Delete generations older than the active one, keeping newer installed
  /// generations that may be waiting to take over.
  pub fn purge_superseded(&self) -> Result<usize, CacheError> {
    let purged = self.storage.delete_superseded_generations()?;
    if purged > 0 {
      info!(purged, "Purged superseded cache generations");
    }
    Ok(purged)
  }

  pub fn list_generations(&self) -> Result<Vec<String>, CacheError> {
    Ok(
      self
        .generations()?
        .into_iter()
        .map(|g| g.generation)
        .collect(),
    )
  }

  pub fn generations(&self) -> Result<Vec<GenerationInfo>, CacheError> {
    Ok(self.storage.generations()?)
  }

  pub fn active_generation(&self) -> Result<Option<String>, CacheError> {
    Ok(self.storage.active_generation()?)
  }
}

impl<S: CacheStorage> Clone for VersionedCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      policy: self.policy.clone(),
    }
  }
}
