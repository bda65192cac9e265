//! Cached request/response pairs.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::net::HttpResponse;

/// Response headers worth keeping with a cached body.
const KEPT_HEADERS: &[&str] = &["etag", "last-modified", "cache-control", "vary"];

/// Stable storage key for a `(method, absolute URL)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  pub method: String,
  pub url: Url,
}

impl CacheKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    // Fragments never reach the server
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url,
    }
  }

  /// SHA256 hash for fixed-length primary keys
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// One stored response. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Capture `response` under `key`, keeping only content headers.
  pub fn from_response(key: CacheKey, response: &HttpResponse) -> Self {
    let headers = response
      .headers
      .iter()
      .filter(|(name, _)| {
        let name = name.to_ascii_lowercase();
        name.starts_with("content-") || KEPT_HEADERS.contains(&name.as_str())
      })
      .cloned()
      .collect();

    Self {
      key,
      status: response.status,
      headers,
      body: response.body.clone(),
      stored_at: Utc::now(),
    }
  }

  pub fn to_response(&self) -> HttpResponse {
    HttpResponse {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
      url: self.key.url.clone(),
    }
  }
}
