use url::Url;

use crate::config::CacheConfig;
use crate::net::HttpResponse;

/// How a request is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Foreign scheme (extensions, data:, blob:...): untouched, no cache
  Passthrough,
  /// Build artifacts and dynamic API: network only, never read or written
  NetworkOnly,
  /// Cache-first with network refresh on miss
  CacheFirst,
}

/// URL classification shared by the router and the cache.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
  origin: Url,
  never_cache: Vec<String>,
  offline_fallback: String,
  development_hosts: Vec<String>,
}

impl RoutePolicy {
  /// Policy with the default prefixes for `origin`.
  pub fn new(origin: Url) -> Self {
    Self::from_config(origin, &CacheConfig::default())
  }

  pub fn from_config(origin: Url, config: &CacheConfig) -> Self {
    Self {
      origin,
      never_cache: config.never_cache.clone(),
      offline_fallback: config.offline_fallback.clone(),
      development_hosts: config
        .development_hosts
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .collect(),
    }
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn classify(&self, url: &Url) -> RequestClass {
    match url.scheme() {
      "http" | "https" => {}
      _ => return RequestClass::Passthrough,
    }

    if self.is_same_origin(url)
      && self
        .never_cache
        .iter()
        .any(|prefix| url.path().starts_with(prefix.as_str()))
    {
      return RequestClass::NetworkOnly;
    }

    RequestClass::CacheFirst
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  /// Whether a network response may be written to the cache.
  pub fn is_cacheable(&self, method: &str, url: &Url, response: &HttpResponse) -> bool {
    method.eq_ignore_ascii_case("GET")
      && response.is_success()
      && self.classify(url) == RequestClass::CacheFirst
      && self.is_same_origin(url)
      && self.is_same_origin(&response.url)
  }

  pub fn offline_fallback_url(&self) -> Option<Url> {
    self.origin.join(&self.offline_fallback).ok()
  }

  /// Whether the origin is a local development host.
  pub fn is_development(&self) -> bool {
    match self.origin.host_str() {
      Some(host) => {
        let host = host.to_ascii_lowercase();
        host.ends_with(".localhost") || self.development_hosts.iter().any(|h| *h == host)
      }
      None => false,
    }
  }

  /// Absolute URL for an application path.
  pub fn resolve(&self, path: &str) -> Option<Url> {
    self.origin.join(path).ok()
  }
}
