//! Request router: every outbound request goes through [`RequestRouter::fetch`],
//! which always produces a response.

mod lifecycle;
mod policy;

use reqwest::Method;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, VersionedCache};
use crate::error::{CacheError, FetchError, InstallFailure};
use crate::net::{Destination, Fetcher, HttpRequest, HttpResponse};

use lifecycle::Lifecycle;
pub use lifecycle::{ClientId, ControlMessage, LifecycleState};
pub use policy::{RequestClass, RoutePolicy};

/// Where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// Cached offline page served for a failed navigation
  OfflineFallback,
  /// Synthesized transport error, no real response exists
  Synthetic,
}

#[derive(Debug, Clone)]
pub struct RoutedResponse {
  pub response: HttpResponse,
  pub source: ResponseSource,
}

impl RoutedResponse {
  fn network(response: HttpResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  fn synthetic(url: Url, error: &FetchError) -> Self {
    Self {
      response: HttpResponse::transport_error(url, &error.to_string()),
      source: ResponseSource::Synthetic,
    }
  }
}

pub struct RequestRouter<S: CacheStorage> {
  cache: VersionedCache<S>,
  fetcher: Arc<dyn Fetcher>,
  lifecycle: Mutex<Lifecycle>,
}

impl<S: CacheStorage> RequestRouter<S> {
  pub fn new(cache: VersionedCache<S>, fetcher: Arc<dyn Fetcher>) -> Self {
    let serving = cache.active_generation().unwrap_or_else(|e| {
      warn!(error = %e, "Could not read active cache generation");
      None
    });
    Self {
      cache,
      fetcher,
      lifecycle: Mutex::new(Lifecycle::new(serving)),
    }
  }

  fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
    match self.lifecycle.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  pub fn cache(&self) -> &VersionedCache<S> {
    &self.cache
  }

  pub fn state(&self) -> LifecycleState {
    self.lifecycle().state.clone()
  }

  pub fn is_development(&self) -> bool {
    self.lifecycle().development
  }

  /// Session start: switch to development bypass on a local host, otherwise
  /// drop generations the active one superseded. Newer installed generations
  /// may belong to another process waiting on its clients and are kept.
  pub fn start(&self) -> Result<(), CacheError> {
    if self.cache.policy().is_development() {
      self.enter_development_mode()?;
      return Ok(());
    }

    self.cache.purge_superseded()?;
    Ok(())
  }

  /// Uninstall everything and route every request straight to the network.
  pub fn enter_development_mode(&self) -> Result<usize, CacheError> {
    {
      let mut lifecycle = self.lifecycle();
      lifecycle.development = true;
      lifecycle.state = LifecycleState::Uninstalled;
      lifecycle.serving = None;
      lifecycle.skip_waiting = false;
    }
    let purged = self.cache.purge_except(None)?;
    info!(purged, "Development host detected, cache disabled");
    Ok(purged)
  }

  /// Install `generation` from `urls`, then activate it if nothing holds the
  /// previous generation.
  pub async fn install(&self, generation: &str, urls: &[Url]) -> Result<(), InstallFailure> {
    let previous = {
      let mut lifecycle = self.lifecycle();
      if lifecycle.development {
        debug!(generation, "Skipping install in development mode");
        return Ok(());
      }
      std::mem::replace(
        &mut lifecycle.state,
        LifecycleState::Installing(generation.to_string()),
      )
    };

    if let Err(e) = self.cache.install(generation, urls).await {
      self.lifecycle().state = previous;
      return Err(e);
    }

    self.lifecycle().state = LifecycleState::Installed(generation.to_string());

    if let Err(e) = self.activate_if_ready() {
      warn!(generation, error = %e, "Activation after install failed");
    }
    Ok(())
  }

  /// Activate the installed generation if it is not waiting on clients.
  /// Returns whether an activation happened.
  pub fn activate_if_ready(&self) -> Result<bool, CacheError> {
    let mut lifecycle = self.lifecycle();
    let generation = match lifecycle.ready_to_activate() {
      Some(generation) => generation,
      None => return Ok(false),
    };

    self.cache.activate(&generation)?;
    lifecycle.mark_active(generation);
    Ok(true)
  }

  pub fn handle_message(&self, message: ControlMessage) -> Result<bool, CacheError> {
    match message {
      ControlMessage::SkipWaiting => {
        debug!("skip-waiting received");
        self.lifecycle().skip_waiting = true;
        self.activate_if_ready()
      }
    }
  }

  pub fn connect_client(&self) -> ClientId {
    self.lifecycle().connect()
  }

  /// Release a client; the last one out lets a waiting generation activate.
  pub fn disconnect_client(&self, id: ClientId) -> Result<bool, CacheError> {
    let remaining = {
      let mut lifecycle = self.lifecycle();
      lifecycle.disconnect(id);
      lifecycle.client_count()
    };
    if remaining == 0 {
      return self.activate_if_ready();
    }
    Ok(false)
  }

  /// Route one request. Never fails: irrecoverable failures become a
  /// synthetic transport-error response.
  pub async fn fetch(&self, request: &HttpRequest) -> RoutedResponse {
    if self.is_development() {
      return self.network_only(request).await;
    }

    match self.cache.policy().classify(&request.url) {
      RequestClass::Passthrough | RequestClass::NetworkOnly => self.network_only(request).await,
      RequestClass::CacheFirst if request.method != Method::GET => {
        self.network_only(request).await
      }
      RequestClass::CacheFirst => self.cache_first(request).await,
    }
  }

  async fn network_only(&self, request: &HttpRequest) -> RoutedResponse {
    match self.fetcher.fetch(request).await {
      Ok(response) => RoutedResponse::network(response),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network request failed");
        RoutedResponse::synthetic(request.url.clone(), &e)
      }
    }
  }

  async fn cache_first(&self, request: &HttpRequest) -> RoutedResponse {
    let method = request.method.as_str();

    if let Some(entry) = self.cache.lookup(method, &request.url) {
      debug!(url = %request.url, "Cache hit");
      return RoutedResponse {
        response: entry.to_response(),
        source: ResponseSource::Cache,
      };
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.cache.store(method, &request.url, &response);
        RoutedResponse::network(response)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Cache miss and network failure");
        self.offline_fallback(request, &e)
      }
    }
  }

  fn offline_fallback(&self, request: &HttpRequest, error: &FetchError) -> RoutedResponse {
    if request.destination == Destination::Document {
      let fallback = self
        .cache
        .policy()
        .offline_fallback_url()
        .and_then(|url| self.cache.lookup(Method::GET.as_str(), &url));
      if let Some(entry) = fallback {
        return RoutedResponse {
          response: entry.to_response(),
          source: ResponseSource::OfflineFallback,
        };
      }
    }
    RoutedResponse::synthetic(request.url.clone(), error)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::net::testing::ScriptedFetcher;
  use crate::net::TRANSPORT_ERROR_STATUS;

  fn url_for(origin: &str, path: &str) -> Url {
    Url::parse(origin).unwrap().join(path).unwrap()
  }

  fn router_for(origin: &str) -> (RequestRouter<SqliteStorage>, Arc<ScriptedFetcher>) {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let storage = SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()));
    let policy = RoutePolicy::new(Url::parse(origin).unwrap());
    let cache = VersionedCache::new(storage, fetcher.clone(), policy);
    (RequestRouter::new(cache, fetcher.clone()), fetcher)
  }

  const ORIGIN: &str = "https://fleet.example.com";

  fn url(path: &str) -> Url {
    url_for(ORIGIN, path)
  }

  async fn installed_router() -> (RequestRouter<SqliteStorage>, Arc<ScriptedFetcher>) {
    let (router, fetcher) = router_for(ORIGIN);
    fetcher.respond(url("/").as_str(), 200, "home");
    fetcher.respond(url("/offline").as_str(), 200, "you are offline");
    router
      .install("v1", &[url("/"), url("/offline")])
      .await
      .unwrap();
    (router, fetcher)
  }

  #[tokio::test]
  async fn test_cache_hit_skips_network() {
    let (router, fetcher) = installed_router().await;
    assert_eq!(router.state(), LifecycleState::Active("v1".to_string()));

    let routed = router.fetch(&HttpRequest::navigate(url("/"))).await;
    assert_eq!(routed.source, ResponseSource::Cache);
    assert_eq!(routed.response.body, b"home");
    // Only the install fetch
    assert_eq!(fetcher.request_count(url("/").as_str()), 1);
  }

  #[tokio::test]
  async fn test_miss_fetches_and_stores() {
    let (router, fetcher) = installed_router().await;
    fetcher.respond(url("/vehicles").as_str(), 200, "vehicles");

    let first = router.fetch(&HttpRequest::get(url("/vehicles"))).await;
    assert_eq!(first.source, ResponseSource::Network);

    fetcher.fail(url("/vehicles").as_str());
    let second = router.fetch(&HttpRequest::get(url("/vehicles"))).await;
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.body, b"vehicles");
    assert_eq!(fetcher.request_count(url("/vehicles").as_str()), 1);
  }

  #[tokio::test]
  async fn test_never_cache_paths_always_hit_network() {
    let (router, fetcher) = installed_router().await;
    let api = url("/api/work-orders");
    fetcher.push(api.as_str(), Ok(HttpResponse::new(api.clone(), 200, "[1]")));
    fetcher.push(api.as_str(), Ok(HttpResponse::new(api.clone(), 200, "[1,2]")));

    let first = router.fetch(&HttpRequest::get(api.clone())).await;
    let second = router.fetch(&HttpRequest::get(api.clone())).await;
    assert_eq!(first.response.body, b"[1]");
    assert_eq!(second.response.body, b"[1,2]");
    assert_eq!(second.source, ResponseSource::Network);

    // Offline: never served from cache
    fetcher.fail(api.as_str());
    let offline = router.fetch(&HttpRequest::get(api.clone())).await;
    assert_eq!(offline.source, ResponseSource::Synthetic);
    assert_eq!(offline.response.status, TRANSPORT_ERROR_STATUS);
  }

  #[tokio::test]
  async fn test_navigation_failure_serves_offline_page() {
    let (router, fetcher) = installed_router().await;
    fetcher.fail(url("/reports").as_str());

    let routed = router.fetch(&HttpRequest::navigate(url("/reports"))).await;
    assert_eq!(routed.source, ResponseSource::OfflineFallback);
    assert_eq!(routed.response.body, b"you are offline");

    let routed = router.fetch(&HttpRequest::get(url("/reports"))).await;
    assert_eq!(routed.source, ResponseSource::Synthetic);
    assert!(routed.response.is_transport_error());
  }

  #[tokio::test]
  async fn test_passthrough_bypasses_cache() {
    let (router, fetcher) = installed_router().await;
    let ext = Url::parse("chrome-extension://abcdef/inject.js").unwrap();

    let routed = router.fetch(&HttpRequest::get(ext.clone())).await;
    assert_eq!(routed.source, ResponseSource::Synthetic);
    assert_eq!(fetcher.request_count(ext.as_str()), 1);
  }

  #[tokio::test]
  async fn test_non_get_goes_to_network() {
    let (router, fetcher) = installed_router().await;
    fetcher.respond(url("/").as_str(), 200, "posted");

    let request = HttpRequest::get(url("/")).with_json(Method::POST, &serde_json::json!({}));
    let routed = router.fetch(&request).await;
    assert_eq!(routed.source, ResponseSource::Network);
    assert_eq!(routed.response.body, b"posted");
  }

  #[tokio::test]
  async fn test_upgrade_waits_for_clients_then_skip_waiting() {
    let (router, fetcher) = installed_router().await;
    let client = router.connect_client();

    fetcher.respond(url("/").as_str(), 200, "home v2");
    router.install("v2", &[url("/"), url("/offline")]).await.unwrap();
    assert_eq!(router.state(), LifecycleState::Installed("v2".to_string()));

    // Old generation still serving
    let routed = router.fetch(&HttpRequest::navigate(url("/"))).await;
    assert_eq!(routed.response.body, b"home");

    assert!(router.handle_message(ControlMessage::SkipWaiting).unwrap());
    assert_eq!(router.state(), LifecycleState::Active("v2".to_string()));
    assert_eq!(router.cache().list_generations().unwrap(), vec!["v2".to_string()]);

    let routed = router.fetch(&HttpRequest::navigate(url("/"))).await;
    assert_eq!(routed.response.body, b"home v2");

    assert!(!router.disconnect_client(client).unwrap());
  }

  #[tokio::test]
  async fn test_last_client_leaving_activates_waiting_generation() {
    let (router, _fetcher) = installed_router().await;
    let a = router.connect_client();
    let b = router.connect_client();

    router.install("v2", &[url("/")]).await.unwrap();
    assert!(!router.disconnect_client(a).unwrap());
    assert_eq!(router.state(), LifecycleState::Installed("v2".to_string()));

    assert!(router.disconnect_client(b).unwrap());
    assert_eq!(router.state(), LifecycleState::Active("v2".to_string()));
  }

  #[tokio::test]
  async fn test_failed_install_restores_state() {
    let (router, fetcher) = installed_router().await;
    fetcher.fail(url("/new").as_str());

    assert!(router.install("v2", &[url("/"), url("/new")]).await.is_err());
    assert_eq!(router.state(), LifecycleState::Active("v1".to_string()));
    assert_eq!(router.cache().list_generations().unwrap(), vec!["v1".to_string()]);
  }

  #[tokio::test]
  async fn test_development_host_bypasses_cache() {
    let origin = "http://localhost:3000";
    let (router, fetcher) = router_for(origin);
    let home = url_for(origin, "/");
    fetcher.respond(home.as_str(), 200, "dev");

    // Leftover generation from an earlier production-like run
    router.cache().install("v1", &[home.clone()]).await.unwrap();
    router.cache().activate("v1").unwrap();

    router.start().unwrap();
    assert!(router.is_development());
    assert_eq!(router.state(), LifecycleState::Uninstalled);
    assert!(router.cache().list_generations().unwrap().is_empty());

    router.install("v2", &[home.clone()]).await.unwrap();
    assert!(router.cache().list_generations().unwrap().is_empty());

    router.fetch(&HttpRequest::get(home.clone())).await;
    router.fetch(&HttpRequest::get(home.clone())).await;
    // One install fetch plus two routed fetches
    assert_eq!(fetcher.request_count(home.as_str()), 3);
  }

  #[tokio::test]
  async fn test_start_purges_superseded_generations() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let leftovers = SqliteStorage::new(db.clone());
    leftovers.put_generation("v0", &[]).unwrap();
    leftovers.put_generation("v1", &[]).unwrap();
    // Activated without the cleanup activate() does, leaving v0 behind
    leftovers.mark_active("v1").unwrap();

    let fetcher = Arc::new(ScriptedFetcher::new());
    let policy = RoutePolicy::new(Url::parse(ORIGIN).unwrap());
    let cache = VersionedCache::new(SqliteStorage::new(db), fetcher.clone(), policy);
    let router = RequestRouter::new(cache, fetcher);

    router.start().unwrap();
    assert_eq!(router.cache().list_generations().unwrap(), vec!["v1".to_string()]);
    assert_eq!(router.state(), LifecycleState::Active("v1".to_string()));
  }

  #[tokio::test]
  async fn test_start_keeps_generation_waiting_in_another_process() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let open = || {
      let fetcher = Arc::new(ScriptedFetcher::new());
      fetcher.respond(url("/").as_str(), 200, "home");
      let policy = RoutePolicy::new(Url::parse(ORIGIN).unwrap());
      let cache = VersionedCache::new(SqliteStorage::new(db.clone()), fetcher.clone(), policy);
      RequestRouter::new(cache, fetcher)
    };

    let running = open();
    running.install("v1", &[url("/")]).await.unwrap();
    let client = running.connect_client();
    running.install("v2", &[url("/")]).await.unwrap();
    assert_eq!(running.state(), LifecycleState::Installed("v2".to_string()));

    // A second process starts against the same database
    let other = open();
    other.start().unwrap();
    assert_eq!(
      other.cache().list_generations().unwrap(),
      vec!["v1".to_string(), "v2".to_string()]
    );

    assert!(running.disconnect_client(client).unwrap());
    assert_eq!(running.state(), LifecycleState::Active("v2".to_string()));
    assert_eq!(running.cache().list_generations().unwrap(), vec!["v2".to_string()]);
  }
}
