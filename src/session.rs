//! Process-scoped wiring of the offline layer.
//!
//! An `OfflineSession` owns the connectivity monitor, the versioned cache and
//! its router, the write queue and the allocator. It is created at session
//! start and torn down with `shutdown`; nothing lives in globals.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use crate::cache::{SqliteStorage, VersionedCache};
use crate::config::Config;
use crate::connectivity::{self, ConnectivityMonitor, Reachability, RouteReachability};
use crate::db::Database;
use crate::net::{Fetcher, HttpFetcher};
use crate::queue::{
  self, ApplyMutation, OperationKind, ReplayFailure, ReplayPolicy, ReplayReport, SqliteQueueStore,
  WriteQueue,
};
use crate::router::{RequestRouter, RoutePolicy};
use crate::sequence::{DocumentFamily, DocumentId, PartitionKey, SequenceAllocator, SqliteDocumentIndex};
use crate::sync::HttpApply;

pub struct OfflineSession {
  config: Config,
  monitor: Arc<ConnectivityMonitor>,
  reachability: Arc<dyn Reachability>,
  router: RequestRouter<SqliteStorage>,
  queue: Arc<WriteQueue<SqliteQueueStore>>,
  index: Arc<SqliteDocumentIndex>,
  allocator: SequenceAllocator,
  apply: Arc<dyn ApplyMutation>,
  shutdown: watch::Sender<bool>,
  tasks: Vec<JoinHandle<()>>,
}

impl OfflineSession {
  /// Open the database and build a session against the real network.
  pub fn open(config: Config, db_path: Option<&Path>) -> Result<Self> {
    let db = Arc::new(Database::open(db_path)?);
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&config)?);
    let reachability = Arc::new(RouteReachability::new(config.connectivity.probe_addr));
    Self::assemble(config, db, fetcher, reachability)
  }

  /// Build a session from already constructed platform pieces.
  pub fn assemble(
    config: Config,
    db: Arc<Database>,
    fetcher: Arc<dyn Fetcher>,
    reachability: Arc<dyn Reachability>,
  ) -> Result<Self> {
    let monitor = Arc::new(ConnectivityMonitor::new(reachability.as_ref()));

    let policy = RoutePolicy::from_config(config.server.origin.clone(), &config.cache);
    let cache = VersionedCache::new(SqliteStorage::new(db.clone()), fetcher.clone(), policy);
    let router = RequestRouter::new(cache, fetcher.clone());

    let queue = WriteQueue::new(
      SqliteQueueStore::new(db.clone()),
      monitor.clone(),
      ReplayPolicy::from_config(&config.queue),
    )
    .map_err(|e| eyre!("Failed to open write queue: {}", e))?;

    let index = Arc::new(SqliteDocumentIndex::new(db));
    let allocator = SequenceAllocator::new(index.clone(), config.sequence.max_retries);
    let apply = Arc::new(HttpApply::new(
      fetcher,
      config.api_url()?,
      index.clone(),
      config.sequence.max_retries,
    ));

    let (shutdown, _) = watch::channel(false);

    Ok(Self {
      config,
      monitor,
      reachability,
      router,
      queue: Arc::new(queue),
      index,
      allocator,
      apply,
      shutdown,
      tasks: Vec::new(),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
    &self.monitor
  }

  pub fn router(&self) -> &RequestRouter<SqliteStorage> {
    &self.router
  }

  pub fn queue(&self) -> &Arc<WriteQueue<SqliteQueueStore>> {
    &self.queue
  }

  pub fn allocator(&self) -> &SequenceAllocator {
    &self.allocator
  }

  pub fn subscribe_failures(&self) -> broadcast::Receiver<ReplayFailure> {
    self.queue.subscribe_failures()
  }

  /// Absolute URLs of the configured precache list.
  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    let policy = self.router.cache().policy();
    self
      .config
      .cache
      .precache
      .iter()
      .map(|path| {
        policy
          .resolve(path)
          .ok_or_else(|| eyre!("Invalid precache path '{}'", path))
      })
      .collect()
  }

  /// Install the configured generation unless it is already serving.
  ///
  /// A failed install is logged and leaves the previous generation serving.
  pub async fn install_configured(&self) -> Result<bool> {
    if self.router.is_development() {
      return Ok(false);
    }

    let generation = &self.config.cache.generation;
    let active = self
      .router
      .cache()
      .active_generation()
      .map_err(|e| eyre!("Failed to read cache generations: {}", e))?;
    if active.as_deref() == Some(generation.as_str()) {
      return Ok(false);
    }

    let urls = self.precache_urls()?;
    match self.router.install(generation, &urls).await {
      Ok(()) => Ok(true),
      Err(failure) => {
        for (url, reason) in &failure.failures {
          warn!(url = %url, reason = %reason, "Precache asset failed");
        }
        warn!(error = %failure, "Keeping previous cache generation");
        Ok(false)
      }
    }
  }

  /// Purge stale generations, install the configured one, and start the
  /// connectivity watcher and replay driver.
  pub async fn start(&mut self) -> Result<()> {
    self
      .router
      .start()
      .map_err(|e| eyre!("Failed to prepare cache: {}", e))?;
    self.install_configured().await?;

    let interval = Duration::from_millis(self.config.connectivity.poll_interval_ms.max(1));
    self.tasks.push(connectivity::spawn_watcher(
      self.monitor.clone(),
      self.reachability.clone(),
      interval,
      self.shutdown.subscribe(),
    ));
    self.tasks.push(queue::spawn_replay_driver(
      self.queue.clone(),
      self.apply.clone(),
      self.monitor.clone(),
      self.shutdown.subscribe(),
    ));

    info!(
      state = ?self.monitor.current_state(),
      pending = self.queue.pending_count().unwrap_or(0),
      "Offline session started"
    );
    Ok(())
  }

  /// Replay the queue now, outside the connectivity trigger.
  pub async fn replay_now(&self) -> ReplayReport {
    self.queue.replay(self.apply.as_ref()).await
  }

  /// Allocate an optimistic identifier in the current partition and queue
  /// the document's creation under it.
  pub async fn create_document(&self, family: DocumentFamily, payload: Value) -> Result<(DocumentId, String)> {
    self
      .create_document_in(family, PartitionKey::current(family), payload)
      .await
  }

  pub async fn create_document_in(
    &self,
    family: DocumentFamily,
    partition: PartitionKey,
    payload: Value,
  ) -> Result<(DocumentId, String)> {
    let mut fields = match payload {
      Value::Object(fields) => fields,
      Value::Null => serde_json::Map::new(),
      other => return Err(eyre!("Document payload must be a JSON object, got {}", other)),
    };

    let index = self.index.clone();
    let (id, ()) = self
      .allocator
      .create_with_retry(family, partition, |id| {
        let claimed = index.claim(&id);
        async move { claimed }
      })
      .await
      .map_err(|e| eyre!("Failed to allocate {} identifier: {}", family, e))?;

    fields.insert("id".to_string(), Value::String(id.to_string()));
    let item_id = self
      .queue
      .submit(OperationKind::Create, family.collection(), Value::Object(fields))
      .map_err(|e| eyre!("Failed to queue {}: {}", id, e))?;

    Ok((id, item_id))
  }

  /// Stop background tasks and wait for them to finish.
  pub async fn shutdown(mut self) {
    let _ = self.shutdown.send(true);
    for task in self.tasks.drain(..) {
      if let Err(e) = task.await {
        warn!(error = %e, "Background task ended abnormally");
      }
    }
    info!(
      transitions = self.monitor.transitions(),
      replay_cycles = self.queue.replay_cycles(),
      "Offline session stopped"
    );
  }
}
