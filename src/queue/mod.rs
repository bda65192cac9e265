//! Durable write queue with ordered replay.
//!
//! Mutations are accepted locally at any time and replayed strictly in
//! submission order once connectivity returns. A failed item that exhausts
//! its retry budget halts the queue: later items may depend on it.

mod item;
mod store;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{ApplyError, StorageError};

pub use item::{OperationKind, QueueItem, QueueStatus};
pub use store::{QueueStore, SqliteQueueStore};

/// Result of applying one mutation on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
  Done,
  /// The server confirmed the resource under a different identifier;
  /// later items referencing `from` must use `to`.
  Reassigned { from: String, to: String },
}

/// The real network mutation, supplied by the caller.
#[async_trait]
pub trait ApplyMutation: Send + Sync {
  async fn apply(&self, item: &QueueItem) -> Result<Applied, ApplyError>;
}

/// Retry budget and backoff curve for replay.
#[derive(Debug, Clone)]
pub struct ReplayPolicy {
  pub max_attempts: u32,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
  /// Age after which another replayer's IN_FLIGHT claim counts as abandoned
  pub claim_lease: Duration,
}

impl Default for ReplayPolicy {
  fn default() -> Self {
    Self::from_config(&QueueConfig::default())
  }
}

impl ReplayPolicy {
  pub fn from_config(config: &QueueConfig) -> Self {
    Self {
      max_attempts: config.max_attempts.max(1),
      initial_backoff: Duration::from_millis(config.initial_backoff_ms),
      max_backoff: Duration::from_millis(config.max_backoff_ms),
      claim_lease: Duration::from_millis(config.claim_lease_ms),
    }
  }

  /// Delay before retrying after the `attempt`-th failure (1-based):
  /// initial, 2×, 4×, ... capped at `max_backoff`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    ExponentialBuilder::default()
      .with_min_delay(self.initial_backoff)
      .with_max_delay(self.max_backoff)
      .with_factor(2.0)
      .with_max_times(self.max_attempts as usize)
      .build()
      .nth(attempt.saturating_sub(1) as usize)
      .unwrap_or(self.max_backoff)
  }
}

/// Published when an item exhausts its retries and halts the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFailure {
  pub item_id: String,
  pub operation: OperationKind,
  pub target: String,
  pub attempts: u32,
  pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
  /// Every item settled
  Drained,
  /// A FAILED item blocks the queue until dismissed or retried
  Halted { item_id: String },
  /// Connectivity dropped; remaining items stay PENDING
  Interrupted,
  /// Another replayer holds the head item and its claim is still live
  Busy { item_id: String },
  /// A replay was already running in this process
  AlreadyRunning,
  Storage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
  pub applied: usize,
  pub outcome: ReplayOutcome,
}

enum Step {
  Applied,
  Retry(Duration),
  Failed,
  /// The item left PENDING before we could claim it, or our claim was
  /// taken back while applying
  Skipped,
}

/// Clears the re-entrancy flag when a replay ends, however it ends.
struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

pub struct WriteQueue<S: QueueStore> {
  store: Arc<S>,
  /// Claimer id recorded on every item this queue takes IN_FLIGHT
  owner: String,
  monitor: Arc<ConnectivityMonitor>,
  policy: ReplayPolicy,
  replaying: AtomicBool,
  cycles: AtomicU64,
  failures: broadcast::Sender<ReplayFailure>,
}

impl<S: QueueStore> WriteQueue<S> {
  /// Open the queue, returning IN_FLIGHT items whose claim lease has run
  /// out to PENDING. Items another live process is applying stay put.
  pub fn new(
    store: S,
    monitor: Arc<ConnectivityMonitor>,
    policy: ReplayPolicy,
  ) -> Result<Self, StorageError> {
    let owner = Uuid::new_v4().to_string();
    let recovered = store.recover_in_flight(&owner, policy.claim_lease)?;
    if recovered > 0 {
      warn!(recovered, "Recovered interrupted queue items");
    }

    let (failures, _) = broadcast::channel(64);
    Ok(Self {
      store: Arc::new(store),
      owner,
      monitor,
      policy,
      replaying: AtomicBool::new(false),
      cycles: AtomicU64::new(0),
      failures,
    })
  }

  /// Durably append a mutation and return its local id.
  pub fn submit(
    &self,
    operation: OperationKind,
    target: &str,
    payload: Value,
  ) -> Result<String, StorageError> {
    let item = QueueItem::new(operation, target, payload);
    self.store.append(&item)?;
    info!(id = %item.id, operation = operation.as_str(), target, "Queued mutation");
    Ok(item.id)
  }

  /// Withdraw a PENDING item. Unknown, in-flight or settled ids are a no-op.
  pub fn cancel(&self, id: &str) -> Result<bool, StorageError> {
    let removed = self.store.remove(id, QueueStatus::Pending)?;
    if removed {
      info!(id, "Cancelled queued mutation");
    }
    Ok(removed)
  }

  /// Drop a FAILED item, unblocking the items behind it.
  pub fn dismiss(&self, id: &str) -> Result<bool, StorageError> {
    let removed = self.store.remove(id, QueueStatus::Failed)?;
    if removed {
      info!(id, "Dismissed failed mutation");
    }
    Ok(removed)
  }

  /// Put a FAILED item back in line with a fresh attempt budget.
  pub fn retry(&self, id: &str) -> Result<bool, StorageError> {
    self.store.requeue_failed(id)
  }

  pub fn get(&self, id: &str) -> Result<Option<QueueItem>, StorageError> {
    self.store.get(id)
  }

  pub fn list(&self) -> Result<Vec<QueueItem>, StorageError> {
    self.store.list()
  }

  pub fn failures(&self) -> Result<Vec<QueueItem>, StorageError> {
    Ok(
      self
        .store
        .list()?
        .into_iter()
        .filter(|i| i.status == QueueStatus::Failed)
        .collect(),
    )
  }

  pub fn pending_count(&self) -> Result<usize, StorageError> {
    Ok(
      self
        .store
        .list()?
        .iter()
        .filter(|i| i.status == QueueStatus::Pending)
        .count(),
    )
  }

  pub fn subscribe_failures(&self) -> broadcast::Receiver<ReplayFailure> {
    self.failures.subscribe()
  }

  pub fn is_replaying(&self) -> bool {
    self.replaying.load(Ordering::Acquire)
  }

  /// Number of replay cycles started so far.
  pub fn replay_cycles(&self) -> u64 {
    self.cycles.load(Ordering::Acquire)
  }

  /// Replay queued items in submission order until the queue drains, an item
  /// fails terminally, or connectivity drops.
  pub async fn replay(&self, apply: &dyn ApplyMutation) -> ReplayReport {
    if self.replaying.swap(true, Ordering::AcqRel) {
      debug!("Replay already running");
      return ReplayReport {
        applied: 0,
        outcome: ReplayOutcome::AlreadyRunning,
      };
    }
    let _guard = ReplayGuard(&self.replaying);
    let cycle = self.cycles.fetch_add(1, Ordering::AcqRel) + 1;
    debug!(cycle, "Replay started");

    let mut applied = 0;
    let outcome = loop {
      if !self.monitor.is_online() {
        break ReplayOutcome::Interrupted;
      }

      let head = match self.store.list() {
        Ok(items) => items.into_iter().next(),
        Err(e) => break ReplayOutcome::Storage(e.to_string()),
      };
      let item = match head {
        Some(item) => item,
        None => break ReplayOutcome::Drained,
      };

      match item.status {
        QueueStatus::Failed => break ReplayOutcome::Halted { item_id: item.id },
        QueueStatus::InFlight => match self.store.recover_in_flight(&self.owner, self.policy.claim_lease) {
          Ok(0) => break ReplayOutcome::Busy { item_id: item.id },
          Ok(recovered) => {
            warn!(recovered, "Took back queue items with expired claims");
            continue;
          }
          Err(e) => break ReplayOutcome::Storage(e.to_string()),
        },
        QueueStatus::Pending | QueueStatus::Done => {}
      }

      match self.attempt(item, apply).await {
        Ok(Step::Applied) => applied += 1,
        Ok(Step::Retry(delay)) => tokio::time::sleep(delay).await,
        Ok(Step::Failed) => {
          // The head is now FAILED; the next pass reports the halt
        }
        Ok(Step::Skipped) => {}
        Err(e) => break ReplayOutcome::Storage(e.to_string()),
      }
    };

    match &outcome {
      ReplayOutcome::Storage(e) => error!(cycle, applied, error = %e, "Replay aborted"),
      _ => info!(cycle, applied, outcome = ?outcome, "Replay finished"),
    }
    ReplayReport { applied, outcome }
  }

  async fn attempt(&self, mut item: QueueItem, apply: &dyn ApplyMutation) -> Result<Step, StorageError> {
    if !self.store.claim(&item.id, &self.owner)? {
      return Ok(Step::Skipped);
    }
    item.status = QueueStatus::InFlight;
    let attempt = item.attempts + 1;
    debug!(id = %item.id, attempt, target = %item.target, "Applying queued mutation");

    match apply.apply(&item).await {
      Ok(result) => {
        if let Applied::Reassigned { from, to } = &result {
          let rewritten = self.reassign(&item.id, from, to)?;
          info!(from = %from, to = %to, rewritten, "Identifier reassigned by server");
        }
        // DONE items are pruned
        if !self.store.complete(&item.id, &self.owner)? {
          warn!(id = %item.id, attempt, "Claim lost while applying, leaving item to its new holder");
          return Ok(Step::Skipped);
        }
        info!(id = %item.id, attempt, "Queued mutation applied");
        Ok(Step::Applied)
      }
      Err(e) => {
        let message = e.to_string();
        let next = if e.is_permanent() || attempt >= self.policy.max_attempts {
          QueueStatus::Failed
        } else {
          QueueStatus::Pending
        };
        if !self
          .store
          .record_failure(&item.id, &self.owner, attempt, &message, next)?
        {
          warn!(id = %item.id, attempt, error = %message, "Claim lost while applying, failure not recorded");
          return Ok(Step::Skipped);
        }

        if next.is_terminal() {
          error!(id = %item.id, attempt, error = %message, "Queued mutation failed, queue halted");
          // No subscribers is fine; failures stay visible via `failures()`
          let _ = self.failures.send(ReplayFailure {
            item_id: item.id,
            operation: item.operation,
            target: item.target,
            attempts: attempt,
            error: message,
          });
          Ok(Step::Failed)
        } else {
          let delay = self.policy.backoff(attempt);
          warn!(id = %item.id, attempt, retry_in = ?delay, error = %message, "Queued mutation failed, retrying");
          Ok(Step::Retry(delay))
        }
      }
    }
  }

  /// Point later PENDING items at the server-confirmed identifier.
  fn reassign(&self, applied_id: &str, from: &str, to: &str) -> Result<usize, StorageError> {
    let mut rewritten = 0;
    for mut item in self.store.list()? {
      if item.id == applied_id || item.status != QueueStatus::Pending {
        continue;
      }
      if item.rewrite_reference(from, to) && self.store.update_pending(&item)? {
        rewritten += 1;
      }
    }
    Ok(rewritten)
  }
}

/// Run a replay on every OFFLINE→ONLINE transition until `shutdown` flips.
///
/// Also replays once at start if the monitor is online, so items left PENDING
/// by a previous process resume without being resubmitted. Triggers that
/// arrive while a replay is running are dropped.
pub fn spawn_replay_driver<S: QueueStore + 'static>(
  queue: Arc<WriteQueue<S>>,
  apply: Arc<dyn ApplyMutation>,
  monitor: Arc<ConnectivityMonitor>,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  let (tx, mut rx) = mpsc::unbounded_channel::<u64>();

  let trigger = tx.clone();
  monitor.on_change(move |transition| {
    if transition.is_reconnect() {
      let _ = trigger.send(transition.counter);
    }
  });
  if monitor.is_online() {
    let _ = tx.send(0);
  }
  drop(tx);

  tokio::spawn(async move {
    loop {
      tokio::select! {
        trigger = rx.recv() => {
          let counter = match trigger {
            Some(counter) => counter,
            None => break,
          };
          debug!(transition = counter, "Replay triggered");
          queue.replay(apply.as_ref()).await;
          while rx.try_recv().is_ok() {}
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    debug!(cycles = queue.replay_cycles(), "Replay driver stopped");
  })
}

#[cfg(test)]
pub mod testing {
  use super::*;
  use std::collections::{HashMap, VecDeque};
  use std::sync::Mutex;

  /// Records applied targets in order; scripted results per target.
  #[derive(Default)]
  pub struct RecordingApply {
    pub applied: Mutex<Vec<String>>,
    script: Mutex<HashMap<String, VecDeque<Result<Applied, ApplyError>>>>,
    delay: Option<Duration>,
  }

  impl RecordingApply {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
      Self {
        delay: Some(delay),
        ..Self::default()
      }
    }

    pub fn script(&self, target: &str, result: Result<Applied, ApplyError>) {
      self
        .script
        .lock()
        .unwrap()
        .entry(target.to_string())
        .or_default()
        .push_back(result);
    }

    pub fn calls(&self) -> Vec<String> {
      self.applied.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl ApplyMutation for RecordingApply {
    async fn apply(&self, item: &QueueItem) -> Result<Applied, ApplyError> {
      self.applied.lock().unwrap().push(item.target.clone());
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      let scripted = self
        .script
        .lock()
        .unwrap()
        .get_mut(&item.target)
        .and_then(|q| q.pop_front());
      scripted.unwrap_or(Ok(Applied::Done))
    }
  }
}
