//! Connectivity monitor.
//!
//! The monitor never touches the network itself. It is fed raw reachability
//! samples (from a [`Reachability`] primitive, usually via [`spawn_watcher`])
//! and turns them into de-duplicated, ordered state transitions.

mod reachability;

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use reachability::{Reachability, RouteReachability};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectivityState {
  Online,
  Offline,
}

impl ConnectivityState {
  fn from_sample(online: bool) -> Self {
    if online {
      ConnectivityState::Online
    } else {
      ConnectivityState::Offline
    }
  }
}

/// A genuine state change, numbered in the order it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
  pub from: ConnectivityState,
  pub to: ConnectivityState,
  /// Monotonic transition counter (1 for the first change)
  pub counter: u64,
}

impl Transition {
  pub fn is_reconnect(&self) -> bool {
    self.from == ConnectivityState::Offline && self.to == ConnectivityState::Online
  }
}

type Listener = Box<dyn Fn(Transition) + Send + Sync>;

struct MonitorState {
  state: ConnectivityState,
  transitions: u64,
}

pub struct ConnectivityMonitor {
  inner: Mutex<MonitorState>,
  /// Held while notifying, which serializes deliveries in transition order.
  listeners: Mutex<Vec<Listener>>,
  signal_available: bool,
}

impl ConnectivityMonitor {
  /// Sample the platform primitive once for the initial state.
  ///
  /// If the signal is unavailable the monitor starts ONLINE and stays ONLINE.
  pub fn new(reachability: &dyn Reachability) -> Self {
    match reachability.sample() {
      Some(online) => Self::with_state(ConnectivityState::from_sample(online)),
      None => {
        warn!("Reachability signal unavailable, assuming online");
        Self {
          inner: Mutex::new(MonitorState {
            state: ConnectivityState::Online,
            transitions: 0,
          }),
          listeners: Mutex::new(Vec::new()),
          signal_available: false,
        }
      }
    }
  }

  pub fn with_state(state: ConnectivityState) -> Self {
    Self {
      inner: Mutex::new(MonitorState {
        state,
        transitions: 0,
      }),
      listeners: Mutex::new(Vec::new()),
      signal_available: true,
    }
  }

  pub fn current_state(&self) -> ConnectivityState {
    match self.inner.lock() {
      Ok(inner) => inner.state,
      Err(poisoned) => poisoned.into_inner().state,
    }
  }

  pub fn is_online(&self) -> bool {
    self.current_state() == ConnectivityState::Online
  }

  /// Number of genuine transitions observed so far.
  pub fn transitions(&self) -> u64 {
    match self.inner.lock() {
      Ok(inner) => inner.transitions,
      Err(poisoned) => poisoned.into_inner().transitions,
    }
  }

  pub fn is_signal_available(&self) -> bool {
    self.signal_available
  }

  /// Register a callback invoked once per genuine transition.
  ///
  /// Callbacks run synchronously inside [`observe`](Self::observe) and must not
  /// register further listeners.
  pub fn on_change<F>(&self, listener: F)
  where
    F: Fn(Transition) + Send + Sync + 'static,
  {
    match self.listeners.lock() {
      Ok(mut listeners) => listeners.push(Box::new(listener)),
      Err(poisoned) => poisoned.into_inner().push(Box::new(listener)),
    }
  }

  /// Feed one raw sample. Returns the transition if the state changed.
  ///
  /// `None` samples and repeats of the current state are ignored, as is every
  /// sample when the signal was unavailable at construction.
  pub fn observe(&self, sample: Option<bool>) -> Option<Transition> {
    if !self.signal_available {
      return None;
    }
    let next = ConnectivityState::from_sample(sample?);

    let listeners = match self.listeners.lock() {
      Ok(listeners) => listeners,
      Err(poisoned) => poisoned.into_inner(),
    };

    let transition = {
      let mut inner = match self.inner.lock() {
        Ok(inner) => inner,
        Err(poisoned) => poisoned.into_inner(),
      };
      if inner.state == next {
        return None;
      }
      inner.transitions += 1;
      let transition = Transition {
        from: inner.state,
        to: next,
        counter: inner.transitions,
      };
      inner.state = next;
      transition
    };

    info!(
      from = ?transition.from,
      to = ?transition.to,
      counter = transition.counter,
      "Connectivity changed"
    );

    for listener in listeners.iter() {
      listener(transition);
    }

    Some(transition)
  }
}

/// Poll `reachability` every `interval` and feed the samples to `monitor`
/// until `shutdown` flips to true.
pub fn spawn_watcher(
  monitor: Arc<ConnectivityMonitor>,
  reachability: Arc<dyn Reachability>,
  interval: Duration,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    if !monitor.is_signal_available() {
      debug!("Connectivity watcher not started, signal unavailable");
      return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          monitor.observe(reachability.sample());
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    debug!("Connectivity watcher stopped");
  })
}

#[cfg(test)]
pub mod testing {
  use super::Reachability;
  use std::sync::Mutex;

  /// Reachability primitive driven by the test.
  pub struct ManualReachability(pub Mutex<Option<bool>>);

  impl ManualReachability {
    pub fn new(sample: Option<bool>) -> Self {
      Self(Mutex::new(sample))
    }

    pub fn set(&self, sample: Option<bool>) {
      *self.0.lock().unwrap() = sample;
    }
  }

  impl Reachability for ManualReachability {
    fn sample(&self) -> Option<bool> {
      *self.0.lock().unwrap()
    }
  }
}
