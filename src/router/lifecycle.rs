use serde::Serialize;
use std::collections::BTreeSet;

/// Lifecycle of the newest cache installation.
///
/// `UNINSTALLED → INSTALLING → INSTALLED(g) → ACTIVE(g)`. While a newer
/// generation sits in `Installed`, the previously active one keeps serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "generation", rename_all = "lowercase")]
pub enum LifecycleState {
  Uninstalled,
  Installing(String),
  Installed(String),
  Active(String),
}

/// Out-of-band messages from a foreground controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
  /// Activate an installed generation without waiting for clients to leave
  SkipWaiting,
}

/// Handle for a connected client, returned by `connect_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClientId(u64);

#[derive(Debug)]
pub(super) struct Lifecycle {
  pub state: LifecycleState,
  /// Generation currently serving lookups
  pub serving: Option<String>,
  pub skip_waiting: bool,
  pub development: bool,
  clients: BTreeSet<ClientId>,
  next_client: u64,
}

impl Lifecycle {
  pub fn new(serving: Option<String>) -> Self {
    let state = match &serving {
      Some(generation) => LifecycleState::Active(generation.clone()),
      None => LifecycleState::Uninstalled,
    };
    Self {
      state,
      serving,
      skip_waiting: false,
      development: false,
      clients: BTreeSet::new(),
      next_client: 0,
    }
  }

  pub fn connect(&mut self) -> ClientId {
    self.next_client += 1;
    let id = ClientId(self.next_client);
    self.clients.insert(id);
    id
  }

  pub fn disconnect(&mut self, id: ClientId) -> bool {
    self.clients.remove(&id)
  }

  pub fn client_count(&self) -> usize {
    self.clients.len()
  }

  /// The installed generation, if it may activate now.
  ///
  /// It waits only while an older generation is serving connected clients.
  pub fn ready_to_activate(&self) -> Option<String> {
    match &self.state {
      LifecycleState::Installed(generation) => {
        let waiting = self.serving.is_some() && !self.clients.is_empty() && !self.skip_waiting;
        if waiting {
          None
        } else {
          Some(generation.clone())
        }
      }
      _ => None,
    }
  }

  pub fn mark_active(&mut self, generation: String) {
    self.serving = Some(generation.clone());
    self.state = LifecycleState::Active(generation);
    self.skip_waiting = false;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_first_install_does_not_wait() {
    let mut lifecycle = Lifecycle::new(None);
    lifecycle.connect();
    lifecycle.state = LifecycleState::Installed("v1".to_string());
    assert_eq!(lifecycle.ready_to_activate().as_deref(), Some("v1"));
  }

  #[test]
  fn test_upgrade_waits_for_clients() {
    let mut lifecycle = Lifecycle::new(Some("v1".to_string()));
    let client = lifecycle.connect();
    lifecycle.state = LifecycleState::Installed("v2".to_string());
    assert_eq!(lifecycle.ready_to_activate(), None);

    assert!(lifecycle.disconnect(client));
    assert!(!lifecycle.disconnect(client));
    assert_eq!(lifecycle.ready_to_activate().as_deref(), Some("v2"));
  }

  #[test]
  fn test_skip_waiting_overrides_clients() {
    let mut lifecycle = Lifecycle::new(Some("v1".to_string()));
    lifecycle.connect();
    lifecycle.state = LifecycleState::Installed("v2".to_string());
    lifecycle.skip_waiting = true;
    assert_eq!(lifecycle.ready_to_activate().as_deref(), Some("v2"));

    lifecycle.mark_active("v2".to_string());
    assert_eq!(lifecycle.state, LifecycleState::Active("v2".to_string()));
    assert!(!lifecycle.skip_waiting);
  }
}
