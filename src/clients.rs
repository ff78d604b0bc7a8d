//! Open application instances and the broadcast channel that reaches them.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;

use crate::sync::PassOutcome;

/// Message posted to every open application instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// A drain pass finished; pending-order indicators should refresh
  SyncCompleted {
    tag: String,
    outcome: PassOutcome,
    delivered: usize,
    remaining: usize,
  },
  /// A new cache version took control of the page
  ControllerChanged { version: String },
  /// An order was accepted locally and awaits sync
  OrderQueued { id: i64 },
}

/// An open window/tab of the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
  pub id: u64,
  pub url: String,
  pub focused: bool,
  /// Cache version controlling this client, if any
  pub controller: Option<String>,
}

/// What a notification click did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAction {
  Focused(u64),
  Opened(u64),
}

/// Registry of open clients plus the message broadcast.
pub struct ClientRegistry {
  clients: Mutex<Vec<ClientInfo>>,
  next_id: AtomicU64,
  tx: broadcast::Sender<ClientMessage>,
}

impl Default for ClientRegistry {
  fn default() -> Self {
    Self::new(64)
  }
}

impl ClientRegistry {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self {
      clients: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(1),
      tx,
    }
  }

  fn clients(&self) -> MutexGuard<'_, Vec<ClientInfo>> {
    // A panic while holding this lock cannot leave the list half-updated.
    self.clients.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Register an open instance showing `url`; returns its id and inbox.
  pub fn connect(&self, url: &str) -> (u64, broadcast::Receiver<ClientMessage>) {
    let id = self.register(url, false);
    (id, self.tx.subscribe())
  }

  fn register(&self, url: &str, focused: bool) -> u64 {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self.clients().push(ClientInfo {
      id,
      url: url.to_string(),
      focused,
      controller: None,
    });
    id
  }

  pub fn disconnect(&self, id: u64) {
    self.clients().retain(|c| c.id != id);
  }

  /// Extra listener that is not a window (CLI, tests).
  pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
    self.tx.subscribe()
  }

  pub fn list(&self) -> Vec<ClientInfo> {
    self.clients().clone()
  }

  /// Post to every listener. Returns how many received it.
  pub fn broadcast(&self, message: ClientMessage) -> usize {
    match self.tx.send(message) {
      Ok(n) => n,
      Err(broadcast::error::SendError(message)) => {
        debug!(?message, "No clients listening");
        0
      }
    }
  }

  /// Put every open client under `version` right away.
  pub fn claim(&self, version: &str) -> usize {
    let claimed = {
      let mut clients = self.clients();
      for client in clients.iter_mut() {
        client.controller = Some(version.to_string());
      }
      clients.len()
    };
    self.broadcast(ClientMessage::ControllerChanged {
      version: version.to_string(),
    });
    claimed
  }

  /// Focus a client already showing `url`, or open a new one.
  pub fn focus_or_open(&self, url: &str) -> WindowAction {
    {
      let mut clients = self.clients();
      if let Some(idx) = clients.iter().position(|c| c.url == url) {
        for (i, client) in clients.iter_mut().enumerate() {
          client.focused = i == idx;
        }
        return WindowAction::Focused(clients[idx].id);
      }
      for client in clients.iter_mut() {
        client.focused = false;
      }
    }
    WindowAction::Opened(self.register(url, true))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_message_wire_format() {
    let msg = ClientMessage::SyncCompleted {
      tag: "sync-new-orders".into(),
      outcome: PassOutcome::Success,
      delivered: 2,
      remaining: 0,
    };
    let value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["type"], "SYNC_COMPLETED");
    assert_eq!(value["tag"], "sync-new-orders");
    assert_eq!(value["outcome"], "SUCCESS");
  }

  #[tokio::test]
  async fn test_broadcast_reaches_every_client() {
    let registry = ClientRegistry::default();
    let (_, mut a) = registry.connect("/cart");
    let (_, mut b) = registry.connect("/orders");

    let sent = registry.broadcast(ClientMessage::OrderQueued { id: 7 });
    assert_eq!(sent, 2);
    assert_eq!(a.recv().await.unwrap(), ClientMessage::OrderQueued { id: 7 });
    assert_eq!(b.recv().await.unwrap(), ClientMessage::OrderQueued { id: 7 });
  }

  #[test]
  fn test_broadcast_without_listeners_is_harmless() {
    let registry = ClientRegistry::default();
    assert_eq!(registry.broadcast(ClientMessage::OrderQueued { id: 1 }), 0);
  }

  #[test]
  fn test_claim_sets_controller_on_all_clients() {
    let registry = ClientRegistry::default();
    let (_, _rx1) = registry.connect("/");
    let (_, _rx2) = registry.connect("/cart");

    assert_eq!(registry.claim("v4"), 2);
    assert!(registry
      .list()
      .iter()
      .all(|c| c.controller.as_deref() == Some("v4")));
  }

  #[test]
  fn test_focus_existing_or_open_new() {
    let registry = ClientRegistry::default();
    let (cart, _rx) = registry.connect("/cart");

    assert_eq!(registry.focus_or_open("/cart"), WindowAction::Focused(cart));
    let opened = match registry.focus_or_open("/") {
      WindowAction::Opened(id) => id,
      other => panic!("expected a new window, got {:?}", other),
    };
    let clients = registry.list();
    assert_eq!(clients.len(), 2);
    assert!(clients.iter().find(|c| c.id == opened).unwrap().focused);
    assert!(!clients.iter().find(|c| c.id == cart).unwrap().focused);
  }
}
