use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;
use crate::http::{Request, Response};
use crate::push::Notification;
use crate::sync::SyncTrigger;

/// Events delivered to the worker by its host.
#[derive(Debug)]
pub enum Event {
  /// Provision the configured cache version
  Install,
  /// Make the installed version active and claim clients
  Activate,
  /// Intercepted request; the response goes back on `respond_to`
  Fetch {
    request: Request,
    respond_to: oneshot::Sender<Result<Response, TransportError>>,
  },
  /// Background sync, connectivity restoration or a manual trigger
  Sync(SyncTrigger),
  /// Push message payload
  Push(Vec<u8>),
  /// User clicked a displayed notification
  NotificationClick(Notification),
}

/// Event queue feeding the worker. Ends once every sender is dropped.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create the queue and the sender used by producers (connectivity
  /// monitor, CLI, host glue).
  pub fn channel() -> (mpsc::UnboundedSender<Event>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
