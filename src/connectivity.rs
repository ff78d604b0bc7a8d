//! Connectivity monitor: turns "the network came back" into a sync event.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use url::Url;

use crate::event::Event;
use crate::http::Request;
use crate::network::Network;
use crate::sync::SyncTrigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

pub struct ConnectivityMonitor {
  network: Arc<dyn Network>,
  probe_url: Url,
  interval: Duration,
  restoration_tag: String,
  state: Option<Connectivity>,
}

impl ConnectivityMonitor {
  pub fn new(
    network: Arc<dyn Network>,
    probe_url: Url,
    interval: Duration,
    restoration_tag: &str,
  ) -> Self {
    Self {
      network,
      probe_url,
      interval,
      restoration_tag: restoration_tag.to_string(),
      state: None,
    }
  }

  /// Last observed state; `None` before the first probe.
  pub fn state(&self) -> Option<Connectivity> {
    self.state
  }

  /// Probe once. Any response counts as online, the status is irrelevant.
  ///
  /// Returns a trigger only on an Offline → Online transition; the first
  /// probe just records the state.
  pub async fn probe(&mut self) -> Option<SyncTrigger> {
    let now = match self.network.fetch(&Request::get(self.probe_url.clone())).await {
      Ok(_) => Connectivity::Online,
      Err(e) => {
        debug!(reason = %e.reason, "Probe failed");
        Connectivity::Offline
      }
    };

    let previous = self.state.replace(now);
    if previous != Some(now) {
      info!(state = ?now, "Connectivity changed");
    }

    match (previous, now) {
      (Some(Connectivity::Offline), Connectivity::Online) => {
        Some(SyncTrigger::new(&self.restoration_tag))
      }
      _ => None,
    }
  }

  /// Probe on a fixed interval until the event queue is closed.
  pub fn spawn(mut self, tx: mpsc::UnboundedSender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        if let Some(trigger) = self.probe().await {
          if tx.send(Event::Sync(trigger)).is_err() {
            break;
          }
        }
        if tx.is_closed() {
          break;
        }
      }
    })
  }
}
