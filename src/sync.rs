//! Sync orchestrator: replays the outbox against the orders endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::clients::{ClientMessage, ClientRegistry};
use crate::error::DurableStoreError;
use crate::http::{Request, IDEMPOTENCY_KEY};
use crate::network::Network;
use crate::outbox::{OutboxRecord, OutboxStatus, OutboxStore};

/// A platform sync event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTrigger {
  pub tag: String,
}

impl SyncTrigger {
  pub fn new(tag: &str) -> Self {
    Self {
      tag: tag.to_string(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Draining,
}

/// Result of one drain pass as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PassOutcome {
  Success,
  PartialFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub tag: String,
  pub outcome: PassOutcome,
  /// Acknowledged by the server and deleted
  pub delivered: usize,
  /// Answered non-2xx, left PENDING for a later pass
  pub rejected: usize,
  /// Reached the attempt cap during this pass
  pub dead_lettered: usize,
  /// Local store errors on individual records
  pub failed: usize,
  /// PENDING records left when the pass ended
  pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  Completed(SyncReport),
  /// Another pass holds the drain; this trigger did nothing
  AlreadyDraining,
  /// Tag is not an order-sync tag
  Ignored,
}

/// Clears the draining flag however the pass ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

enum Delivery {
  Delivered,
  Rejected(OutboxStatus),
  /// No response; `released` is false when the record could not be put
  /// back to PENDING and waits for recovery instead
  Unreachable { released: bool },
}

pub struct SyncOrchestrator {
  outbox: Arc<OutboxStore>,
  network: Arc<dyn Network>,
  clients: Arc<ClientRegistry>,
  orders_url: Url,
  order_tags: Vec<String>,
  max_attempts: u32,
  draining: AtomicBool,
}

impl SyncOrchestrator {
  pub fn new(
    outbox: Arc<OutboxStore>,
    network: Arc<dyn Network>,
    clients: Arc<ClientRegistry>,
    orders_url: Url,
  ) -> Self {
    Self {
      outbox,
      network,
      clients,
      orders_url,
      order_tags: vec![
        "sync-new-orders".to_string(),
        "sync-new-order".to_string(),
        "manual-sync-trigger".to_string(),
      ],
      max_attempts: 5,
      draining: AtomicBool::new(false),
    }
  }

  pub fn with_order_tags(mut self, tags: Vec<String>) -> Self {
    self.order_tags = tags;
    self
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  pub fn state(&self) -> SyncState {
    if self.draining.load(Ordering::Acquire) {
      SyncState::Draining
    } else {
      SyncState::Idle
    }
  }

  pub fn handles(&self, tag: &str) -> bool {
    self.order_tags.iter().any(|t| t == tag)
  }

  /// Run one drain pass for `trigger`.
  ///
  /// Only one pass runs at a time; a trigger arriving mid-pass returns
  /// [`SyncOutcome::AlreadyDraining`] without touching the outbox.
  pub async fn on_sync(&self, trigger: &SyncTrigger) -> Result<SyncOutcome, DurableStoreError> {
    if !self.handles(&trigger.tag) {
      debug!(tag = %trigger.tag, "Ignoring sync tag");
      return Ok(SyncOutcome::Ignored);
    }

    if self
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!(tag = %trigger.tag, "Drain already running");
      return Ok(SyncOutcome::AlreadyDraining);
    }
    let _guard = DrainGuard(&self.draining);

    let report = self.drain(&trigger.tag).await?;
    info!(
      tag = %report.tag,
      outcome = ?report.outcome,
      delivered = report.delivered,
      remaining = report.remaining,
      "Sync pass finished"
    );

    self.clients.broadcast(ClientMessage::SyncCompleted {
      tag: report.tag.clone(),
      outcome: report.outcome,
      delivered: report.delivered,
      remaining: report.remaining,
    });

    Ok(SyncOutcome::Completed(report))
  }

  async fn drain(&self, tag: &str) -> Result<SyncReport, DurableStoreError> {
    self.outbox.recover_in_flight()?;

    let mut report = SyncReport {
      tag: tag.to_string(),
      outcome: PassOutcome::Success,
      delivered: 0,
      rejected: 0,
      dead_lettered: 0,
      failed: 0,
      remaining: 0,
    };

    for record in self.outbox.list_pending() {
      let record = match record {
        Ok(record) => record,
        Err(e) => {
          error!(error = %e, "Could not read next outbox record");
          report.failed += 1;
          break;
        }
      };

      match self.deliver(&record).await {
        Ok(Delivery::Delivered) => report.delivered += 1,
        Ok(Delivery::Rejected(OutboxStatus::FailedPermanent)) => {
          report.rejected += 1;
          report.dead_lettered += 1;
        }
        Ok(Delivery::Rejected(_)) => report.rejected += 1,
        Ok(Delivery::Unreachable { released }) => {
          if !released {
            report.failed += 1;
          }
          break;
        }
        Err(e) => {
          error!(id = record.id, error = %e, "Outbox bookkeeping failed");
          report.failed += 1;
        }
      }
    }

    report.remaining = self.outbox.counts()?.pending;
    if report.rejected > 0 || report.failed > 0 || report.remaining > 0 {
      report.outcome = PassOutcome::PartialFailure;
    }
    Ok(report)
  }

  async fn deliver(&self, record: &OutboxRecord) -> Result<Delivery, DurableStoreError> {
    self.outbox.mark_in_flight(record.id)?;

    let request = Request::post_json(self.orders_url.clone(), &record.payload)
      .with_header(IDEMPOTENCY_KEY, &record.idempotency_key);

    match self.network.fetch(&request).await {
      Ok(response) if response.is_success() => {
        self.outbox.delete(record.id)?;
        debug!(id = record.id, status = response.status, "Order delivered");
        Ok(Delivery::Delivered)
      }
      Ok(response) => {
        let status = self.outbox.record_rejection(
          record.id,
          response.status,
          &response.text(),
          self.max_attempts,
        )?;
        warn!(id = record.id, http_status = response.status, %status, "Order rejected");
        Ok(Delivery::Rejected(status))
      }
      Err(e) => {
        warn!(id = record.id, reason = %e.reason, "Network lost during sync, stopping pass");
        let released = match self.outbox.release(record.id, &e.reason) {
          Ok(()) => true,
          Err(store) => {
            error!(id = record.id, error = %store, "Could not release record after network loss");
            false
          }
        };
        Ok(Delivery::Unreachable { released })
      }
    }
  }
}
