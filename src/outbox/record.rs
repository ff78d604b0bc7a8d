use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::DurableStoreError;

/// Delivery state of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
  /// Waiting for the next drain pass
  Pending,
  /// Submission started; the server may or may not have seen it
  InFlight,
  /// Rejected too many times; kept for inspection, never resubmitted
  FailedPermanent,
}

impl OutboxStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "PENDING",
      Self::InFlight => "IN_FLIGHT",
      Self::FailedPermanent => "FAILED_PERMANENT",
    }
  }
}

impl fmt::Display for OutboxStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for OutboxStatus {
  type Err = DurableStoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "PENDING" => Ok(Self::Pending),
      "IN_FLIGHT" => Ok(Self::InFlight),
      "FAILED_PERMANENT" => Ok(Self::FailedPermanent),
      other => Err(DurableStoreError::Corrupt(format!("outbox status '{}'", other))),
    }
  }
}

/// A queued order submission.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxRecord {
  /// Monotonic, never reused
  pub id: i64,
  /// Sent as `Idempotency-Key` so the server can drop replays
  pub idempotency_key: String,
  /// Order body, opaque to the engine
  pub payload: serde_json::Value,
  pub created_at: DateTime<Utc>,
  /// Submissions the server answered (rejections included)
  pub attempts: u32,
  pub status: OutboxStatus,
  pub last_error: Option<String>,
}

/// Record totals per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
  pub pending: usize,
  pub in_flight: usize,
  pub failed_permanent: usize,
}
