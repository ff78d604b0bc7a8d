//! Error taxonomy for the offline layer.
//!
//! Library seams return these typed errors so callers can tell a dead network
//! apart from a server that answered "no" and from a broken local database.
//! The binary wraps them in `color_eyre` reports.

use thiserror::Error;

/// No response was received from the network.
#[derive(Debug, Clone, Error)]
#[error("network unreachable for {url}: {reason}")]
pub struct TransportError {
  pub url: String,
  pub reason: String,
}

impl TransportError {
  pub fn new(url: impl Into<String>, reason: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      reason: reason.into(),
    }
  }
}

/// The server was reached but answered with a non-2xx status.
#[derive(Debug, Clone, Error)]
#[error("server rejected request with status {status}: {body}")]
pub struct ServerRejection {
  pub status: u16,
  pub body: String,
}

/// Local persistence failed.
#[derive(Debug, Error)]
pub enum DurableStoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to (de)serialize stored data: {0}")]
  Serde(#[from] serde_json::Error),

  #[error("store lock poisoned")]
  LockPoisoned,

  #[error("failed to open store at {path}: {reason}")]
  Open { path: String, reason: String },

  #[error("outbox record {0} not found")]
  RecordNotFound(i64),

  #[error("outbox record {id} is {status}, expected {expected}")]
  InvalidTransition {
    id: i64,
    status: String,
    expected: &'static str,
  },

  #[error("invalid stored value: {0}")]
  Corrupt(String),

  #[error("cache namespace '{0}' does not exist")]
  NamespaceMissing(String),
}

/// A cache version could not be made active.
#[derive(Debug, Error)]
pub enum ActivationError {
  #[error("cache version '{0}' was never fully installed")]
  NotInstalled(String),

  #[error(transparent)]
  Store(#[from] DurableStoreError),
}

/// An asset failed while provisioning a cache version.
#[derive(Debug, Error)]
pub enum ProvisionError {
  #[error("failed to cache {url} during install: {reason}")]
  AssetFailed { url: String, reason: String },

  #[error(transparent)]
  Store(#[from] DurableStoreError),
}
