//! SQLite-backed outbox.
//!
//! Each state transition is one statement or one transaction, so a process
//! killed between any two calls leaves every record PENDING, IN_FLIGHT or
//! gone. IN_FLIGHT leftovers are turned back into PENDING by
//! `recover_in_flight`, which runs on open and before every drain pass.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::record::{OutboxCounts, OutboxRecord, OutboxStatus};
use crate::db;
use crate::error::DurableStoreError;

const OUTBOX_SCHEMA: &str = r#"
PRAGMA synchronous = FULL;

-- AUTOINCREMENT keeps ids monotonic: a deleted id is never handed out again
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    idempotency_key TEXT NOT NULL UNIQUE,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'PENDING',
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, id);
"#;

const RECORD_COLUMNS: &str =
  "id, idempotency_key, payload, created_at, attempts, status, last_error";

/// Durable FIFO of order submissions awaiting delivery.
pub struct OutboxStore {
  conn: Mutex<Connection>,
}

impl OutboxStore {
  /// Open (or create) the outbox database at `path`.
  pub fn open(path: &Path) -> Result<Self, DurableStoreError> {
    let store = Self {
      conn: Mutex::new(db::open(path, OUTBOX_SCHEMA)?),
    };
    store.recover_in_flight()?;
    Ok(store)
  }

  pub fn open_in_memory() -> Result<Self, DurableStoreError> {
    Ok(Self {
      conn: Mutex::new(db::open_in_memory(OUTBOX_SCHEMA)?),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, DurableStoreError> {
    self.conn.lock().map_err(|_| DurableStoreError::LockPoisoned)
  }

  /// Append a PENDING record. Purely local; never touches the network.
  pub fn enqueue(&self, payload: &serde_json::Value) -> Result<i64, DurableStoreError> {
    self.enqueue_with_key(payload, &uuid::Uuid::new_v4().to_string())
  }

  /// Append a PENDING record under a key already sent to the server, so a
  /// replay of a submission that did reach it can be recognized.
  pub fn enqueue_with_key(
    &self,
    payload: &serde_json::Value,
    idempotency_key: &str,
  ) -> Result<i64, DurableStoreError> {
    let body = serde_json::to_string(payload)?;

    let conn = self.conn()?;
    conn.execute(
      "INSERT INTO outbox (idempotency_key, payload, status) VALUES (?, ?, 'PENDING')",
      params![idempotency_key, body],
    )?;
    let id = conn.last_insert_rowid();

    info!(id, %idempotency_key, "Order queued in outbox");
    Ok(id)
  }

  /// Lazy FIFO walk over PENDING records.
  pub fn list_pending(&self) -> PendingCursor<'_> {
    PendingCursor {
      store: self,
      last_id: 0,
      done: false,
    }
  }

  fn next_pending_after(&self, last_id: i64) -> Result<Option<OutboxRecord>, DurableStoreError> {
    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM outbox WHERE status = 'PENDING' AND id > ? ORDER BY id LIMIT 1",
      RECORD_COLUMNS
    );
    let raw = conn.query_row(&sql, params![last_id], RawRecord::from_row).optional()?;
    raw.map(RawRecord::into_record).transpose()
  }

  pub fn get(&self, id: i64) -> Result<Option<OutboxRecord>, DurableStoreError> {
    let conn = self.conn()?;
    let sql = format!("SELECT {} FROM outbox WHERE id = ?", RECORD_COLUMNS);
    let raw = conn.query_row(&sql, params![id], RawRecord::from_row).optional()?;
    raw.map(RawRecord::into_record).transpose()
  }

  /// PENDING → IN_FLIGHT. Must precede every submission.
  pub fn mark_in_flight(&self, id: i64) -> Result<(), DurableStoreError> {
    self.transition(id, OutboxStatus::Pending, OutboxStatus::InFlight, None)
  }

  /// IN_FLIGHT → PENDING after a transport failure; attempts are untouched.
  pub fn release(&self, id: i64, reason: &str) -> Result<(), DurableStoreError> {
    self.transition(id, OutboxStatus::InFlight, OutboxStatus::Pending, Some(reason))
  }

  /// Record a non-2xx answer for an IN_FLIGHT record.
  ///
  /// The record returns to PENDING, or becomes FAILED_PERMANENT once it has
  /// been rejected `max_attempts` times. Returns the new status.
  pub fn record_rejection(
    &self,
    id: i64,
    status: u16,
    reason: &str,
    max_attempts: u32,
  ) -> Result<OutboxStatus, DurableStoreError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let (attempts, current): (u32, String) = tx
      .query_row(
        "SELECT attempts, status FROM outbox WHERE id = ?",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?
      .ok_or(DurableStoreError::RecordNotFound(id))?;

    if current != OutboxStatus::InFlight.as_str() {
      return Err(DurableStoreError::InvalidTransition {
        id,
        status: current,
        expected: OutboxStatus::InFlight.as_str(),
      });
    }

    let attempts = attempts + 1;
    let next = if attempts >= max_attempts {
      OutboxStatus::FailedPermanent
    } else {
      OutboxStatus::Pending
    };

    tx.execute(
      "UPDATE outbox SET attempts = ?, status = ?, last_error = ? WHERE id = ?",
      params![attempts, next.as_str(), format!("HTTP {}: {}", status, reason), id],
    )?;
    tx.commit()?;

    if next == OutboxStatus::FailedPermanent {
      warn!(id, attempts, "Outbox record dead-lettered after repeated rejections");
    }
    Ok(next)
  }

  /// Remove a record. Only call after the server acknowledged it.
  pub fn delete(&self, id: i64) -> Result<bool, DurableStoreError> {
    let conn = self.conn()?;
    let removed = conn.execute("DELETE FROM outbox WHERE id = ?", params![id])?;
    debug!(id, removed, "Outbox record deleted");
    Ok(removed > 0)
  }

  /// Turn every IN_FLIGHT record back into PENDING.
  ///
  /// Such records were interrupted mid-submission; the server may already
  /// have accepted them, which its idempotency-key check absorbs.
  pub fn recover_in_flight(&self) -> Result<usize, DurableStoreError> {
    let conn = self.conn()?;
    let recovered = conn.execute(
      "UPDATE outbox SET status = 'PENDING' WHERE status = 'IN_FLIGHT'",
      [],
    )?;
    if recovered > 0 {
      warn!(recovered, "Recovered interrupted outbox submissions");
    }
    Ok(recovered)
  }

  /// Records that exhausted their attempts, oldest first.
  pub fn dead_letters(&self) -> Result<Vec<OutboxRecord>, DurableStoreError> {
    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM outbox WHERE status = 'FAILED_PERMANENT' ORDER BY id",
      RECORD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
      .query_map([], RawRecord::from_row)?
      .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawRecord::into_record).collect()
  }

  /// FAILED_PERMANENT → PENDING with a fresh attempt budget.
  pub fn requeue(&self, id: i64) -> Result<(), DurableStoreError> {
    let conn = self.conn()?;
    let updated = conn.execute(
      "UPDATE outbox SET status = 'PENDING', attempts = 0 WHERE id = ? AND status = 'FAILED_PERMANENT'",
      params![id],
    )?;
    drop(conn);
    if updated == 0 {
      return Err(self.transition_error(id, OutboxStatus::FailedPermanent));
    }
    info!(id, "Dead-lettered order requeued");
    Ok(())
  }

  pub fn counts(&self) -> Result<OutboxCounts, DurableStoreError> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM outbox GROUP BY status")?;
    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
      .collect::<Result<Vec<_>, _>>()?;

    let mut counts = OutboxCounts::default();
    for (status, n) in rows {
      let n = n as usize;
      match status.parse::<OutboxStatus>()? {
        OutboxStatus::Pending => counts.pending = n,
        OutboxStatus::InFlight => counts.in_flight = n,
        OutboxStatus::FailedPermanent => counts.failed_permanent = n,
      }
    }
    Ok(counts)
  }

  fn transition(
    &self,
    id: i64,
    from: OutboxStatus,
    to: OutboxStatus,
    last_error: Option<&str>,
  ) -> Result<(), DurableStoreError> {
    let conn = self.conn()?;
    let updated = conn.execute(
      "UPDATE outbox SET status = ?, last_error = COALESCE(?, last_error) WHERE id = ? AND status = ?",
      params![to.as_str(), last_error, id, from.as_str()],
    )?;
    drop(conn);

    if updated == 0 {
      return Err(self.transition_error(id, from));
    }
    Ok(())
  }

  fn transition_error(&self, id: i64, expected: OutboxStatus) -> DurableStoreError {
    match self.get(id) {
      Ok(Some(record)) => DurableStoreError::InvalidTransition {
        id,
        status: record.status.to_string(),
        expected: expected.as_str(),
      },
      Ok(None) => DurableStoreError::RecordNotFound(id),
      Err(e) => e,
    }
  }
}

/// Restartable FIFO cursor over PENDING records.
///
/// Each step reads the next PENDING record after the last one yielded, so
/// deletions and new enqueues between steps are seen consistently.
pub struct PendingCursor<'a> {
  store: &'a OutboxStore,
  last_id: i64,
  done: bool,
}

impl PendingCursor<'_> {
  /// Start over from the oldest PENDING record.
  pub fn restart(&mut self) {
    self.last_id = 0;
    self.done = false;
  }
}

impl Iterator for PendingCursor<'_> {
  type Item = Result<OutboxRecord, DurableStoreError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }
    match self.store.next_pending_after(self.last_id) {
      Ok(Some(record)) => {
        self.last_id = record.id;
        Some(Ok(record))
      }
      Ok(None) => {
        self.done = true;
        None
      }
      Err(e) => {
        self.done = true;
        Some(Err(e))
      }
    }
  }
}

/// Row as stored, before JSON and status parsing.
struct RawRecord {
  id: i64,
  idempotency_key: String,
  payload: String,
  created_at: String,
  attempts: u32,
  status: String,
  last_error: Option<String>,
}

impl RawRecord {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      idempotency_key: row.get(1)?,
      payload: row.get(2)?,
      created_at: row.get(3)?,
      attempts: row.get(4)?,
      status: row.get(5)?,
      last_error: row.get(6)?,
    })
  }

  fn into_record(self) -> Result<OutboxRecord, DurableStoreError> {
    Ok(OutboxRecord {
      id: self.id,
      idempotency_key: self.idempotency_key,
      payload: serde_json::from_str(&self.payload)?,
      created_at: db::parse_datetime(&self.created_at)?,
      attempts: self.attempts,
      status: self.status.parse()?,
      last_error: self.last_error,
    })
  }
}
