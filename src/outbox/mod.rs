//! Durable outbox for order submissions made while offline.
//!
//! Records are appended locally, replayed in FIFO order by the sync
//! orchestrator and deleted only after the server acknowledges them.

mod record;
mod store;

pub use record::{OutboxCounts, OutboxRecord, OutboxStatus};
pub use store::{OutboxStore, PendingCursor};
