//! SQLite plumbing shared by the cache and the outbox databases.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;

use crate::error::DurableStoreError;

/// Open or create the database at `path` and apply `schema`.
pub fn open(path: &Path, schema: &str) -> Result<Connection, DurableStoreError> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).map_err(|e| DurableStoreError::Open {
      path: parent.display().to_string(),
      reason: e.to_string(),
    })?;
  }

  let conn = Connection::open(path).map_err(|e| DurableStoreError::Open {
    path: path.display().to_string(),
    reason: e.to_string(),
  })?;

  run_migrations(&conn, schema)?;
  Ok(conn)
}

/// An in-memory database with `schema` applied.
pub fn open_in_memory(schema: &str) -> Result<Connection, DurableStoreError> {
  let conn = Connection::open_in_memory()?;
  run_migrations(&conn, schema)?;
  Ok(conn)
}

fn run_migrations(conn: &Connection, schema: &str) -> Result<(), DurableStoreError> {
  conn.execute_batch(schema)?;
  Ok(())
}

/// Parse a datetime string from SQLite format.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DurableStoreError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| DurableStoreError::Corrupt(format!("datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_sqlite_datetime() {
    let dt = parse_datetime("2026-10-18 09:30:00").unwrap();
    assert_eq!(dt.to_rfc3339(), "2026-10-18T09:30:00+00:00");
    assert!(parse_datetime("yesterday").is_err());
  }

  #[test]
  fn test_open_creates_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("data.db");
    open(&path, "CREATE TABLE IF NOT EXISTS t (x INTEGER);").unwrap();
    assert!(path.exists());
  }
}
