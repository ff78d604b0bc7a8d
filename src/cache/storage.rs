//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::db;
use crate::error::DurableStoreError;
use crate::http::{RequestKey, Response, ResponseSource};

/// A response read back from a namespace.
#[derive(Debug, Clone)]
pub struct StoredResponse {
  pub response: Response,
  /// When the entry was written
  pub stored_at: DateTime<Utc>,
}

/// One cache generation as listed by `namespaces()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
  pub name: String,
  pub active: bool,
  /// Provisioning finished and the namespace may be activated
  pub installed: bool,
  pub entries: usize,
}

/// Trait for cache storage backends.
///
/// Every method is a single durable step; nothing is cached in memory.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if it does not exist yet.
  fn open_namespace(&self, name: &str) -> Result<(), DurableStoreError>;

  /// All namespaces, oldest first.
  fn namespaces(&self) -> Result<Vec<NamespaceInfo>, DurableStoreError>;

  /// Drop a namespace and its entries. Returns whether it existed.
  fn delete_namespace(&self, name: &str) -> Result<bool, DurableStoreError>;

  /// Record that provisioning of `name` finished. False if it is gone.
  fn mark_installed(&self, name: &str) -> Result<bool, DurableStoreError>;

  /// Make `name` the only active namespace.
  ///
  /// Returns false, changing nothing, unless `name` exists and is installed.
  fn set_active(&self, name: &str) -> Result<bool, DurableStoreError>;

  fn active_namespace(&self) -> Result<Option<String>, DurableStoreError>;

  fn get(
    &self,
    namespace: &str,
    key: &RequestKey,
  ) -> Result<Option<StoredResponse>, DurableStoreError>;

  /// Insert or overwrite an entry (last write wins). Fails if the
  /// namespace does not exist.
  fn put(
    &self,
    namespace: &str,
    key: &RequestKey,
    response: &Response,
  ) -> Result<(), DurableStoreError>;

  /// Write into whichever namespace is active, in one step with the lookup.
  /// Returns the namespace written, or `None` when nothing is active.
  fn put_active(
    &self,
    key: &RequestKey,
    response: &Response,
  ) -> Result<Option<String>, DurableStoreError>;

  /// Look a key up in every namespace, active one first.
  fn find_any(&self, key: &RequestKey) -> Result<Option<StoredResponse>, DurableStoreError>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self, DurableStoreError> {
    Ok(Self {
      conn: Mutex::new(db::open(path, CACHE_SCHEMA)?),
    })
  }

  /// A throwaway in-memory cache.
  pub fn open_in_memory() -> Result<Self, DurableStoreError> {
    Ok(Self {
      conn: Mutex::new(db::open_in_memory(CACHE_SCHEMA)?),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, DurableStoreError> {
    self.conn.lock().map_err(|_| DurableStoreError::LockPoisoned)
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    active INTEGER NOT NULL DEFAULT 0,
    installed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    seq INTEGER NOT NULL DEFAULT 0
);

-- Responses keyed by the SHA-256 of method + normalized URL (+ vary headers)
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    key_digest TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key_digest),
    FOREIGN KEY (namespace) REFERENCES cache_namespaces(name) ON DELETE CASCADE
);
"#;

fn ensure_namespace(conn: &Connection, name: &str) -> Result<(), DurableStoreError> {
  conn.execute(
    "INSERT OR IGNORE INTO cache_namespaces (name, seq)
     VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_namespaces))",
    params![name],
  )?;
  Ok(())
}

fn row_to_stored(
  url: String,
  status: u16,
  headers: String,
  body: Vec<u8>,
  stored_at: String,
) -> Result<StoredResponse, DurableStoreError> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)?;
  Ok(StoredResponse {
    response: Response {
      url,
      status,
      headers,
      body,
      source: ResponseSource::Cache,
    },
    stored_at: db::parse_datetime(&stored_at)?,
  })
}

type EntryRow = (String, u16, String, Vec<u8>, String);

impl CacheStorage for SqliteStorage {
  fn open_namespace(&self, name: &str) -> Result<(), DurableStoreError> {
    let conn = self.conn()?;
    ensure_namespace(&conn, name)
  }

  fn namespaces(&self) -> Result<Vec<NamespaceInfo>, DurableStoreError> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT n.name, n.active, n.installed,
              (SELECT COUNT(*) FROM cache_entries e WHERE e.namespace = n.name)
       FROM cache_namespaces n
       ORDER BY n.seq",
    )?;

    let rows = stmt.query_map([], |row| {
      Ok(NamespaceInfo {
        name: row.get(0)?,
        active: row.get::<_, i64>(1)? != 0,
        installed: row.get::<_, i64>(2)? != 0,
        entries: row.get::<_, i64>(3)? as usize,
      })
    })?;

    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
  }

  fn delete_namespace(&self, name: &str) -> Result<bool, DurableStoreError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM cache_entries WHERE namespace = ?", params![name])?;
    let removed = tx.execute("DELETE FROM cache_namespaces WHERE name = ?", params![name])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn mark_installed(&self, name: &str) -> Result<bool, DurableStoreError> {
    let conn = self.conn()?;
    let updated = conn.execute(
      "UPDATE cache_namespaces SET installed = 1 WHERE name = ?",
      params![name],
    )?;
    Ok(updated > 0)
  }

  fn set_active(&self, name: &str) -> Result<bool, DurableStoreError> {
    let conn = self.conn()?;
    let updated = conn.execute(
      "UPDATE cache_namespaces SET active = (name = ?1)
       WHERE EXISTS (SELECT 1 FROM cache_namespaces WHERE name = ?1 AND installed = 1)",
      params![name],
    )?;
    Ok(updated > 0)
  }

  fn active_namespace(&self) -> Result<Option<String>, DurableStoreError> {
    let conn = self.conn()?;
    let name = conn
      .query_row(
        "SELECT name FROM cache_namespaces WHERE active = 1 LIMIT 1",
        [],
        |row| row.get(0),
      )
      .optional()?;
    Ok(name)
  }

  fn get(
    &self,
    namespace: &str,
    key: &RequestKey,
  ) -> Result<Option<StoredResponse>, DurableStoreError> {
    let conn = self.conn()?;
    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT url, status, headers, body, stored_at FROM cache_entries
         WHERE namespace = ? AND key_digest = ?",
        params![namespace, key.digest()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()?;

    row
      .map(|(url, status, headers, body, stored_at)| {
        row_to_stored(url, status, headers, body, stored_at)
      })
      .transpose()
  }

  fn put(
    &self,
    namespace: &str,
    key: &RequestKey,
    response: &Response,
  ) -> Result<(), DurableStoreError> {
    let headers = serde_json::to_string(&response.headers)?;
    let conn = self.conn()?;
    let written = conn.execute(
      "INSERT OR REPLACE INTO cache_entries (namespace, key_digest, url, status, headers, body, stored_at)
       SELECT name, ?, ?, ?, ?, ?, datetime('now') FROM cache_namespaces WHERE name = ?",
      params![
        key.digest(),
        key.url(),
        response.status,
        headers,
        response.body,
        namespace
      ],
    )?;
    if written == 0 {
      return Err(DurableStoreError::NamespaceMissing(namespace.to_string()));
    }
    Ok(())
  }

  fn put_active(
    &self,
    key: &RequestKey,
    response: &Response,
  ) -> Result<Option<String>, DurableStoreError> {
    let headers = serde_json::to_string(&response.headers)?;
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let active: Option<String> = tx
      .query_row(
        "SELECT name FROM cache_namespaces WHERE active = 1 LIMIT 1",
        [],
        |row| row.get(0),
      )
      .optional()?;
    let Some(namespace) = active else {
      return Ok(None);
    };

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (namespace, key_digest, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        namespace,
        key.digest(),
        key.url(),
        response.status,
        headers,
        response.body
      ],
    )?;
    tx.commit()?;
    Ok(Some(namespace))
  }

  fn find_any(&self, key: &RequestKey) -> Result<Option<StoredResponse>, DurableStoreError> {
    let conn = self.conn()?;
    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT e.url, e.status, e.headers, e.body, e.stored_at
         FROM cache_entries e
         INNER JOIN cache_namespaces n ON n.name = e.namespace
         WHERE e.key_digest = ?
         ORDER BY n.active DESC, n.seq DESC
         LIMIT 1",
        params![key.digest()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()?;

    row
      .map(|(url, status, headers, body, stored_at)| {
        row_to_stored(url, status, headers, body, stored_at)
      })
      .transpose()
  }
}
