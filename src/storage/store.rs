//! Persistent key/value store contract and backends.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Errors surfaced by a persistent store.
#[derive(Debug, Error)]
pub enum StorageError {
  /// The store refused the write because it is out of capacity.
  #[error("storage quota exceeded")]
  QuotaExceeded,
  /// Any other backend failure.
  #[error("storage backend error: {0}")]
  Backend(String),
}

/// Synchronous key/value persistence contract.
///
/// Modeled on the localStorage surface: string keys, string values, and a
/// finite capacity that can refuse a write with
/// [`StorageError::QuotaExceeded`].
pub trait KeyValueStore: Send + Sync {
  fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
  fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
  fn remove_item(&self, key: &str) -> Result<(), StorageError>;

  /// All keys currently present, in no particular order.
  fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// In-memory store with an optional byte budget.
///
/// Usable as a real backend when durability across restarts is not needed,
/// and in tests to simulate quota exhaustion.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, String>>,
  max_bytes: Option<usize>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Cap the total size of stored keys and values.
  pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
    self.max_bytes = Some(max_bytes);
    self
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
    self
      .entries
      .lock()
      .map_err(|e| StorageError::Backend(format!("lock poisoned: {}", e)))
  }
}

impl KeyValueStore for MemoryStore {
  fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let mut entries = self.lock()?;

    if let Some(max) = self.max_bytes {
      let used: usize = entries
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| k.len() + v.len())
        .sum();
      if used + key.len() + value.len() > max {
        return Err(StorageError::QuotaExceeded);
      }
    }

    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<(), StorageError> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, StorageError> {
    Ok(self.lock()?.keys().cloned().collect())
  }
}

/// Schema for the key/value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-backed store.
///
/// One row per key. An optional byte budget turns oversized writes into
/// [`StorageError::QuotaExceeded`], the same signal a full disk produces.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  max_bytes: Option<u64>,
}

impl SqliteStore {
  /// Open or create the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open storage at {}: {}", path.display(), e))?;

    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      max_bytes: None,
    })
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("syncline").join("state.db"))
  }

  /// Cap the total size of stored keys and values.
  pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
    self.max_bytes = Some(max_bytes);
    self
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Backend(format!("lock poisoned: {}", e)))
  }
}

fn map_sqlite_err(e: rusqlite::Error) -> StorageError {
  if let rusqlite::Error::SqliteFailure(inner, _) = &e {
    if inner.code == rusqlite::ErrorCode::DiskFull {
      return StorageError::QuotaExceeded;
    }
  }
  StorageError::Backend(e.to_string())
}

impl KeyValueStore for SqliteStore {
  fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT value FROM kv WHERE key = ?")
      .map_err(map_sqlite_err)?;

    let value: Option<String> = stmt.query_row(params![key], |row| row.get(0)).ok();
    Ok(value)
  }

  fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;

    if let Some(max) = self.max_bytes {
      let used: u64 = conn
        .query_row(
          "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
           FROM kv WHERE key != ?",
          params![key],
          |row| row.get(0),
        )
        .map_err(map_sqlite_err)?;
      if used + (key.len() + value.len()) as u64 > max {
        return Err(StorageError::QuotaExceeded);
      }
    }

    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(map_sqlite_err)?;

    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM kv WHERE key = ?", params![key])
      .map_err(map_sqlite_err)?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key FROM kv")
      .map_err(map_sqlite_err)?;

    let keys: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(map_sqlite_err)?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_memory_store_roundtrip() {
    let store = MemoryStore::new();

    store.set_item("a", "1").unwrap();
    assert_eq!(store.get_item("a").unwrap(), Some("1".to_string()));

    store.remove_item("a").unwrap();
    assert_eq!(store.get_item("a").unwrap(), None);
  }

  #[test]
  fn test_memory_store_quota() {
    let store = MemoryStore::new().with_max_bytes(10);

    store.set_item("a", "12345").unwrap();
    let err = store.set_item("b", "123456789").unwrap_err();
    assert!(matches!(err, StorageError::QuotaExceeded));

    // Replacing an existing key only counts the new value
    store.set_item("a", "123456789").unwrap();
  }

  #[test]
  fn test_memory_store_keys() {
    let store = MemoryStore::new();
    store.set_item("a", "1").unwrap();
    store.set_item("b", "2").unwrap();

    let mut keys = store.keys().unwrap();
    keys.sort();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn test_sqlite_store_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open_at(&dir.path().join("state.db")).unwrap();

    store.set_item("a", "1").unwrap();
    store.set_item("a", "2").unwrap();
    assert_eq!(store.get_item("a").unwrap(), Some("2".to_string()));

    store.remove_item("a").unwrap();
    assert_eq!(store.get_item("a").unwrap(), None);
  }

  #[test]
  fn test_sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    {
      let store = SqliteStore::open_at(&path).unwrap();
      store.set_item("a", "1").unwrap();
    }

    let store = SqliteStore::open_at(&path).unwrap();
    assert_eq!(store.get_item("a").unwrap(), Some("1".to_string()));
  }

  #[test]
  fn test_sqlite_store_quota() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open_at(&dir.path().join("state.db"))
      .unwrap()
      .with_max_bytes(16);

    store.set_item("a", "1234").unwrap();
    let err = store.set_item("b", "0123456789abcdef").unwrap_err();
    assert!(matches!(err, StorageError::QuotaExceeded));
  }
}
