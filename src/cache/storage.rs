//! Cache storage trait with SQLite and in-memory implementations.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::net::Response;

use super::traits::{RequestKey, StoredResponse};

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores, each mapping a `RequestKey`
/// to one `StoredResponse`. Every call is atomic on its own; there are no
/// cross-call transactions.
pub trait CacheStorage: Send + Sync {
  /// Create the named store if it does not exist yet.
  fn open_store(&self, name: &str) -> Result<()>;

  /// Whether the named store exists.
  fn has_store(&self, name: &str) -> Result<bool>;

  /// Names of every existing store, sorted.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Mark a store as completely populated, creating it if needed. The mark
  /// goes away with the store.
  fn seal_store(&self, name: &str) -> Result<()>;

  /// Whether the store exists and has been sealed.
  fn is_sealed(&self, name: &str) -> Result<bool>;

  /// Delete a store and all of its entries. Returns false if it did not exist.
  fn delete_store(&self, name: &str) -> Result<bool>;

  /// Store a response, creating the store if needed. A later put for the
  /// same key overwrites.
  fn put(&self, store: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Look up a single entry.
  fn lookup(&self, store: &str, key: &RequestKey) -> Result<Option<StoredResponse>>;

  /// Keys of every entry in the store.
  fn keys(&self, store: &str) -> Result<Vec<RequestKey>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offgrid").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named stores, one row per generation-tagged container
CREATE TABLE IF NOT EXISTS stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    -- Set once pre-population finished; NULL while still filling
    sealed_at TEXT
);

-- Stored responses, keyed by the digest of method + url
CREATE TABLE IF NOT EXISTS entries (
    store_name TEXT NOT NULL,
    key_digest TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, key_digest),
    FOREIGN KEY (store_name) REFERENCES stores(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_store ON entries(store_name);
"#;

impl CacheStorage for SqliteStorage {
  fn open_store(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO stores (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open store {}: {}", name, e))?;
    Ok(())
  }

  fn has_store(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query store {}: {}", name, e))?;
    Ok(found.is_some())
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn seal_store(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO stores (name, sealed_at) VALUES (?, datetime('now'))
         ON CONFLICT(name) DO UPDATE SET sealed_at = excluded.sealed_at",
        params![name],
      )
      .map_err(|e| eyre!("Failed to seal store {}: {}", name, e))?;
    Ok(())
  }

  fn is_sealed(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM stores WHERE name = ? AND sealed_at IS NOT NULL",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query store {}: {}", name, e))?;
    Ok(found.is_some())
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    // Entries go with their store through the foreign key cascade
    let deleted = conn
      .execute("DELETE FROM stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store {}: {}", name, e))?;
    Ok(deleted > 0)
  }

  fn put(&self, store: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.lock()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let result = conn
      .execute(
        "INSERT OR IGNORE INTO stores (name) VALUES (?)",
        params![store],
      )
      .and_then(|_| {
        conn.execute(
          "INSERT OR REPLACE INTO entries
             (store_name, key_digest, method, url, status, status_text, headers, body, cached_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
          params![
            store,
            key.digest(),
            key.method,
            key.url,
            response.status,
            response.status_text,
            headers,
            response.body.as_ref(),
          ],
        )
      });

    match result {
      Ok(_) => {
        conn
          .execute("COMMIT", [])
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(())
      }
      Err(e) => {
        let _ = conn.execute("ROLLBACK", []);
        Err(eyre!("Failed to store {} in {}: {}", key, store, e))
      }
    }
  }

  fn lookup(&self, store: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, status_text, headers, body, cached_at FROM entries
         WHERE store_name = ? AND key_digest = ?",
        params![store, key.digest()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", key, store, e))?;

    match row {
      Some((status, status_text, headers, body, cached_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(StoredResponse {
          response: Response {
            status,
            status_text,
            headers,
            body: Bytes::from(body),
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn keys(&self, store: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE store_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![store], |row| {
        Ok(RequestKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list keys of {}: {}", store, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[derive(Default)]
struct MemoryStore {
  entries: HashMap<String, (RequestKey, StoredResponse)>,
  sealed: bool,
}

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
  stores: Mutex<BTreeMap<String, MemoryStore>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, MemoryStore>>> {
    self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open_store(&self, name: &str) -> Result<()> {
    self.lock()?.entry(name.to_string()).or_default();
    Ok(())
  }

  fn has_store(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.contains_key(name))
  }

  fn store_names(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn seal_store(&self, name: &str) -> Result<()> {
    self.lock()?.entry(name.to_string()).or_default().sealed = true;
    Ok(())
  }

  fn is_sealed(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.get(name).is_some_and(|store| store.sealed))
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.remove(name).is_some())
  }

  fn put(&self, store: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let stored = StoredResponse {
      response: response.clone(),
      cached_at: Utc::now(),
    };
    self
      .lock()?
      .entry(store.to_string())
      .or_default()
      .entries
      .insert(key.digest(), (key.clone(), stored));
    Ok(())
  }

  fn lookup(&self, store: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    Ok(
      self
        .lock()?
        .get(store)
        .and_then(|store| store.entries.get(&key.digest()))
        .map(|(_, stored)| stored.clone()),
    )
  }

  fn keys(&self, store: &str) -> Result<Vec<RequestKey>> {
    let mut keys: Vec<RequestKey> = self
      .lock()?
      .get(store)
      .map(|store| store.entries.values().map(|(key, _)| key.clone()).collect())
      .unwrap_or_default();
    keys.sort_by(|a, b| a.url.cmp(&b.url));
    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn key(url: &str) -> RequestKey {
    RequestKey::new("GET", &Url::parse(url).unwrap())
  }

  fn backends() -> Vec<Box<dyn CacheStorage>> {
    vec![
      Box::new(SqliteStorage::open_in_memory().unwrap()),
      Box::new(MemoryStorage::new()),
    ]
  }

  #[test]
  fn test_put_then_lookup_returns_same_response() {
    for storage in backends() {
      let response = Response::new(200, "console.log(1)")
        .with_header("Content-Type", "application/javascript")
        .with_header("ETag", "\"abc\"");
      let k = key("https://app.example.com/app.js");

      storage.put("app-v1-static", &k, &response).unwrap();
      let stored = storage.lookup("app-v1-static", &k).unwrap().unwrap();

      assert_eq!(stored.response, response);
    }
  }

  #[test]
  fn test_later_put_overwrites() {
    for storage in backends() {
      let k = key("https://app.example.com/data");
      storage.put("s", &k, &Response::new(200, "one")).unwrap();
      storage.put("s", &k, &Response::new(200, "two")).unwrap();

      assert_eq!(storage.keys("s").unwrap().len(), 1);
      let stored = storage.lookup("s", &k).unwrap().unwrap();
      assert_eq!(stored.response.body, Bytes::from("two"));
    }
  }

  #[test]
  fn test_lookup_is_scoped_to_store() {
    for storage in backends() {
      let k = key("https://app.example.com/a.css");
      storage.put("one", &k, &Response::new(200, "a")).unwrap();
      storage.open_store("two").unwrap();

      assert!(storage.lookup("two", &k).unwrap().is_none());
      assert!(storage.lookup("missing", &k).unwrap().is_none());
    }
  }

  #[test]
  fn test_open_is_idempotent_and_delete_drops_entries() {
    for storage in backends() {
      storage.open_store("s").unwrap();
      storage.open_store("s").unwrap();
      assert_eq!(storage.store_names().unwrap(), vec!["s".to_string()]);

      let k = key("https://app.example.com/");
      storage.put("s", &k, &Response::new(200, "<html>")).unwrap();

      assert!(storage.delete_store("s").unwrap());
      assert!(!storage.delete_store("s").unwrap());
      assert!(!storage.has_store("s").unwrap());
      assert!(storage.lookup("s", &k).unwrap().is_none());
      assert!(storage.keys("s").unwrap().is_empty());
    }
  }

  #[test]
  fn test_seal_marks_store_until_deleted() {
    for storage in backends() {
      let k = key("https://app.example.com/");
      storage.put("s", &k, &Response::new(200, "<html>")).unwrap();
      assert!(!storage.is_sealed("s").unwrap());

      storage.seal_store("s").unwrap();
      storage.seal_store("s").unwrap();
      assert!(storage.is_sealed("s").unwrap());
      // Sealing keeps the entries
      assert!(storage.lookup("s", &k).unwrap().is_some());

      storage.delete_store("s").unwrap();
      storage.put("s", &k, &Response::new(200, "<html>")).unwrap();
      assert!(!storage.is_sealed("s").unwrap());
      assert!(!storage.is_sealed("missing").unwrap());
    }
  }

  #[test]
  fn test_sqlite_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let k = key("https://fonts.gstatic.com/font.woff2");

    {
      let storage = SqliteStorage::open(Some(&path)).unwrap();
      storage.put("app-v1-cdn", &k, &Response::new(200, vec![0u8, 1, 2])).unwrap();
    }

    let storage = SqliteStorage::open(Some(&path)).unwrap();
    assert!(storage.has_store("app-v1-cdn").unwrap());
    storage.seal_store("app-v1-cdn").unwrap();
    drop(storage);

    let storage = SqliteStorage::open(Some(&path)).unwrap();
    assert!(storage.is_sealed("app-v1-cdn").unwrap());
    let stored = storage.lookup("app-v1-cdn", &k).unwrap().unwrap();
    assert_eq!(stored.response.body.as_ref(), &[0u8, 1, 2]);
  }
}
