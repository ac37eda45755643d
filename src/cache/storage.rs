//! Cache storage trait and SQLite implementation.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::traits::{Cacheable, Partition};
use crate::error::{StoreError, StoreResult};

/// Current on-disk schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Upgrading from this version drops all cached data, since its records were
/// keyed inconsistently.
pub const LEGACY_SCHEMA_VERSION: i32 = 1;

/// Trait for cache storage backends.
///
/// Every call runs in its own transaction. There is no atomicity across
/// partitions.
#[async_trait]
pub trait CacheStorage: Send + Sync {
  /// Get a single value by key.
  async fn get<T: Cacheable>(&self, key: &str) -> StoreResult<Option<T>>;

  /// Get every value of the partition, in insertion order.
  async fn get_all<T: Cacheable>(&self) -> StoreResult<Vec<T>>;

  /// Number of values in the partition.
  async fn count<T: Cacheable>(&self) -> StoreResult<usize>;

  /// Upsert values by key. New keys are appended after existing ones.
  async fn put<T: Cacheable>(&self, values: &[T]) -> StoreResult<()>;

  /// Clear the partition and store `values` in its place.
  async fn replace<T: Cacheable>(&self, values: &[T]) -> StoreResult<()>;

  /// Remove every value of the partition.
  async fn clear<T: Cacheable>(&self) -> StoreResult<()>;

  /// Release the underlying handle. Later calls fail with `NotInitialized`.
  fn close(&self);
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> StoreResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    info!(path = %path.display(), "opened cache database");
    Self::from_connection(conn)
  }

  /// Open a throwaway database that lives only as long as this handle.
  pub fn open_in_memory() -> StoreResult<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> StoreResult<Self> {
    upgrade(&conn, SCHEMA_VERSION)?;
    Ok(Self {
      conn: Arc::new(Mutex::new(Some(conn))),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("receipt-sync").join("cache.db"))
  }

  /// Run `f` against the open connection on the blocking pool.
  async fn with_conn<F, R>(&self, f: F) -> StoreResult<R>
  where
    F: FnOnce(&mut Connection) -> StoreResult<R> + Send + 'static,
    R: Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let mut guard = conn
        .lock()
        .map_err(|e| StoreError::Task(format!("lock poisoned: {}", e)))?;
      let conn = guard.as_mut().ok_or(StoreError::NotInitialized)?;
      f(conn)
    })
    .await
    .map_err(|e| StoreError::Task(e.to_string()))?
  }
}

#[cfg(test)]
impl SqliteStorage {
  /// Run raw SQL against the open connection, bypassing encoding.
  pub(crate) async fn execute_raw(&self, sql: &'static str) -> StoreResult<()> {
    self
      .with_conn(move |conn| {
        conn.execute_batch(sql)?;
        Ok(())
      })
      .await
  }
}

/// Create missing partitions and migrate from older schema versions.
///
/// Idempotent: running it against an up-to-date database changes nothing.
pub fn upgrade(conn: &Connection, target: i32) -> StoreResult<()> {
  let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

  for partition in Partition::ALL {
    conn.execute_batch(&format!(
      "CREATE TABLE IF NOT EXISTS {table} (
           key TEXT PRIMARY KEY,
           data BLOB NOT NULL,
           position INTEGER NOT NULL,
           cached_at TEXT NOT NULL DEFAULT (datetime('now'))
       );
       CREATE INDEX IF NOT EXISTS idx_{table}_position ON {table}(position);",
      table = partition.table()
    ))?;
  }

  if current == LEGACY_SCHEMA_VERSION {
    info!(from = current, to = target, "clearing cache left by legacy schema");
    for partition in Partition::ALL {
      conn.execute(&format!("DELETE FROM {}", partition.table()), [])?;
    }
  }

  if current != target {
    debug!(from = current, to = target, "cache schema upgraded");
    conn.pragma_update(None, "user_version", target)?;
  }

  Ok(())
}

fn encode_all<T: Cacheable>(values: &[T]) -> StoreResult<Vec<(String, Vec<u8>)>> {
  values
    .iter()
    .map(|v| Ok((v.cache_key(), serde_json::to_vec(v)?)))
    .collect()
}

fn decode_all<T: Cacheable>(rows: Vec<(String, Vec<u8>)>) -> Vec<T> {
  rows
    .into_iter()
    .filter_map(|(key, data)| match serde_json::from_slice(&data) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(partition = T::partition().table(), %key, "skipping undecodable cache row: {}", e);
        None
      }
    })
    .collect()
}

fn insert_rows(conn: &Connection, table: &str, rows: &[(String, Vec<u8>)]) -> StoreResult<()> {
  let mut stmt = conn.prepare(&format!(
    "INSERT INTO {t} (key, data, position)
     VALUES (?1, ?2, (SELECT COALESCE(MAX(position), -1) + 1 FROM {t}))
     ON CONFLICT(key) DO UPDATE SET data = excluded.data, cached_at = datetime('now')",
    t = table
  ))?;
  for (key, data) in rows {
    stmt.execute(params![key, data])?;
  }
  Ok(())
}

#[async_trait]
impl CacheStorage for SqliteStorage {
  async fn get<T: Cacheable>(&self, key: &str) -> StoreResult<Option<T>> {
    let table = T::partition().table();
    let key = key.to_string();

    let data: Option<Vec<u8>> = self
      .with_conn(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT data FROM {} WHERE key = ?", table),
              params![key],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;

    match data {
      Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
      None => Ok(None),
    }
  }

  async fn get_all<T: Cacheable>(&self) -> StoreResult<Vec<T>> {
    let table = T::partition().table();

    let rows = self
      .with_conn(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT key, data FROM {} ORDER BY position",
          table
        ))?;
        let rows = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<Result<Vec<(String, Vec<u8>)>, _>>()?;
        Ok(rows)
      })
      .await?;

    Ok(decode_all(rows))
  }

  async fn count<T: Cacheable>(&self) -> StoreResult<usize> {
    let table = T::partition().table();

    self
      .with_conn(move |conn| {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
          row.get(0)
        })?;
        Ok(n as usize)
      })
      .await
  }

  async fn put<T: Cacheable>(&self, values: &[T]) -> StoreResult<()> {
    if values.is_empty() {
      return Ok(());
    }
    let table = T::partition().table();
    let rows = encode_all(values)?;

    self
      .with_conn(move |conn| {
        let tx = conn.transaction()?;
        insert_rows(&tx, table, &rows)?;
        tx.commit()?;
        debug!(partition = table, count = rows.len(), "stored cache rows");
        Ok(())
      })
      .await
  }

  async fn replace<T: Cacheable>(&self, values: &[T]) -> StoreResult<()> {
    let table = T::partition().table();
    let rows = encode_all(values)?;

    self
      .with_conn(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", table), [])?;
        insert_rows(&tx, table, &rows)?;
        tx.commit()?;
        debug!(partition = table, count = rows.len(), "replaced cache partition");
        Ok(())
      })
      .await
  }

  async fn clear<T: Cacheable>(&self) -> StoreResult<()> {
    let table = T::partition().table();

    self
      .with_conn(move |conn| {
        conn.execute(&format!("DELETE FROM {}", table), [])?;
        Ok(())
      })
      .await
  }

  fn close(&self) {
    match self.conn.lock() {
      Ok(mut guard) => {
        if guard.take().is_some() {
          debug!("closed cache database");
        }
      }
      Err(e) => warn!("failed to close cache database: {}", e),
    }
  }
}
