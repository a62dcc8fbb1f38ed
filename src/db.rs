//! Shared SQLite handle used by the show store and the job store.

use crate::error::StoreError;
use crate::region::Region;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

/// Connection-level setup plus the job table. Per-region show tables are created by
/// [`Database::ensure_region_tables`] since their names depend on configuration.
pub(crate) const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS vlive_jobs (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    unique_key   TEXT UNIQUE,
    next_run_at  INTEGER,
    document     TEXT NOT NULL         -- JSON JobRecord
);

CREATE INDEX IF NOT EXISTS idx_jobs_name ON vlive_jobs(name);
CREATE INDEX IF NOT EXISTS idx_jobs_next_run_at ON vlive_jobs(next_run_at);
"#;

/// A cloneable handle to one SQLite connection.
///
/// Calls are serialized through a mutex and run on Tokio's blocking pool.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Database").finish_non_exhaustive()
  }
}

impl Database {
  /// Opens (or creates) the database file at `path`. `":memory:"` opens a private
  /// in-memory database.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let path = path.as_ref();
    let conn = if path == Path::new(":memory:") {
      Connection::open_in_memory()?
    } else {
      Connection::open(path)?
    };
    info!(path = %path.display(), "Opened SQLite database.");
    Self::from_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, StoreError> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Creates the show table (and its indexes) for each region if missing.
  pub(crate) fn ensure_region_tables(&self, regions: &[Region]) -> Result<(), StoreError> {
    let conn = self.conn.lock();
    for region in regions {
      let table = region.collection_name();
      conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
             id        TEXT PRIMARY KEY,
             start_at  INTEGER NOT NULL,
             end_at    INTEGER NOT NULL,
             document  TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_{table}_start_at ON {table}(start_at);
         CREATE INDEX IF NOT EXISTS idx_{table}_end_at ON {table}(end_at);"
      ))?;
    }
    Ok(())
  }

  /// Runs `f` against the connection on the blocking pool.
  pub(crate) async fn call<F, T>(&self, f: F) -> Result<T, StoreError>
  where
    F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
  {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let mut guard = conn.lock();
      f(&mut guard)
    })
    .await
    .map_err(|e| StoreError::Task(e.to_string()))?
  }
}

// --- Timestamp columns ---

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}
