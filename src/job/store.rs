//! Backing store for job records.

use super::{JobId, JobRecord};
use crate::db::{to_millis, Database};
use crate::error::StoreError;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension, Row};

#[async_trait]
pub trait JobStore: Send + Sync {
  /// Inserts a new record.
  ///
  /// Returns `false` (and stores nothing) when a record with the same id or
  /// `unique_key` already exists.
  async fn insert(&self, record: &JobRecord) -> Result<bool, StoreError>;

  /// Creates or replaces the record with `record.id`.
  async fn save(&self, record: &JobRecord) -> Result<(), StoreError>;

  async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

  async fn find_by_name(&self, name: &str) -> Result<Vec<JobRecord>, StoreError>;

  /// Every record in the store.
  async fn load_all(&self) -> Result<Vec<JobRecord>, StoreError>;

  /// Deletes a record. Returns `false` if it did not exist.
  async fn remove(&self, id: JobId) -> Result<bool, StoreError>;
}

// --- In-memory ---

/// Volatile [`JobStore`]. Jobs do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
  records: Mutex<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl JobStore for MemoryJobStore {
  async fn insert(&self, record: &JobRecord) -> Result<bool, StoreError> {
    let mut records = self.records.lock();
    let duplicate = records.contains_key(&record.id)
      || record.unique_key.as_ref().is_some_and(|key| {
        records
          .values()
          .any(|existing| existing.unique_key.as_ref() == Some(key))
      });
    if duplicate {
      return Ok(false);
    }
    records.insert(record.id, record.clone());
    Ok(true)
  }

  async fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
    self.records.lock().insert(record.id, record.clone());
    Ok(())
  }

  async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
    Ok(self.records.lock().get(&id).cloned())
  }

  async fn find_by_name(&self, name: &str) -> Result<Vec<JobRecord>, StoreError> {
    Ok(
      self
        .records
        .lock()
        .values()
        .filter(|record| record.name == name)
        .cloned()
        .collect(),
    )
  }

  async fn load_all(&self) -> Result<Vec<JobRecord>, StoreError> {
    Ok(self.records.lock().values().cloned().collect())
  }

  async fn remove(&self, id: JobId) -> Result<bool, StoreError> {
    Ok(self.records.lock().remove(&id).is_some())
  }
}

// --- SQLite ---

/// [`JobStore`] persisted in the `vlive_jobs` table.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
  db: Database,
}

impl SqliteJobStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

struct EncodedRecord {
  id: String,
  name: String,
  unique_key: Option<String>,
  next_run_at: Option<i64>,
  document: String,
}

fn encode(record: &JobRecord) -> Result<EncodedRecord, StoreError> {
  Ok(EncodedRecord {
    id: record.id.to_string(),
    name: record.name.clone(),
    unique_key: record.unique_key.clone(),
    next_run_at: record.next_run_at.map(to_millis),
    document: serde_json::to_string(record)?,
  })
}

fn document_column(row: &Row<'_>) -> rusqlite::Result<String> {
  row.get(0)
}

fn decode_all(documents: Vec<String>) -> Result<Vec<JobRecord>, StoreError> {
  documents
    .iter()
    .map(|doc| serde_json::from_str(doc).map_err(StoreError::from))
    .collect()
}

#[async_trait]
impl JobStore for SqliteJobStore {
  async fn insert(&self, record: &JobRecord) -> Result<bool, StoreError> {
    let row = encode(record)?;
    self
      .db
      .call(move |conn| {
        let inserted = conn.execute(
          "INSERT OR IGNORE INTO vlive_jobs (id, name, unique_key, next_run_at, document)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          params![row.id, row.name, row.unique_key, row.next_run_at, row.document],
        )?;
        Ok(inserted == 1)
      })
      .await
  }

  async fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
    let row = encode(record)?;
    self
      .db
      .call(move |conn| {
        conn.execute(
          "INSERT INTO vlive_jobs (id, name, unique_key, next_run_at, document)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             unique_key = excluded.unique_key,
             next_run_at = excluded.next_run_at,
             document = excluded.document",
          params![row.id, row.name, row.unique_key, row.next_run_at, row.document],
        )?;
        Ok(())
      })
      .await
  }

  async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
    let id = id.to_string();
    let document = self
      .db
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT document FROM vlive_jobs WHERE id = ?1",
              params![id],
              document_column,
            )
            .optional()?,
        )
      })
      .await?;
    document
      .map(|doc| serde_json::from_str(&doc).map_err(StoreError::from))
      .transpose()
  }

  async fn find_by_name(&self, name: &str) -> Result<Vec<JobRecord>, StoreError> {
    let name = name.to_string();
    let documents = self
      .db
      .call(move |conn| {
        let mut stmt = conn.prepare("SELECT document FROM vlive_jobs WHERE name = ?1")?;
        let rows = stmt.query_map(params![name], document_column)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
      })
      .await?;
    decode_all(documents)
  }

  async fn load_all(&self) -> Result<Vec<JobRecord>, StoreError> {
    let documents = self
      .db
      .call(|conn| {
        let mut stmt = conn.prepare("SELECT document FROM vlive_jobs ORDER BY next_run_at ASC")?;
        let rows = stmt.query_map([], document_column)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
      })
      .await?;
    decode_all(documents)
  }

  async fn remove(&self, id: JobId) -> Result<bool, StoreError> {
    let id = id.to_string();
    self
      .db
      .call(move |conn| {
        let removed = conn.execute("DELETE FROM vlive_jobs WHERE id = ?1", params![id])?;
        Ok(removed > 0)
      })
      .await
  }
}
