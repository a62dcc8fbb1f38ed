use super::{ensure_configured, ShowStore};
use crate::db::{to_millis, Database};
use crate::error::StoreError;
use crate::region::Region;
use crate::show::Show;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::debug;

/// [`ShowStore`] persisted in SQLite, one table per region.
///
/// Each row holds the show as a JSON document next to the indexed `start_at`/`end_at`
/// columns used for ordering and expiry.
#[derive(Debug, Clone)]
pub struct SqliteShowStore {
  db: Database,
  regions: Vec<Region>,
}

impl SqliteShowStore {
  /// Creates the store, ensuring a table exists for every region.
  pub fn new(db: Database, regions: &[Region]) -> Result<Self, StoreError> {
    db.ensure_region_tables(regions)?;
    Ok(Self {
      db,
      regions: regions.to_vec(),
    })
  }
}

#[async_trait]
impl ShowStore for SqliteShowStore {
  fn regions(&self) -> &[Region] {
    &self.regions
  }

  async fn upsert(&self, region: Region, show: &Show) -> Result<u64, StoreError> {
    ensure_configured(&self.regions, region)?;
    let table = region.collection_name();
    let id = show.id.to_string();
    let start_at = to_millis(show.start_at);
    let end_at = to_millis(show.end_at);
    let document = serde_json::to_string(show)?;

    self
      .db
      .call(move |conn| {
        let tx = conn.transaction()?;
        let inserted = tx.execute(
          &format!("INSERT OR IGNORE INTO {table} (id, start_at, end_at, document) VALUES (?1, ?2, ?3, ?4)"),
          params![id, start_at, end_at, document],
        )?;
        if inserted == 0 {
          tx.execute(
            &format!("UPDATE {table} SET start_at = ?2, end_at = ?3, document = ?4 WHERE id = ?1"),
            params![id, start_at, end_at, document],
          )?;
        }
        tx.commit()?;
        Ok(inserted as u64)
      })
      .await
  }

  async fn get_all(&self, region: Region) -> Result<Vec<Show>, StoreError> {
    ensure_configured(&self.regions, region)?;
    let table = region.collection_name();
    self
      .db
      .call(move |conn| {
        select_documents(
          conn,
          &format!("SELECT document FROM {table} ORDER BY start_at ASC, CAST(id AS INTEGER) ASC"),
          None,
        )
      })
      .await
  }

  async fn delete_expired(
    &self,
    now: DateTime<Utc>,
    retention: chrono::Duration,
  ) -> Result<Vec<Show>, StoreError> {
    let cutoff = to_millis(now + retention);
    let regions = self.regions.clone();
    self
      .db
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut deleted = Vec::new();
        for region in regions {
          let table = region.collection_name();
          let expired = select_documents(
            &tx,
            &format!("SELECT document FROM {table} WHERE end_at < ?1"),
            Some(cutoff),
          )?;
          let removed = tx.execute(&format!("DELETE FROM {table} WHERE end_at < ?1"), params![cutoff])?;
          debug!(%region, removed, "Deleted expired shows.");
          deleted.extend(expired);
        }
        tx.commit()?;
        Ok(deleted)
      })
      .await
  }
}

fn select_documents(conn: &Connection, sql: &str, bound: Option<i64>) -> Result<Vec<Show>, StoreError> {
  let mut stmt = conn.prepare(sql)?;
  let rows = match bound {
    Some(value) => stmt.query_map(params![value], document_column)?,
    None => stmt.query_map([], document_column)?,
  };

  let mut shows = Vec::new();
  for row in rows {
    shows.push(serde_json::from_str(&row?)?);
  }
  Ok(shows)
}

fn document_column(row: &Row<'_>) -> rusqlite::Result<String> {
  row.get(0)
}
