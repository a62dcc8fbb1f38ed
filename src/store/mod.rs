//! Persistent show store.
//!
//! One collection per configured region, keyed by show id. The store is the system of
//! record; the [`crate::cache::ScheduleCache`] is rebuilt from it.

mod memory;
mod sqlite;

pub use memory::MemoryShowStore;
pub use sqlite::SqliteShowStore;

use crate::error::StoreError;
use crate::region::Region;
use crate::show::Show;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait ShowStore: Send + Sync {
  /// Regions this store holds a collection for.
  fn regions(&self) -> &[Region];

  /// Inserts or replaces the show with `show.id` in the region's collection.
  ///
  /// Returns `1` when the id was not present before (a new show) and `0` when an
  /// existing record was updated in place.
  async fn upsert(&self, region: Region, show: &Show) -> Result<u64, StoreError>;

  /// All shows of a region, ascending by `start_at`.
  async fn get_all(&self, region: Region) -> Result<Vec<Show>, StoreError>;

  /// Deletes, across every region, the shows whose `end_at` precedes `now + retention`
  /// and returns them.
  async fn delete_expired(
    &self,
    now: DateTime<Utc>,
    retention: chrono::Duration,
  ) -> Result<Vec<Show>, StoreError>;
}

pub(crate) fn ensure_configured(regions: &[Region], region: Region) -> Result<(), StoreError> {
  if regions.contains(&region) {
    Ok(())
  } else {
    Err(StoreError::UnknownCollection(region))
  }
}
