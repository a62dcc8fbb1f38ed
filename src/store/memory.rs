use super::{ensure_configured, ShowStore};
use crate::error::StoreError;
use crate::region::Region;
use crate::show::{Show, ShowId};

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Volatile [`ShowStore`], used in tests and when no database is configured.
#[derive(Debug)]
pub struct MemoryShowStore {
  regions: Vec<Region>,
  collections: RwLock<HashMap<Region, HashMap<ShowId, Show>>>,
}

impl MemoryShowStore {
  pub fn new(regions: &[Region]) -> Self {
    Self {
      regions: regions.to_vec(),
      collections: RwLock::new(regions.iter().map(|r| (*r, HashMap::new())).collect()),
    }
  }
}

#[async_trait]
impl ShowStore for MemoryShowStore {
  fn regions(&self) -> &[Region] {
    &self.regions
  }

  async fn upsert(&self, region: Region, show: &Show) -> Result<u64, StoreError> {
    ensure_configured(&self.regions, region)?;
    let mut collections = self.collections.write();
    let collection = collections.entry(region).or_default();
    let previous = collection.insert(show.id, show.clone());
    Ok(if previous.is_none() { 1 } else { 0 })
  }

  async fn get_all(&self, region: Region) -> Result<Vec<Show>, StoreError> {
    ensure_configured(&self.regions, region)?;
    let collections = self.collections.read();
    let mut shows: Vec<Show> = collections
      .get(&region)
      .map(|c| c.values().cloned().collect())
      .unwrap_or_default();
    shows.sort_by_key(|show| (show.start_at, show.id));
    Ok(shows)
  }

  async fn delete_expired(
    &self,
    now: DateTime<Utc>,
    retention: chrono::Duration,
  ) -> Result<Vec<Show>, StoreError> {
    let cutoff = now + retention;
    let mut collections = self.collections.write();
    let mut deleted = Vec::new();
    for region in &self.regions {
      if let Some(collection) = collections.get_mut(region) {
        let expired: Vec<ShowId> = collection
          .values()
          .filter(|show| show.end_at < cutoff)
          .map(|show| show.id)
          .collect();
        deleted.extend(expired.iter().filter_map(|id| collection.remove(id)));
      }
    }
    Ok(deleted)
  }
}
