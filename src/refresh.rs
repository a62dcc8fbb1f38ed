//! Periodic fetch → normalize → upsert → resync cycle, one independent pass per region.

use crate::cache::ScheduleCache;
use crate::error::RefreshError;
use crate::feed::{normalize, FeedSource};
use crate::region::Region;
use crate::show::Show;
use crate::store::ShowStore;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn, Instrument};

/// Where a region's refresh currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
  Idle,
  Fetching,
  Upserting,
  Resyncing,
}

impl fmt::Display for RefreshPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      RefreshPhase::Idle => "idle",
      RefreshPhase::Fetching => "fetching",
      RefreshPhase::Upserting => "upserting",
      RefreshPhase::Resyncing => "resyncing",
    };
    f.write_str(s)
  }
}

/// Shows first inserted by a refresh cycle, per region.
///
/// A region that refreshed without new shows maps to an empty list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewShows(BTreeMap<Region, Vec<Show>>);

impl NewShows {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, region: Region, shows: Vec<Show>) {
    self.0.insert(region, shows);
  }

  pub fn get(&self, region: Region) -> Option<&[Show]> {
    self.0.get(&region).map(Vec::as_slice)
  }

  /// Whether no region produced a new show.
  pub fn is_empty(&self) -> bool {
    self.0.values().all(Vec::is_empty)
  }

  /// Number of new shows across regions.
  pub fn total(&self) -> usize {
    self.0.values().map(Vec::len).sum()
  }

  pub fn iter(&self) -> impl Iterator<Item = (Region, &[Show])> {
    self.0.iter().map(|(region, shows)| (*region, shows.as_slice()))
  }

  fn merge(&mut self, other: NewShows) {
    self.0.extend(other.0);
  }
}

/// Outcome of a refresh over one or more regions.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
  pub new_shows: NewShows,
  /// Regions whose fetch or resync failed, with the error text.
  pub failures: BTreeMap<Region, String>,
  /// Regions skipped because a refresh for them was already in flight.
  pub skipped: Vec<Region>,
}

impl RefreshReport {
  pub fn is_success(&self) -> bool {
    self.failures.is_empty()
  }

  fn merge(&mut self, other: RefreshReport) {
    self.new_shows.merge(other.new_shows);
    self.failures.extend(other.failures);
    self.skipped.extend(other.skipped);
  }
}

/// Drives refresh cycles over the configured regions.
pub struct RefreshOrchestrator {
  feeds: BTreeMap<Region, String>,
  source: Arc<dyn FeedSource>,
  store: Arc<dyn ShowStore>,
  cache: Arc<ScheduleCache>,
  locks: HashMap<Region, Mutex<()>>,
  phases: SyncMutex<HashMap<Region, RefreshPhase>>,
}

impl fmt::Debug for RefreshOrchestrator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RefreshOrchestrator")
      .field("feeds", &self.feeds)
      .field("phases", &*self.phases.lock())
      .finish_non_exhaustive()
  }
}

impl RefreshOrchestrator {
  /// `feeds` maps each configured region to its feed URL.
  pub fn new(
    feeds: BTreeMap<Region, String>,
    source: Arc<dyn FeedSource>,
    store: Arc<dyn ShowStore>,
    cache: Arc<ScheduleCache>,
  ) -> Self {
    let locks = feeds.keys().map(|region| (*region, Mutex::new(()))).collect();
    let phases = feeds.keys().map(|region| (*region, RefreshPhase::Idle)).collect();
    Self {
      feeds,
      source,
      store,
      cache,
      locks,
      phases: SyncMutex::new(phases),
    }
  }

  pub fn regions(&self) -> impl Iterator<Item = Region> + '_ {
    self.feeds.keys().copied()
  }

  /// Current phase of `region`, `None` if it is not configured.
  pub fn phase(&self, region: Region) -> Option<RefreshPhase> {
    self.phases.lock().get(&region).copied()
  }

  fn set_phase(&self, region: Region, phase: RefreshPhase) {
    self.phases.lock().insert(region, phase);
    debug!(%region, %phase, "Refresh phase changed.");
  }

  /// Refreshes every configured region concurrently.
  ///
  /// A failing region is recorded in the report and does not affect the others.
  pub async fn run_for_all_regions(&self) -> RefreshReport {
    let runs = self.feeds.keys().map(|region| {
      let region = *region;
      async move { (region, self.run_for_region(region).await) }
    });

    let mut report = RefreshReport::default();
    for (region, result) in join_all(runs).await {
      match result {
        Ok(region_report) => report.merge(region_report),
        // Only an unconfigured region errors here, which cannot happen for our own keys.
        Err(e) => {
          error!(%region, error = %e, "Refresh failed.");
          report.failures.insert(region, e.to_string());
        }
      }
    }

    info!(
      new_shows = report.new_shows.total(),
      failed_regions = report.failures.len(),
      skipped_regions = report.skipped.len(),
      "Refresh cycle finished."
    );
    report
  }

  /// Refreshes one region: fetch, normalize, upsert every show, then resync the cache.
  ///
  /// Fetch and resync faults are recorded in the returned report. Shows inserted before
  /// a failed resync are still reported as new. A refresh already in flight for the
  /// region makes this call a no-op listed in `skipped`.
  ///
  /// # Errors
  ///
  /// - [`RefreshError::RegionNotConfigured`]: the region has no feed.
  pub async fn run_for_region(&self, region: Region) -> Result<RefreshReport, RefreshError> {
    let (Some(url), Some(lock)) = (self.feeds.get(&region), self.locks.get(&region)) else {
      return Err(RefreshError::RegionNotConfigured(region));
    };

    let mut report = RefreshReport::default();
    let Ok(_guard) = lock.try_lock() else {
      info!(%region, "Refresh already in progress, skipping.");
      report.skipped.push(region);
      return Ok(report);
    };

    let span = tracing::info_span!("refresh", %region);
    let mut new_shows = Vec::new();
    let result = self
      .refresh_locked(region, url, &mut new_shows)
      .instrument(span)
      .await;
    self.set_phase(region, RefreshPhase::Idle);

    // Inserted shows are persisted, so they are reported even if the resync failed.
    if result.is_ok() || !new_shows.is_empty() {
      report.new_shows.insert(region, new_shows);
    }
    if let Err(e) = result {
      error!(%region, error = %e, "Region refresh failed.");
      report.failures.insert(region, e.to_string());
    }
    Ok(report)
  }

  /// Pushes every show inserted for the first time onto `new_shows` as it is persisted.
  async fn refresh_locked(
    &self,
    region: Region,
    url: &str,
    new_shows: &mut Vec<Show>,
  ) -> Result<(), RefreshError> {
    self.set_phase(region, RefreshPhase::Fetching);
    let raw = self.source.fetch_raw_shows(url).await?;
    let shows = normalize(&raw, Utc::now(), region);
    debug!(raw = raw.len(), shows = shows.len(), "Normalized feed.");

    self.set_phase(region, RefreshPhase::Upserting);
    for show in shows {
      match self.store.upsert(region, &show).await {
        Ok(1) => {
          info!(show_id = show.id, name = %show.name, "Inserted show.");
          new_shows.push(show);
        }
        Ok(_) => {
          debug!(show_id = show.id, "Modified show.");
        }
        Err(e) => {
          warn!(show_id = show.id, error = %e, "Failed to upsert show; continuing.");
        }
      }
    }

    self.set_phase(region, RefreshPhase::Resyncing);
    self.cache.resync(region).await?;

    info!(new_shows = new_shows.len(), "Region refreshed.");
    Ok(())
  }
}
