//! External schedule source adapter.
//!
//! Fetches a region's raw feed (a JSON array of show objects) and normalizes it into
//! [`Show`] records. Normalization is fail-soft per record: a malformed show or occurrence
//! is logged together with its payload and skipped, never aborting the batch.

use crate::error::FeedError;
use crate::region::Region;
use crate::show::{Occurrence, OccurrenceId, Show, ShowId};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Show category that is never tracked.
pub const BEGINNER_KIND: &str = "beginner";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of raw feed data for a region.
#[async_trait]
pub trait FeedSource: Send + Sync {
  /// Fetches the raw JSON array published at `url`.
  async fn fetch_raw_shows(&self, url: &str) -> Result<Vec<Value>, FeedError>;
}

/// [`FeedSource`] backed by HTTP GET requests.
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
  client: reqwest::Client,
  timeout: Duration,
}

impl Default for HttpFeedSource {
  fn default() -> Self {
    Self {
      client: reqwest::Client::new(),
      timeout: DEFAULT_REQUEST_TIMEOUT,
    }
  }
}

impl HttpFeedSource {
  pub fn new() -> Self {
    Self::default()
  }

  /// Uses an existing client (connection pool, proxies, headers).
  pub fn with_client(client: reqwest::Client) -> Self {
    Self {
      client,
      timeout: DEFAULT_REQUEST_TIMEOUT,
    }
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
  async fn fetch_raw_shows(&self, url: &str) -> Result<Vec<Value>, FeedError> {
    debug!(%url, "Fetching show feed.");
    let response = self
      .client
      .get(url)
      .timeout(self.timeout)
      .send()
      .await
      .map_err(|source| FeedError::Http {
        url: url.to_string(),
        source,
      })?;

    let status = response.status();
    if !status.is_success() {
      return Err(FeedError::Unavailable(format!("{url}: {status}")));
    }

    response
      .json::<Vec<Value>>()
      .await
      .map_err(|source| FeedError::Decode {
        url: url.to_string(),
        source,
      })
  }
}

// --- Wire records ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawShow {
  id: ShowId,
  virtual_live_type: String,
  name: String,
  // Validated for shape only; the stored bounds are derived from the occurrences.
  #[allow(dead_code)]
  start_at: i64,
  #[allow(dead_code)]
  end_at: i64,
  virtual_live_schedules: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOccurrence {
  id: OccurrenceId,
  virtual_live_id: ShowId,
  seq: u32,
  start_at: i64,
  end_at: i64,
}

// --- Normalization ---

/// Normalizes a raw feed batch for `region` as of `as_of`.
///
/// Rules, in order:
/// 1. shows whose type is `"beginner"` (any case) are dropped;
/// 2. occurrences that ended before `as_of` are dropped;
/// 3. shows left without occurrences are dropped;
/// 4. shows whose derived end precedes `as_of` are dropped;
/// 5. occurrences are sorted by start, then shows by derived start.
pub fn normalize(raw: &[Value], as_of: DateTime<Utc>, region: Region) -> Vec<Show> {
  let mut shows: Vec<Show> = raw
    .iter()
    .enumerate()
    .filter_map(|(index, value)| normalize_show(index, value, as_of, region))
    .collect();
  shows.sort_by_key(|show| (show.start_at, show.id));

  debug!(
    %region,
    raw_count = raw.len(),
    retained = shows.len(),
    "Normalized show feed."
  );
  shows
}

fn normalize_show(index: usize, value: &Value, as_of: DateTime<Utc>, region: Region) -> Option<Show> {
  let raw = match RawShow::deserialize(value) {
    Ok(raw) => raw,
    Err(e) => {
      warn!(%region, index, error = %e, payload = %value, "Skipping malformed show record.");
      return None;
    }
  };

  if raw.virtual_live_type.eq_ignore_ascii_case(BEGINNER_KIND) {
    debug!(%region, show_id = raw.id, "Skipping beginner show.");
    return None;
  }

  let occurrences: Vec<Occurrence> = raw
    .virtual_live_schedules
    .iter()
    .filter_map(|occ| normalize_occurrence(occ, raw.id, region))
    .filter(|occ| occ.end_at >= as_of)
    .collect();

  let Some(show) = Show::from_occurrences(raw.id, raw.virtual_live_type, raw.name, region, occurrences)
  else {
    debug!(%region, show_id = raw.id, "Skipping show with no upcoming occurrences.");
    return None;
  };

  if show.end_at < as_of {
    debug!(%region, show_id = show.id, end_at = %show.end_at, "Skipping ended show.");
    return None;
  }
  Some(show)
}

fn normalize_occurrence(value: &Value, show_id: ShowId, region: Region) -> Option<Occurrence> {
  let raw = match RawOccurrence::deserialize(value) {
    Ok(raw) => raw,
    Err(e) => {
      warn!(%region, show_id, error = %e, payload = %value, "Skipping malformed occurrence record.");
      return None;
    }
  };

  if raw.virtual_live_id != show_id {
    warn!(
      %region,
      show_id,
      occurrence_id = raw.id,
      virtual_live_id = raw.virtual_live_id,
      "Skipping occurrence that references a different show."
    );
    return None;
  }

  let (Some(start_at), Some(end_at)) = (
    DateTime::from_timestamp_millis(raw.start_at),
    DateTime::from_timestamp_millis(raw.end_at),
  ) else {
    warn!(%region, show_id, occurrence_id = raw.id, payload = %value, "Skipping occurrence with out-of-range timestamps.");
    return None;
  };

  if end_at <= start_at {
    warn!(%region, show_id, occurrence_id = raw.id, %start_at, %end_at, "Skipping occurrence that ends before it starts.");
    return None;
  }

  Some(Occurrence {
    id: raw.id,
    show_id,
    sequence: raw.seq,
    start_at,
    end_at,
    region,
  })
}
