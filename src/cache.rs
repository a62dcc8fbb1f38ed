//! In-memory schedule cache.
//!
//! The read path for every user-facing query. Each configured region has an immutable
//! [`RegionIndex`] built from the store; [`ScheduleCache::resync`] builds a fresh one and
//! swaps it in, so readers never observe a half-built index and never perform I/O.

use crate::error::CacheError;
use crate::region::Region;
use crate::show::{parse_search_id, Occurrence, OccurrenceId, Show, ShowId};
use crate::store::ShowStore;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Maximum number of entries returned by [`ScheduleCache::search_by_name`].
pub const SEARCH_RESULT_LIMIT: usize = 25;

/// Terms shorter than this only match exactly; one edit on a two-letter term matches
/// nearly everything.
const MIN_FUZZY_TERM_CHARS: usize = 3;

/// Read-optimized projection of one region's shows.
#[derive(Debug, Default)]
struct RegionIndex {
  by_id: HashMap<ShowId, Arc<Show>>,
  sorted: Vec<Arc<Show>>,
  occurrences_by_id: HashMap<ShowId, HashMap<OccurrenceId, Occurrence>>,
  occurrences_sorted: HashMap<ShowId, Vec<Occurrence>>,
  /// `"id | name"` entries in show start order.
  search_corpus: Vec<String>,
  /// Lower-cased copy of `search_corpus`, index-aligned.
  search_folded: Vec<String>,
  synced_at: Option<DateTime<Utc>>,
}

impl RegionIndex {
  fn build(mut shows: Vec<Show>, synced_at: DateTime<Utc>) -> Self {
    // The store already sorts; re-sorting keeps the index correct for any store.
    shows.sort_by_key(|show| (show.start_at, show.id));

    let mut index = RegionIndex {
      synced_at: Some(synced_at),
      ..Default::default()
    };
    for show in shows {
      let show = Arc::new(show);
      let key = show.search_key();
      index.search_folded.push(key.to_lowercase());
      index.search_corpus.push(key);
      index.occurrences_by_id.insert(
        show.id,
        show.occurrences.iter().map(|occ| (occ.id, occ.clone())).collect(),
      );
      index.occurrences_sorted.insert(show.id, show.occurrences.clone());
      index.by_id.insert(show.id, show.clone());
      index.sorted.push(show);
    }
    index
  }

  fn default_slice(&self, limit: usize) -> Vec<String> {
    self.search_corpus.iter().take(limit).cloned().collect()
  }

  fn search(&self, query: &str, limit: usize) -> Vec<String> {
    let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
    if terms.is_empty() {
      return self.default_slice(limit);
    }

    // (fuzzy term count, first match position, corpus position)
    let mut hits: Vec<(usize, usize, usize)> = self
      .search_folded
      .iter()
      .enumerate()
      .filter_map(|(pos, haystack)| {
        match_terms(haystack, &terms).map(|(fuzzy, first)| (fuzzy, first, pos))
      })
      .collect();

    if hits.is_empty() {
      return self.default_slice(limit);
    }
    hits.sort_unstable();
    hits
      .into_iter()
      .take(limit)
      .map(|(_, _, pos)| self.search_corpus[pos].clone())
      .collect()
  }
}

/// Returns `(fuzzy term count, earliest match position)` when every term matches.
fn match_terms(haystack: &str, terms: &[String]) -> Option<(usize, usize)> {
  let mut fuzzy = 0;
  let mut first = usize::MAX;
  for term in terms {
    if let Some(pos) = haystack.find(term.as_str()) {
      first = first.min(haystack[..pos].chars().count());
    } else {
      let pos = fuzzy_find(haystack, term)?;
      fuzzy += 1;
      first = first.min(pos);
    }
  }
  Some((fuzzy, first))
}

/// Finds a window of `haystack` within one edit (insertion, deletion, substitution or
/// adjacent transposition) of `term`. Returns the window's char offset.
fn fuzzy_find(haystack: &str, term: &str) -> Option<usize> {
  let term_chars = term.chars().count();
  if term_chars < MIN_FUZZY_TERM_CHARS {
    return None;
  }

  let chars: Vec<char> = haystack.chars().collect();
  for start in 0..chars.len() {
    for len in [term_chars - 1, term_chars, term_chars + 1] {
      let Some(window) = chars.get(start..start + len) else {
        continue;
      };
      let window: String = window.iter().collect();
      if strsim::osa_distance(&window, term) <= 1 {
        return Some(start);
      }
    }
  }
  None
}

/// The in-memory schedule cache.
///
/// Constructed once at startup with the configured regions. It is mutated only through
/// [`resync`](Self::resync) and [`resync_all`](Self::resync_all); every other method is a
/// synchronous read.
pub struct ScheduleCache {
  store: Arc<dyn ShowStore>,
  regions: Vec<Region>,
  indexes: RwLock<HashMap<Region, Arc<RegionIndex>>>,
  /// Held from store read to swap so an older snapshot never replaces a newer one.
  resync_locks: HashMap<Region, Mutex<()>>,
}

impl std::fmt::Debug for ScheduleCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ScheduleCache")
      .field("regions", &self.regions)
      .finish_non_exhaustive()
  }
}

impl ScheduleCache {
  /// Creates an empty cache for `regions`. Call [`resync_all`](Self::resync_all) to load it.
  pub fn new(store: Arc<dyn ShowStore>, regions: &[Region]) -> Self {
    let indexes = regions
      .iter()
      .map(|region| (*region, Arc::new(RegionIndex::default())))
      .collect();
    let resync_locks = regions.iter().map(|region| (*region, Mutex::new(()))).collect();
    Self {
      store,
      regions: regions.to_vec(),
      indexes: RwLock::new(indexes),
      resync_locks,
    }
  }

  pub fn regions(&self) -> &[Region] {
    &self.regions
  }

  fn index(&self, region: Region) -> Result<Arc<RegionIndex>, CacheError> {
    self
      .indexes
      .read()
      .get(&region)
      .cloned()
      .ok_or(CacheError::RegionNotConfigured(region))
  }

  // --- Synchronization ---

  /// Replaces the region's index wholesale with the store's current contents.
  ///
  /// On a store error the previous index stays in place. Resyncs of the same region
  /// run one at a time.
  ///
  /// # Errors
  ///
  /// - [`CacheError::RegionNotConfigured`]: `region` is not one of the configured regions.
  /// - [`CacheError::Store`]: the store could not be read.
  pub async fn resync(&self, region: Region) -> Result<(), CacheError> {
    let Some(lock) = self.resync_locks.get(&region) else {
      return Err(CacheError::RegionNotConfigured(region));
    };
    let _guard = lock.lock().await;

    let shows = self
      .store
      .get_all(region)
      .await
      .map_err(|source| CacheError::Store { region, source })?;
    let count = shows.len();
    let index = Arc::new(RegionIndex::build(shows, Utc::now()));
    self.indexes.write().insert(region, index);

    info!(%region, shows = count, "Resynced schedule cache.");
    Ok(())
  }

  /// Resyncs every configured region. All regions are attempted; the first error is
  /// returned after the rest have been processed.
  pub async fn resync_all(&self) -> Result<(), CacheError> {
    let mut first_error = None;
    for region in &self.regions {
      if let Err(e) = self.resync(*region).await {
        error!(%region, error = %e, "Failed to resync region.");
        first_error.get_or_insert(e);
      }
    }
    first_error.map_or(Ok(()), Err)
  }

  /// Time of the region's last successful resync, `None` if it never synced.
  pub fn last_synced_at(&self, region: Region) -> Result<Option<DateTime<Utc>>, CacheError> {
    Ok(self.index(region)?.synced_at)
  }

  // --- Queries ---

  /// All shows of the region, ascending by start. `None` when the region has no shows.
  pub fn get_all_shows(&self, region: Region) -> Result<Option<Vec<Arc<Show>>>, CacheError> {
    let index = self.index(region)?;
    if index.sorted.is_empty() {
      return Ok(None);
    }
    Ok(Some(index.sorted.clone()))
  }

  pub fn get_show_by_id(&self, region: Region, show_id: ShowId) -> Result<Option<Arc<Show>>, CacheError> {
    Ok(self.index(region)?.by_id.get(&show_id).cloned())
  }

  /// The show's occurrences, ascending by start.
  pub fn get_occurrences_for_show(
    &self,
    region: Region,
    show_id: ShowId,
  ) -> Result<Option<Vec<Occurrence>>, CacheError> {
    Ok(self.index(region)?.occurrences_sorted.get(&show_id).cloned())
  }

  pub fn get_occurrence_by_id(
    &self,
    region: Region,
    show_id: ShowId,
    occurrence_id: OccurrenceId,
  ) -> Result<Option<Occurrence>, CacheError> {
    let index = self.index(region)?;
    Ok(
      index
        .occurrences_by_id
        .get(&show_id)
        .and_then(|occurrences| occurrences.get(&occurrence_id))
        .cloned(),
    )
  }

  /// Typo-tolerant search over the region's `"id | name"` strings.
  ///
  /// Every whitespace-separated term must match, either as a case-insensitive substring
  /// or within a single edit. Exact matches rank first. At most
  /// [`SEARCH_RESULT_LIMIT`] entries are returned. An empty query, or one with no
  /// match, yields the first entries in start order instead of an empty list.
  pub fn search_by_name(&self, region: Region, query: &str) -> Result<Vec<String>, CacheError> {
    let index = self.index(region)?;
    let results = index.search(query, SEARCH_RESULT_LIMIT);
    debug!(%region, query, results = results.len(), "Searched shows by name.");
    Ok(results)
  }

  /// Resolves an `"id | name"` search string (e.g. a picked autocomplete choice) back
  /// into its show.
  pub fn show_by_search_string(&self, region: Region, search_key: &str) -> Result<Option<Arc<Show>>, CacheError> {
    match parse_search_id(search_key) {
      Some(show_id) => self.get_show_by_id(region, show_id),
      None => {
        // Still surface a configuration fault for unknown regions.
        self.index(region)?;
        Ok(None)
      }
    }
  }
}
