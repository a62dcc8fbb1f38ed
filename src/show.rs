use crate::region::Region;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a show, as assigned by the upstream feed.
pub type ShowId = u64;

/// Identifier of a single occurrence within a show.
pub type OccurrenceId = u64;

/// Separator used in the `"id | name"` search strings.
pub const SEARCH_KEY_SEPARATOR: &str = " | ";

/// One concrete, dated showing of a [`Show`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
  pub id: OccurrenceId,
  /// Back-reference to the owning show.
  pub show_id: ShowId,
  /// 1-based position within the show, as reported by the feed. Informational only.
  pub sequence: u32,
  pub start_at: DateTime<Utc>,
  pub end_at: DateTime<Utc>,
  pub region: Region,
}

/// A bounded-run virtual event with one or more occurrences, scoped to a region.
///
/// `start_at`/`end_at` are derived from the occurrences and are never set directly.
/// Use [`Show::from_occurrences`] to build one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Show {
  pub id: ShowId,
  /// Category tag from the feed (`virtualLiveType`).
  pub kind: String,
  pub name: String,
  pub region: Region,
  /// Earliest occurrence start.
  pub start_at: DateTime<Utc>,
  /// Latest occurrence end.
  pub end_at: DateTime<Utc>,
  /// Sorted ascending by `start_at`, never empty.
  pub occurrences: Vec<Occurrence>,
}

impl Show {
  /// Builds a show, sorting its occurrences and deriving `start_at`/`end_at` from them.
  ///
  /// Returns `None` when `occurrences` is empty; a show without occurrences does not exist.
  pub fn from_occurrences(
    id: ShowId,
    kind: impl Into<String>,
    name: impl Into<String>,
    region: Region,
    mut occurrences: Vec<Occurrence>,
  ) -> Option<Show> {
    occurrences.sort_by_key(|occ| (occ.start_at, occ.id));
    let start_at = occurrences.first()?.start_at;
    let end_at = occurrences.iter().map(|occ| occ.end_at).max()?;
    Some(Show {
      id,
      kind: kind.into(),
      name: name.into(),
      region,
      start_at,
      end_at,
      occurrences,
    })
  }

  pub fn occurrence(&self, occurrence_id: OccurrenceId) -> Option<&Occurrence> {
    self.occurrences.iter().find(|occ| occ.id == occurrence_id)
  }

  /// Whether the given occurrence is the final showing of this show.
  pub fn is_last_occurrence(&self, occurrence_id: OccurrenceId) -> bool {
    self
      .occurrences
      .last()
      .is_some_and(|occ| occ.id == occurrence_id)
  }

  /// The `"id | name"` string used by the search corpus and autocomplete choices.
  pub fn search_key(&self) -> String {
    format!("{}{}{}", self.id, SEARCH_KEY_SEPARATOR, self.name)
  }
}

/// Extracts the show id from an `"id | name"` search string.
///
/// A bare id (no separator) is accepted as well.
pub fn parse_search_id(search_key: &str) -> Option<ShowId> {
  let id_part = search_key
    .split_once(SEARCH_KEY_SEPARATOR.trim())
    .map_or(search_key, |(id, _)| id);
  id_part.trim().parse().ok()
}
