use crate::error::RegionParseError;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix shared by every per-region show collection.
pub const COLLECTION_PREFIX: &str = "vlive_data_";

/// The regional game servers a show feed can belong to.
///
/// This set is closed. Every per-region map in the crate is keyed by this enum, so adding
/// a region is a compile-time change rather than a new string key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Region {
  English,
  Japanese,
  Korean,
  Taiwanese,
}

impl Region {
  /// Every supported region, in declaration order.
  pub const ALL: [Region; 4] = [
    Region::English,
    Region::Japanese,
    Region::Korean,
    Region::Taiwanese,
  ];

  /// Canonical name used in configuration, logs and job payloads.
  pub fn as_str(&self) -> &'static str {
    match self {
      Region::English => "English",
      Region::Japanese => "Japanese",
      Region::Korean => "Korean",
      Region::Taiwanese => "Taiwanese",
    }
  }

  /// Name of the durable collection (SQLite table) holding this region's shows.
  pub fn collection_name(&self) -> String {
    format!("{}{}", COLLECTION_PREFIX, self.as_str().to_ascii_lowercase())
  }
}

impl fmt::Display for Region {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Region {
  type Err = RegionParseError;

  /// Parses a canonical region name. Case variants and aliases are rejected.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Region::ALL
      .iter()
      .copied()
      .find(|region| region.as_str() == s)
      .ok_or_else(|| RegionParseError(s.to_string()))
  }
}
