//! Layered settings: defaults, an optional `config.toml`, then `VLIVE__*` environment
//! variables (after loading `.env`).

use crate::error::ConfigError;
use crate::region::Region;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration as StdDuration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;

/// Largest accepted minute value; keeps every derived duration representable.
const MAX_MINUTES: i64 = 60 * 24 * 365 * 10;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
  pub refresh: RefreshSettings,
  pub reminder: ReminderSettings,
  pub cleanup: CleanupSettings,
  pub scheduler: SchedulerSettings,
  pub database: DatabaseSettings,
  pub logging: LoggingSettings,
  /// Feed URL per region name.
  #[serde(default)]
  pub feeds: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshSettings {
  pub interval_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReminderSettings {
  /// How long before an occurrence starts its reminder fires.
  pub offset_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupSettings {
  pub interval_minutes: i64,
  /// Shows ending within this window from now are deleted.
  pub retention_minutes: i64,
  /// Finished reminder jobs older than this are reaped.
  pub job_staleness_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
  pub max_workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
  /// SQLite file path, or `:memory:`.
  pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
  /// `tracing_subscriber::EnvFilter` directive. `RUST_LOG` takes precedence.
  pub filter: String,
}

impl Settings {
  /// Loads `.env`, then builds settings from defaults, `config.toml` (optional) and
  /// `VLIVE__SECTION__KEY` environment variables, in increasing precedence.
  ///
  /// # Errors
  ///
  /// Returns an error if a source cannot be read, a value has the wrong type, or
  /// validation fails.
  pub fn load() -> Result<Self, ConfigError> {
    dotenvy::dotenv().ok();

    let settings: Settings = with_defaults(Config::builder())?
      .add_source(File::with_name("config.toml").required(false))
      .add_source(
        Environment::with_prefix("VLIVE")
          .prefix_separator("__")
          .separator("__")
          .ignore_empty(true)
          .try_parsing(true),
      )
      .build()?
      .try_deserialize()?;
    settings.validate()?;
    Ok(settings)
  }

  /// Builds settings from defaults overlaid with a TOML document.
  pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
    let settings: Settings = with_defaults(Config::builder())?
      .add_source(File::from_str(toml, FileFormat::Toml))
      .build()?
      .try_deserialize()?;
    settings.validate()?;
    Ok(settings)
  }

  /// Checks value ranges. Feed keys are checked by [`feed_urls`](Self::feed_urls).
  pub fn validate(&self) -> Result<(), ConfigError> {
    check_minutes("refresh.interval_minutes", self.refresh.interval_minutes, false)?;
    check_minutes("reminder.offset_minutes", self.reminder.offset_minutes, true)?;
    check_minutes("cleanup.interval_minutes", self.cleanup.interval_minutes, false)?;
    check_minutes("cleanup.retention_minutes", self.cleanup.retention_minutes, true)?;
    check_minutes(
      "cleanup.job_staleness_minutes",
      self.cleanup.job_staleness_minutes,
      true,
    )?;
    if self.scheduler.max_workers == 0 {
      return Err(ConfigError::Invalid {
        key: "scheduler.max_workers",
        reason: "must be greater than zero".to_string(),
      });
    }
    Ok(())
  }

  /// The configured feeds keyed by region.
  ///
  /// Region keys are matched against the canonical names ignoring case, since
  /// environment variables arrive lower-cased.
  ///
  /// # Errors
  ///
  /// - [`ConfigError::UnknownRegion`]: a key names no supported region.
  /// - [`ConfigError::NoFeeds`]: no feed is configured.
  pub fn feed_urls(&self) -> Result<BTreeMap<Region, String>, ConfigError> {
    let mut feeds = BTreeMap::new();
    for (key, url) in &self.feeds {
      let region = Region::ALL
        .iter()
        .copied()
        .find(|region| region.as_str().eq_ignore_ascii_case(key))
        .ok_or_else(|| ConfigError::UnknownRegion(key.clone()))?;
      feeds.insert(region, url.clone());
    }
    if feeds.is_empty() {
      return Err(ConfigError::NoFeeds);
    }
    Ok(feeds)
  }

  pub fn refresh_interval(&self) -> StdDuration {
    minutes_std(self.refresh.interval_minutes)
  }

  pub fn cleanup_interval(&self) -> StdDuration {
    minutes_std(self.cleanup.interval_minutes)
  }

  pub fn reminder_offset(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.reminder.offset_minutes)
  }

  pub fn retention(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.cleanup.retention_minutes)
  }

  pub fn job_staleness(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.cleanup.job_staleness_minutes)
  }
}

fn with_defaults(builder: ConfigBuilder<DefaultState>) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
  Ok(
    builder
      .set_default("refresh.interval_minutes", 60)?
      .set_default("reminder.offset_minutes", 5)?
      .set_default("cleanup.interval_minutes", 1440)?
      .set_default("cleanup.retention_minutes", 1440)?
      .set_default("cleanup.job_staleness_minutes", 10080)?
      .set_default("scheduler.max_workers", 4)?
      .set_default("database.path", "vlive.sqlite3")?
      .set_default("logging.filter", "info")?,
  )
}

fn check_minutes(key: &'static str, value: i64, allow_zero: bool) -> Result<(), ConfigError> {
  let min = if allow_zero { 0 } else { 1 };
  if !(min..=MAX_MINUTES).contains(&value) {
    return Err(ConfigError::Invalid {
      key,
      reason: format!("{value} is outside {min}..={MAX_MINUTES} minutes"),
    });
  }
  Ok(())
}

fn minutes_std(minutes: i64) -> StdDuration {
  StdDuration::from_secs(minutes.unsigned_abs() * 60)
}
