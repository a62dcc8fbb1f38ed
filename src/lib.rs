//! vlive-keeper: Virtual Live Schedule Cache and Reminder Scheduling
//!
//! Tracks "Virtual Live" show schedules published per regional game server, keeps a
//! read-optimized in-memory index over a durable store, and schedules durable reminder
//! jobs that fire shortly before each show occurrence starts.
//!
//! # Features
//!
//! - Per-region feed fetching and normalization (`feed`), fail-soft per record.
//! - Durable show storage in SQLite (or memory) with insert/modify detection (`store`).
//! - Lock-cheap cache queries: by id, by occurrence, and typo-tolerant name search
//!   capped at 25 autocomplete entries (`cache`).
//! - Refresh cycles that run regions independently and report newly seen shows
//!   (`refresh`).
//! - Deduplicated per-occurrence reminder jobs with a fallback snapshot for shows that
//!   disappear before their reminder fires (`reminder`).
//! - Daily cleanup of expired shows, their subscription state and finished jobs
//!   (`cleanup`).
//! - A durable named-job scheduler: coordinator task plus worker pool, persisted job
//!   records, recovery of interrupted runs, metrics and graceful/forced shutdown
//!   (`scheduler`).
//!
//! Notification delivery and subscription storage are supplied by the embedding
//! application through the [`Notifier`] and [`SubscriptionPurger`] traits.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use vlive_keeper::{LogNotifier, NoopPurger, Region, Settings, VliveKeeper};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::from_toml_str(
//!         r#"
//!         [database]
//!         path = ":memory:"
//!
//!         [feeds]
//!         English = "https://example.invalid/vlive/en.json"
//!         "#,
//!     )?;
//!
//!     let keeper = VliveKeeper::start(&settings, Arc::new(LogNotifier), Arc::new(NoopPurger)).await?;
//!
//!     for entry in keeper.cache.search_by_name(Region::English, "miku")? {
//!         println!("{entry}");
//!     }
//!
//!     keeper.shutdown(None).await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod cache;
pub mod cleanup;
mod command;
pub mod config;
mod coordinator;
pub mod db;
pub mod error;
pub mod feed;
pub mod job;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod refresh;
pub mod region;
pub mod reminder;
pub mod scheduler;
pub mod show;
pub mod store;
mod worker;

// --- Re-exports ---
pub use app::VliveKeeper;
pub use cache::{ScheduleCache, SEARCH_RESULT_LIMIT};
pub use cleanup::{CleanupSweeper, SweepReport};
pub use command::ShutdownMode;
pub use config::Settings;
pub use db::Database;
pub use error::{
  AppError, BuildError, CacheError, ConfigError, FeedError, JobFailure, NotifyError, RefreshError,
  RegionParseError, ReminderError, SchedulerError, ShutdownError, StoreError,
};
pub use feed::{normalize, FeedSource, HttpFeedSource};
pub use job::store::{JobStore, MemoryJobStore, SqliteJobStore};
pub use job::{JobHandler, JobId, JobOutcome, JobRecord, Schedule};
pub use jobs::{Services, CLEANUP_JOB, REFRESH_JOB, REMINDER_JOB};
pub use metrics::MetricsSnapshot;
pub use notify::{LogNotifier, NoopPurger, Notifier, Recipient, Reminder, SubscriptionPurger};
pub use refresh::{NewShows, RefreshOrchestrator, RefreshPhase, RefreshReport};
pub use region::Region;
pub use reminder::{DeliveryReport, FallbackSnapshot, ReminderJobData, ReminderScheduler, ScheduleReport};
pub use scheduler::{JobScheduler, SchedulerBuilder};
pub use show::{parse_search_id, Occurrence, OccurrenceId, Show, ShowId};
pub use store::{MemoryShowStore, ShowStore, SqliteShowStore};
