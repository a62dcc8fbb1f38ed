use crate::job::JobId;
use crate::region::Region;

use std::time::Duration;

use thiserror::Error;

/// A region string that is not one of the supported [`Region`] names.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown region '{0}'")]
pub struct RegionParseError(pub String);

// --- Configuration ---

/// Errors raised while loading or validating [`crate::config::Settings`].
/// All of these are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to load configuration: {0}")]
  Load(#[from] config::ConfigError),
  #[error("Unknown region '{0}' in feed configuration")]
  UnknownRegion(String),
  #[error("No feed sources configured; at least one region is required")]
  NoFeeds,
  #[error("Invalid setting `{key}`: {reason}")]
  Invalid { key: &'static str, reason: String },
}

// --- Feed ---

/// Batch-level failures fetching a region's raw feed.
#[derive(Error, Debug)]
pub enum FeedError {
  #[error("Request to {url} failed: {source}")]
  Http {
    url: String,
    #[source]
    source: reqwest::Error,
  },
  #[error("Feed {url} did not return a JSON array: {source}")]
  Decode {
    url: String,
    #[source]
    source: reqwest::Error,
  },
  /// The feed answered with a non-success status.
  #[error("Feed {0} is unavailable")]
  Unavailable(String),
}

// --- Storage ---

/// Errors from a [`crate::store::ShowStore`] or [`crate::job::store::JobStore`].
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("Region {0} has no configured collection")]
  UnknownCollection(Region),
  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("Failed to encode or decode stored document: {0}")]
  Document(#[from] serde_json::Error),
  #[error("Blocking store task failed: {0}")]
  Task(String),
}

// --- Cache ---

#[derive(Error, Debug)]
pub enum CacheError {
  /// The region was not part of the configured set. This is a setup defect.
  #[error("Region {0} is not configured for this cache")]
  RegionNotConfigured(Region),
  #[error("Failed to load shows for region {region}: {source}")]
  Store {
    region: Region,
    #[source]
    source: StoreError,
  },
}

// --- Refresh ---

#[derive(Error, Debug)]
pub enum RefreshError {
  #[error("Region {0} has no configured feed")]
  RegionNotConfigured(Region),
  #[error(transparent)]
  Feed(#[from] FeedError),
  #[error(transparent)]
  Cache(#[from] CacheError),
}

// --- Notification collaborators ---

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
  #[error("Failed to resolve recipients: {0}")]
  Lookup(String),
  #[error("Failed to deliver notification: {0}")]
  Delivery(String),
  #[error("Failed to purge subscription state: {0}")]
  Purge(String),
}

// --- Reminders ---

#[derive(Error, Debug)]
pub enum ReminderError {
  #[error("Reminder job data is invalid: {0}")]
  InvalidPayload(#[from] serde_json::Error),
  #[error("Could not resolve reminder recipients: {0}")]
  Recipients(NotifyError),
  #[error("{failed} of {attempted} reminder deliveries failed")]
  Delivery { failed: usize, attempted: usize },
}

// --- Scheduler ---

/// Errors building the scheduler with [`crate::scheduler::SchedulerBuilder`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Maximum worker count (`max_workers`) must be specified and greater than zero")]
  MissingOrZeroMaxWorkers,
}

/// Errors related to submitting, querying or removing jobs.
#[derive(Error, Debug)]
pub enum SchedulerError {
  #[error("Scheduler command channel is closed (likely shut down or panicked).")]
  SchedulerShutdown,
  #[error("Scheduler did not respond to the request (Coordinator task may have panicked or shut down unexpectedly).")]
  ResponseFailed,
  #[error("Job {0} not found.")]
  JobNotFound(JobId),
  #[error("Scheduler has already been started.")]
  AlreadyStarted,
  #[error("Interval {0:?} is not a valid repeat interval.")]
  InvalidInterval(Duration),
  #[error("Job store error: {0}")]
  Store(#[from] StoreError),
}

/// Errors related to the scheduler shutdown process (`shutdown_graceful`, `shutdown_force`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (scheduler already shut down or watch channel error).")]
  SignalFailed,
  #[error("Timed out waiting for scheduler tasks (Coordinator, Workers) to complete shutdown.")]
  Timeout,
  #[error("A worker or coordinator task panicked during the shutdown process.")]
  TaskPanic,
}

/// The failure half of a job handler's result. The reason is stored on the job record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct JobFailure {
  pub reason: String,
}

impl JobFailure {
  pub fn new(reason: impl Into<String>) -> Self {
    Self {
      reason: reason.into(),
    }
  }
}

// --- Application assembly ---

#[derive(Error, Debug)]
pub enum AppError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  Cache(#[from] CacheError),
  #[error(transparent)]
  Build(#[from] BuildError),
  #[error(transparent)]
  Scheduler(#[from] SchedulerError),
  #[error(transparent)]
  Shutdown(#[from] ShutdownError),
}
