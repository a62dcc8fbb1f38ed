pub mod store;

use crate::error::{JobFailure, SchedulerError};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

// --- Public Type Aliases ---

/// Unique identifier of a persisted job record. Uses UUID v4.
pub type JobId = Uuid;

/// Type alias for the simple numeric ID assigned to worker tasks for logging.
pub(crate) type WorkerId = usize;

/// Result of one job execution. The failure reason is recorded on the job record.
pub type JobOutcome = Result<(), JobFailure>;

/// Boxed future returned by a [`JobHandler`].
pub type JobFuture = Pin<Box<dyn Future<Output = JobOutcome> + Send + 'static>>;

/// Type-erased named job handler.
///
/// Receives a copy of the job record (including its `data` payload) and resolves to a
/// [`JobOutcome`]. Panics inside the handler are caught by the worker and recorded as
/// failures.
pub type JobHandler = Arc<dyn Fn(JobRecord) -> JobFuture + Send + Sync + 'static>;

// --- Core Job Structures ---

/// When a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
  /// Run once at the given time.
  Once(DateTime<Utc>),
  /// Run repeatedly, `interval` after the previous run finished.
  Every(StdDuration),
}

impl Schedule {
  /// Calculates the next run time after `reference_time`, or `None` when the schedule
  /// has no further runs.
  pub(crate) fn calculate_next_run(&self, reference_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      Schedule::Every(interval) => match ChronoDuration::from_std(*interval) {
        Ok(chrono_interval) => reference_time.checked_add_signed(chrono_interval),
        Err(e) => {
          warn!("Failed to convert interval duration {:?}: {}", interval, e);
          None
        }
      },
      Schedule::Once(run_at) => {
        // Usually called after execution, so this prevents rescheduling.
        if reference_time < *run_at {
          Some(*run_at)
        } else {
          None
        }
      }
    }
  }
}

/// The durable state of a job, as kept in the [`store::JobStore`].
///
/// The store is the source of truth: the coordinator's queue is rebuilt from these
/// records on start, so scheduled jobs survive a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
  pub id: JobId,
  /// Name of the handler that executes this job.
  pub name: String,
  /// Handler-specific payload.
  pub data: serde_json::Value,
  pub schedule: Schedule,
  /// Deduplication key; at most one record per key exists in the store.
  pub unique_key: Option<String>,
  /// Next time the job is due, `None` once it has no further runs.
  pub next_run_at: Option<DateTime<Utc>>,
  pub last_run_at: Option<DateTime<Utc>>,
  pub last_finished_at: Option<DateTime<Utc>>,
  /// Set when the most recent run failed.
  pub failed_at: Option<DateTime<Utc>>,
  pub fail_reason: Option<String>,
  pub run_count: u32,
  pub fail_count: u32,
  /// A worker has picked the job up and not yet recorded its result.
  pub running: bool,
}

impl JobRecord {
  fn new(name: impl Into<String>, schedule: Schedule, data: serde_json::Value) -> Self {
    Self {
      id: Uuid::new_v4(),
      name: name.into(),
      data,
      schedule,
      unique_key: None,
      next_run_at: None,
      last_run_at: None,
      last_finished_at: None,
      failed_at: None,
      fail_reason: None,
      run_count: 0,
      fail_count: 0,
      running: false,
    }
  }

  /// A one-shot job due at `run_at`.
  pub fn once(name: impl Into<String>, run_at: DateTime<Utc>, data: serde_json::Value) -> Self {
    let mut record = Self::new(name, Schedule::Once(run_at), data);
    record.next_run_at = Some(run_at);
    record
  }

  /// A recurring job whose first run is one `interval` from now.
  pub fn every(name: impl Into<String>, interval: StdDuration) -> Result<Self, SchedulerError> {
    if interval.is_zero() {
      return Err(SchedulerError::InvalidInterval(interval));
    }
    let schedule = Schedule::Every(interval);
    let next_run_at = schedule
      .calculate_next_run(Utc::now())
      .ok_or(SchedulerError::InvalidInterval(interval))?;
    let mut record = Self::new(name, schedule, serde_json::Value::Null);
    record.next_run_at = Some(next_run_at);
    Ok(record)
  }

  pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
    self.unique_key = Some(key.into());
    self
  }

  /// Whether the most recent run failed.
  pub fn has_failed(&self) -> bool {
    self.failed_at.is_some()
  }

  /// A finished job that can be deleted: not running, nothing scheduled, ran at least
  /// once (last before `stale_before`), and did not fail.
  pub fn is_reapable(&self, stale_before: DateTime<Utc>) -> bool {
    !self.running
      && self.next_run_at.is_none()
      && self.failed_at.is_none()
      && self.last_run_at.is_some_and(|last_run| last_run < stale_before)
  }
}
