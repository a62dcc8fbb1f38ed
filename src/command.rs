use crate::error::SchedulerError;
use crate::job::JobId;
use crate::metrics::MetricsSnapshot;

use chrono::{DateTime, Utc};
use fibre::oneshot;

/// Commands sent from the `JobScheduler` handle to the central Coordinator task.
///
/// Each command carries a `oneshot::Sender` for the Coordinator's response.
#[derive(Debug)]
pub(crate) enum CoordinatorCommand {
  /// Load persisted jobs into the queue and begin dispatching.
  /// Responds with the number of jobs queued from the store.
  Start {
    responder: oneshot::Sender<Result<usize, SchedulerError>>,
  },
  /// Remove a job from the queue and the store.
  RemoveJob {
    job_id: JobId,
    /// `Err(SchedulerError::JobNotFound)` if the store had no such record.
    responder: oneshot::Sender<Result<(), SchedulerError>>,
  },
  GetMetricsSnapshot {
    responder: oneshot::Sender<MetricsSnapshot>,
  },
}

/// A persisted job that should be (re)queued for `run_at`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StagedJob {
  pub job_id: JobId,
  pub run_at: DateTime<Utc>,
}

/// Represents the requested shutdown mode. Sent via a `watch` channel.
/// `None` indicates the scheduler is running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Wait for currently active jobs to complete before shutting down.
  Graceful,
  /// Stop processing as soon as possible, potentially interrupting active jobs.
  /// Interrupted jobs stay marked as running and are re-run on the next start.
  Force,
}

/// Message sent from a Worker back to the Coordinator after a job execution.
#[derive(Debug)]
pub(crate) enum WorkerOutcome {
  /// The job has another run scheduled.
  Reschedule {
    job_id: JobId,
    next_run_time: DateTime<Utc>,
  },
  /// The job has no further runs (one-shot finished, or removed while running).
  Complete { job_id: JobId, failed: bool },
}
