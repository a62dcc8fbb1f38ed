use crate::command::{CoordinatorCommand, ShutdownMode, StagedJob, WorkerOutcome};
use crate::error::SchedulerError;
use crate::job::store::JobStore;
use crate::job::{JobHandler, JobId, JobRecord};
use crate::metrics::SchedulerMetrics;

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fibre::mpmc::AsyncSender;
use parking_lot::RwLock;
use priority_queue::PriorityQueue;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

/// Delay before a job whose record could not be read or written is tried again.
const STORE_RETRY_DELAY_SECS: i64 = 5;

/// Sleep used when nothing can be dispatched until a message arrives.
const IDLE_SLEEP: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// Internal state owned by the Coordinator task.
pub(crate) struct CoordinatorState {
  // Receivers
  staging_rx: mpsc::Receiver<StagedJob>,
  cmd_rx: mpsc::Receiver<CoordinatorCommand>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  worker_outcome_rx: mpsc::Receiver<WorkerOutcome>,
  // Sender
  job_dispatch_tx: AsyncSender<JobRecord>,
  // Shared
  store: Arc<dyn JobStore>,
  handlers: Arc<RwLock<HashMap<String, JobHandler>>>,
  // Metrics & Counters
  metrics: SchedulerMetrics,
  active_workers_counter: Arc<AtomicUsize>,
  max_workers: usize,
}

impl CoordinatorState {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    staging_rx: mpsc::Receiver<StagedJob>,
    cmd_rx: mpsc::Receiver<CoordinatorCommand>,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    worker_outcome_rx: mpsc::Receiver<WorkerOutcome>,
    job_dispatch_tx: AsyncSender<JobRecord>,
    store: Arc<dyn JobStore>,
    handlers: Arc<RwLock<HashMap<String, JobHandler>>>,
    metrics: SchedulerMetrics,
    active_workers_counter: Arc<AtomicUsize>,
    max_workers: usize,
  ) -> Self {
    Self {
      staging_rx,
      cmd_rx,
      shutdown_rx,
      worker_outcome_rx,
      job_dispatch_tx,
      store,
      handlers,
      metrics,
      active_workers_counter,
      max_workers,
    }
  }
}

/// The central Coordinator task.
///
/// Owns the due-time queue. Job state itself lives in the store: the queue only says
/// which record to look at next, and every dispatch re-reads the record first.
pub(crate) struct Coordinator {
  state: CoordinatorState,
  pq: PriorityQueue<JobId, Reverse<DateTime<Utc>>>,
  /// Jobs handed to a worker whose outcome has not arrived yet.
  running: HashSet<JobId>,
  /// Dispatch is paused until the `Start` command loads persisted jobs.
  started: bool,
  next_wakeup_timer: Option<tokio::time::Instant>,
  shutting_down: Option<ShutdownMode>,
  /// Every scheduler handle was dropped.
  commands_closed: bool,
}

impl Coordinator {
  pub fn new(state: CoordinatorState) -> Self {
    Self {
      state,
      pq: PriorityQueue::new(),
      running: HashSet::new(),
      started: false,
      next_wakeup_timer: None,
      shutting_down: None,
      commands_closed: false,
    }
  }

  /// Runs the main event loop for the Coordinator.
  pub async fn run(&mut self) {
    info!("Coordinator started.");

    loop {
      self.try_dispatch_jobs().await;
      self.update_gauge_metrics();
      let sleep_duration = self.calculate_sleep();

      // --- Main Event Loop ---
      tokio::select! {
          biased;

          // --- Shutdown Check ---
          Ok(()) = self.state.shutdown_rx.changed() => {
              let shutdown_mode_opt = *self.state.shutdown_rx.borrow();
              if shutdown_mode_opt != self.shutting_down {
                  if let Some(mode) = shutdown_mode_opt {
                      self.shutting_down = Some(mode);
                      info!(?mode, "Coordinator received shutdown signal.");

                      // Stop accepting new work; commands and outcomes of running jobs stay open.
                      self.state.staging_rx.close();

                      if mode == ShutdownMode::Force {
                          info!("Forced shutdown initiated, coordinator loop breaking.");
                          break;
                      }
                  } else {
                      warn!("Shutdown signal unexpectedly cleared. Resuming normal operation.");
                      self.shutting_down = None;
                  }
              }
          },

          // --- Staging Queue Processing ---
          maybe_job = self.state.staging_rx.recv(), if self.shutting_down.is_none() => {
              if let Some(staged) = maybe_job {
                  self.handle_staged_job(staged);
              } else {
                  trace!("Staging channel closed (expected during shutdown or handle drop).");
              }
          },

          // --- Command Processing ---
          // Always process commands, even during graceful shutdown
          maybe_cmd = self.state.cmd_rx.recv(), if !self.commands_closed => {
              if let Some(cmd) = maybe_cmd {
                  self.handle_command(cmd).await;
              } else {
                  self.commands_closed = true;
              }
              if self.commands_closed && self.shutting_down.is_none() {
                  warn!("Command channel closed unexpectedly. Initiating graceful shutdown.");
                  self.shutting_down = Some(ShutdownMode::Graceful);
                  self.state.staging_rx.close();
              }
          },

          // --- Worker Outcome Processing ---
          maybe_outcome = self.state.worker_outcome_rx.recv(), if self.shutting_down != Some(ShutdownMode::Force) => {
              if let Some(outcome) = maybe_outcome {
                  trace!("Received worker outcome: {:?}", outcome);
                  self.handle_worker_outcome(outcome);
              } else if self.shutting_down.is_none() {
                  error!("Worker outcome channel closed unexpectedly!");
              }
          },

          // --- Timer Wakeup ---
          _ = sleep(sleep_duration), if self.shutting_down != Some(ShutdownMode::Force) => {
              trace!("Timer fired.");
          }
      }

      // --- Post-Select Shutdown Logic ---
      if self.shutting_down == Some(ShutdownMode::Graceful) {
        let active_count = self
          .state
          .active_workers_counter
          .load(AtomicOrdering::Relaxed);
        if active_count == 0 {
          info!(
            "Graceful shutdown: All workers idle ({}/{} active). Coordinator exiting.",
            active_count, self.state.max_workers
          );
          break;
        }
        trace!(
          active_workers = active_count,
          "Graceful shutdown: Waiting for active workers."
        );
      }
    }

    info!("Coordinator task shutting down.");
    // Dropping `self` drops the dispatch sender, which releases idle workers.
  }

  fn update_gauge_metrics(&self) {
    self
      .state
      .metrics
      .job_queue_scheduled_current
      .store(self.pq.len(), AtomicOrdering::Relaxed);
    self.state.metrics.workers_active_current.store(
      self
        .state
        .active_workers_counter
        .load(AtomicOrdering::Relaxed),
      AtomicOrdering::Relaxed,
    );
  }

  /// Queues a job submitted (or rescheduled) through the handle.
  fn handle_staged_job(&mut self, staged: StagedJob) {
    let StagedJob { job_id, run_at } = staged;
    if self.running.contains(&job_id) {
      // The worker computes the next run from the stored record when it finishes.
      debug!(%job_id, "Staged job is running; deferring to its outcome.");
      return;
    }
    self.pq.push(job_id, Reverse(run_at));
    trace!(%job_id, %run_at, "Queued job.");
    self.try_wake_timer();
  }

  /// Handles incoming commands from the scheduler handle.
  async fn handle_command(&mut self, cmd: CoordinatorCommand) {
    match cmd {
      CoordinatorCommand::Start { responder } => {
        let result = self.load_persisted_jobs().await;
        let _ = responder.send(result);
      }
      CoordinatorCommand::RemoveJob { job_id, responder } => {
        if self.pq.remove(&job_id).is_some() {
          trace!(%job_id, "Removed job from the queue.");
          self.try_wake_timer();
        }
        let response = match self.state.store.remove(job_id).await {
          Ok(true) => {
            self
              .state
              .metrics
              .jobs_removed
              .fetch_add(1, AtomicOrdering::Relaxed);
            info!(%job_id, "Removed job.");
            Ok(())
          }
          Ok(false) => Err(SchedulerError::JobNotFound(job_id)),
          Err(e) => Err(e.into()),
        };
        let _ = responder.send(response);
      }
      CoordinatorCommand::GetMetricsSnapshot { responder } => {
        self.update_gauge_metrics();
        let _ = responder.send(self.state.metrics.snapshot());
      }
    }
  }

  /// Queues every persisted job with a pending run and enables dispatch.
  ///
  /// A record still marked `running` belongs to a run that never reported back (the
  /// process stopped mid-job); it is queued to run again immediately.
  async fn load_persisted_jobs(&mut self) -> Result<usize, SchedulerError> {
    if self.started {
      return Err(SchedulerError::AlreadyStarted);
    }

    let records = self.state.store.load_all().await?;
    let now = Utc::now();
    let mut queued = 0;
    for record in records {
      if record.running {
        warn!(job_id = %record.id, job_name = %record.name, "Recovering job interrupted mid-run.");
        self
          .state
          .metrics
          .jobs_recovered
          .fetch_add(1, AtomicOrdering::Relaxed);
        self.pq.push(record.id, Reverse(now));
        queued += 1;
      } else if let Some(next_run_at) = record.next_run_at {
        self.pq.push(record.id, Reverse(next_run_at));
        queued += 1;
      }
    }

    self.started = true;
    self.try_wake_timer();
    info!(queued, "Scheduler started; persisted jobs loaded.");
    Ok(queued)
  }

  /// Handles outcomes reported by workers after job execution.
  fn handle_worker_outcome(&mut self, outcome: WorkerOutcome) {
    match outcome {
      WorkerOutcome::Reschedule {
        job_id,
        next_run_time,
      } => {
        self.running.remove(&job_id);
        self.pq.push(job_id, Reverse(next_run_time));
        debug!(%job_id, next_run = %next_run_time, "Rescheduled job.");
        self.try_wake_timer();
      }
      WorkerOutcome::Complete { job_id, failed } => {
        self.running.remove(&job_id);
        debug!(%job_id, failed, "Job complete (no more runs scheduled).");
      }
    }
  }

  /// Dispatches every due job while workers are available.
  async fn try_dispatch_jobs(&mut self) {
    if !self.started || self.shutting_down.is_some() {
      return;
    }

    let now = Utc::now();
    loop {
      let active_workers = self
        .state
        .active_workers_counter
        .load(AtomicOrdering::Relaxed);
      if active_workers >= self.state.max_workers {
        trace!(
          "Dispatch check: All workers busy ({}/{})",
          active_workers,
          self.state.max_workers
        );
        break;
      }

      let Some((job_id, run_at)) = self.pq.peek().map(|(id, Reverse(at))| (*id, *at)) else {
        trace!("Dispatch check: queue is empty.");
        break;
      };
      if run_at > now {
        trace!("Dispatch check: next job is in the future.");
        break;
      }
      self.pq.pop();

      let Some(record) = self.claim(job_id, now).await else {
        continue;
      };

      // --- Attempt Dispatch via Channel ---
      let prev_active = self
        .state
        .active_workers_counter
        .fetch_add(1, AtomicOrdering::Relaxed);
      self
        .state
        .metrics
        .workers_active_current
        .store(prev_active + 1, AtomicOrdering::Relaxed);
      self.running.insert(job_id);

      trace!(%job_id, "Attempting dispatch via channel.");
      if let Err(e) = self.state.job_dispatch_tx.send(record).await {
        // The record stays marked running, so the next start recovers it.
        error!(%job_id, "Failed to send job dispatch, channel closed? {:?}", e);
        let prev = self
          .state
          .active_workers_counter
          .fetch_sub(1, AtomicOrdering::Relaxed);
        self
          .state
          .metrics
          .workers_active_current
          .store(prev.saturating_sub(1), AtomicOrdering::Relaxed);
        self.running.remove(&job_id);
        break;
      }
    }

    self.try_wake_timer();
  }

  /// Loads a due job and marks it running in the store.
  ///
  /// Returns `None` when the queue entry is stale (job removed, finished or moved to a
  /// later time), when no handler exists, or when the store fails (retried later).
  async fn claim(&mut self, job_id: JobId, now: DateTime<Utc>) -> Option<JobRecord> {
    let retry_at = now + ChronoDuration::seconds(STORE_RETRY_DELAY_SECS);

    let mut record = match self.state.store.get(job_id).await {
      Ok(Some(record)) => record,
      Ok(None) => {
        debug!(%job_id, "Queued job no longer exists, discarding.");
        return None;
      }
      Err(e) => {
        error!(%job_id, error = %e, "Failed to load queued job; retrying later.");
        self.pq.push(job_id, Reverse(retry_at));
        return None;
      }
    };

    if !record.running {
      match record.next_run_at {
        None => {
          debug!(%job_id, "Queued job has no pending run, discarding.");
          return None;
        }
        Some(next_run_at) if next_run_at > now => {
          self.pq.push(job_id, Reverse(next_run_at));
          return None;
        }
        Some(_) => {}
      }
    }

    if !self.state.handlers.read().contains_key(&record.name) {
      warn!(%job_id, job_name = %record.name, "No handler defined for job, marking failed.");
      self
        .state
        .metrics
        .jobs_missing_handler
        .fetch_add(1, AtomicOrdering::Relaxed);
      record.running = false;
      record.next_run_at = None;
      record.failed_at = Some(now);
      record.fail_reason = Some(format!("no handler defined for job '{}'", record.name));
      record.fail_count += 1;
      if let Err(e) = self.state.store.save(&record).await {
        error!(%job_id, error = %e, "Failed to record missing handler.");
      }
      return None;
    }

    record.running = true;
    record.last_run_at = Some(now);
    record.run_count += 1;
    if let Err(e) = self.state.store.save(&record).await {
      error!(%job_id, error = %e, "Failed to mark job as running; retrying later.");
      self.pq.push(job_id, Reverse(retry_at));
      return None;
    }
    Some(record)
  }

  /// Calculates the duration to sleep until the next job is ready.
  fn calculate_sleep(&mut self) -> Duration {
    if self.shutting_down.is_some() {
      return Duration::from_millis(50);
    }

    let active_workers = self
      .state
      .active_workers_counter
      .load(AtomicOrdering::Relaxed);
    if !self.started || active_workers >= self.state.max_workers {
      // A command or worker outcome wakes the loop.
      return IDLE_SLEEP;
    }

    if let Some(wakeup_inst) = self.next_wakeup_timer {
      let now = tokio::time::Instant::now();
      if wakeup_inst > now {
        return wakeup_inst.duration_since(now);
      }
    }

    match self.pq.peek() {
      Some((_, Reverse(next_run_dt))) => {
        let now_utc = Utc::now();
        let final_duration = (*next_run_dt - now_utc)
          .to_std()
          .unwrap_or(Duration::ZERO)
          .max(Duration::from_millis(1));
        self.next_wakeup_timer = Some(tokio::time::Instant::now() + final_duration);
        trace!(next_run = %next_run_dt, sleep_duration = ?final_duration, "Calculated next timer wakeup.");
        final_duration
      }
      None => {
        self.next_wakeup_timer = None;
        IDLE_SLEEP
      }
    }
  }

  /// Clears the cached `next_wakeup_timer` forcing recalculation on the next loop.
  fn try_wake_timer(&mut self) {
    self.next_wakeup_timer = None;
  }
}
