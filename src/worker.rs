use crate::command::{ShutdownMode, WorkerOutcome};
use crate::error::JobFailure;
use crate::job::store::JobStore;
use crate::job::{JobHandler, JobId, JobOutcome, JobRecord, WorkerId};
use crate::metrics::SchedulerMetrics;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use fibre::mpmc::AsyncReceiver;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn, Instrument};

/// Represents a worker task responsible for executing jobs.
///
/// Workers wait for claimed job records from the Coordinator via a shared channel,
/// run the named handler (catching panics), write the result back to the job store
/// and report the outcome to the Coordinator.
pub(crate) struct Worker {
  id: WorkerId,
  store: Arc<dyn JobStore>,
  handlers: Arc<RwLock<HashMap<String, JobHandler>>>,
  metrics: SchedulerMetrics,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
  job_dispatch_rx: AsyncReceiver<JobRecord>,
  active_workers_counter: Arc<AtomicUsize>,
}

impl Worker {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    id: WorkerId,
    store: Arc<dyn JobStore>,
    handlers: Arc<RwLock<HashMap<String, JobHandler>>>,
    metrics: SchedulerMetrics,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
    job_dispatch_rx: AsyncReceiver<JobRecord>,
    active_workers_counter: Arc<AtomicUsize>,
  ) -> Self {
    Self {
      id,
      store,
      handlers,
      metrics,
      shutdown_rx,
      worker_outcome_tx,
      job_dispatch_rx,
      active_workers_counter,
    }
  }

  /// Runs the main loop for the worker task.
  pub async fn run(&mut self) {
    info!(worker_id = self.id, "Worker started. Waiting for jobs...");

    loop {
      if let Some(mode) = self.shutdown_mode() {
        self.drain_dispatched(mode).await;
        break;
      }

      tokio::select! {
          biased;

          // --- Shutdown Check ---
          Ok(()) = self.shutdown_rx.changed() => {
              if let Some(mode) = self.shutdown_mode() {
                  info!(worker_id = self.id, ?mode, "Worker received shutdown signal.");
              }
              // The loop head handles draining and exit.
          }

          // --- Wait for Job Dispatch ---
          result = self.job_dispatch_rx.recv() => {
              match result {
                  Ok(record) => self.process(record).await,
                  Err(_) => {
                      if self.shutdown_mode().is_none() {
                          error!(worker_id = self.id, "Job dispatch channel closed unexpectedly. Worker exiting.");
                      } else {
                          info!(worker_id = self.id, "Job dispatch channel closed during shutdown. Worker exiting.");
                      }
                      break;
                  }
              }
          }
      }
    }

    info!(worker_id = self.id, "Worker task shutting down.");
  }

  fn shutdown_mode(&self) -> Option<ShutdownMode> {
    *self.shutdown_rx.borrow()
  }

  /// Handles records the Coordinator dispatched before the shutdown signal arrived.
  ///
  /// A graceful shutdown runs them; a forced one releases them untouched, leaving the
  /// stored records marked running so the next start recovers them.
  async fn drain_dispatched(&self, mode: ShutdownMode) {
    loop {
      let Ok(record) = self.job_dispatch_rx.try_recv() else {
        break;
      };
      match mode {
        ShutdownMode::Graceful => self.process(record).await,
        ShutdownMode::Force => {
          debug!(worker_id = self.id, job_id = %record.id, "Releasing undelivered dispatch on forced shutdown.");
          self.release_slot();
        }
      }
    }
  }

  async fn process(&self, record: JobRecord) {
    let job_id = record.id;
    debug!(worker_id = self.id, %job_id, job_name = %record.name, "Received job dispatch.");

    let job_span = tracing::span!(
      tracing::Level::INFO,
      "job_exec",
      worker_id = self.id,
      %job_id,
      job_name = record.name.as_str()
    );

    self.execute_and_handle(record).instrument(job_span).await;
  }

  /// Executes the job handler (handling panics) and then processes the result.
  async fn execute_and_handle(&self, record: JobRecord) {
    let job_id = record.id;
    let start = Instant::now();
    info!("Starting job execution.");

    let result = self.execute_job_logic(record).await;
    let duration = start.elapsed();
    self.metrics.job_execution_duration.record(duration);

    let outcome_str = match &result {
      Ok(()) => "Success",
      Err(_) => "Fail",
    };
    info!(
      duration_ms = duration.as_millis(),
      outcome = outcome_str,
      "Finished job execution."
    );

    let outcome = self.record_result(job_id, &result, Utc::now()).await;

    debug!(worker_id = self.id, %job_id, "Sending job outcome to coordinator.");
    if self.worker_outcome_tx.send(outcome).await.is_err() {
      warn!(
        worker_id = self.id,
        %job_id,
        "Failed to send job outcome to coordinator (scheduler likely shutdown)."
      );
    }

    // Decrement *after* the outcome is sent so the Coordinator never sees a free slot
    // before it knows about the reschedule.
    self.release_slot();
  }

  fn release_slot(&self) {
    let prev_count = self
      .active_workers_counter
      .fetch_sub(1, AtomicOrdering::Relaxed);
    let now_active = prev_count.saturating_sub(1);
    trace!(worker_id = self.id, active = now_active, "Decremented active worker count.");
    self
      .metrics
      .workers_active_current
      .store(now_active, AtomicOrdering::Relaxed);
  }

  /// Runs the handler in its own task so a panic is caught as a `JoinError`.
  async fn execute_job_logic(&self, record: JobRecord) -> JobOutcome {
    let handler = self.handlers.read().get(&record.name).cloned();
    let Some(handler) = handler else {
      // Checked at dispatch; only reachable if handlers change while running.
      self
        .metrics
        .jobs_missing_handler
        .fetch_add(1, AtomicOrdering::Relaxed);
      return Err(JobFailure::new(format!(
        "no handler defined for job '{}'",
        record.name
      )));
    };

    let task = tokio::spawn(handler(record));

    match task.await {
      Ok(Ok(())) => {
        self
          .metrics
          .jobs_executed_success
          .fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
      }
      Ok(Err(failure)) => {
        warn!(reason = %failure, "Job handler reported failure.");
        self
          .metrics
          .jobs_executed_fail
          .fetch_add(1, AtomicOrdering::Relaxed);
        Err(failure)
      }
      Err(join_error) => {
        if join_error.is_panic() {
          error!("Job handler panicked!");
          self
            .metrics
            .jobs_panicked
            .fetch_add(1, AtomicOrdering::Relaxed);
          Err(JobFailure::new("job handler panicked"))
        } else {
          warn!("Job task was cancelled during execution.");
          self
            .metrics
            .jobs_executed_fail
            .fetch_add(1, AtomicOrdering::Relaxed);
          Err(JobFailure::new("job task was cancelled"))
        }
      }
    }
  }

  /// Writes the run result to the stored record and decides the Coordinator outcome.
  ///
  /// The record is re-read so changes made while the job ran (a new schedule, or
  /// removal) are respected.
  async fn record_result(
    &self,
    job_id: JobId,
    result: &JobOutcome,
    finished_at: DateTime<Utc>,
  ) -> WorkerOutcome {
    let failed = result.is_err();

    let mut record = match self.store.get(job_id).await {
      Ok(Some(record)) => record,
      Ok(None) => {
        debug!(worker_id = self.id, %job_id, "Job was removed while running.");
        return WorkerOutcome::Complete { job_id, failed };
      }
      Err(e) => {
        error!(
          worker_id = self.id,
          %job_id,
          error = %e,
          "Failed to load job after execution; it stays marked running until the next start."
        );
        return WorkerOutcome::Complete { job_id, failed };
      }
    };

    record.running = false;
    record.last_finished_at = Some(finished_at);
    match result {
      Ok(()) => {
        record.failed_at = None;
        record.fail_reason = None;
      }
      Err(failure) => {
        record.failed_at = Some(finished_at);
        record.fail_reason = Some(failure.reason.clone());
        record.fail_count += 1;
      }
    }
    record.next_run_at = record.schedule.calculate_next_run(finished_at);

    if let Err(e) = self.store.save(&record).await {
      error!(worker_id = self.id, %job_id, error = %e, "Failed to persist job result.");
    }

    match record.next_run_at {
      Some(next_run_time) => {
        debug!(worker_id = self.id, %job_id, next_run = %next_run_time, "Scheduling next run.");
        WorkerOutcome::Reschedule {
          job_id,
          next_run_time,
        }
      }
      None => {
        debug!(worker_id = self.id, %job_id, "Job has no further scheduled runs.");
        WorkerOutcome::Complete { job_id, failed }
      }
    }
  }
}
