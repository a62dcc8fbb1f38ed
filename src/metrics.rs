use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without detailed percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Gets the total sum of durations recorded (in microseconds).
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Scheduler metrics backed by atomic counters.
///
/// Cloning only clones the `Arc`s, so the handle, the coordinator and every worker
/// update the same values.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
  // --- Counters (Monotonically increasing) ---
  /// Job records accepted by `schedule_*`, `run_now` and `run_every`.
  pub jobs_submitted: Arc<AtomicUsize>,
  /// Submissions skipped because their unique key already existed.
  pub jobs_deduplicated: Arc<AtomicUsize>,
  /// Executions whose handler returned `Ok`.
  pub jobs_executed_success: Arc<AtomicUsize>,
  /// Executions whose handler returned a `JobFailure`.
  pub jobs_executed_fail: Arc<AtomicUsize>,
  /// Executions whose handler panicked.
  pub jobs_panicked: Arc<AtomicUsize>,
  /// Jobs dispatched without a defined handler.
  pub jobs_missing_handler: Arc<AtomicUsize>,
  /// Jobs found mid-run on start and queued again.
  pub jobs_recovered: Arc<AtomicUsize>,
  /// Jobs deleted through `remove_job`.
  pub jobs_removed: Arc<AtomicUsize>,

  // --- Gauges (Current state values) ---
  /// Current number of jobs waiting in the priority queue.
  pub job_queue_scheduled_current: Arc<AtomicUsize>,
  /// Current number of workers actively executing a job.
  pub workers_active_current: Arc<AtomicUsize>,

  // --- Histograms/Summaries ---
  pub job_execution_duration: Arc<SimpleHistogram>,
}

impl SchedulerMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a point-in-time snapshot of the metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      jobs_submitted: self.jobs_submitted.load(order),
      jobs_deduplicated: self.jobs_deduplicated.load(order),
      jobs_executed_success: self.jobs_executed_success.load(order),
      jobs_executed_fail: self.jobs_executed_fail.load(order),
      jobs_panicked: self.jobs_panicked.load(order),
      jobs_missing_handler: self.jobs_missing_handler.load(order),
      jobs_recovered: self.jobs_recovered.load(order),
      jobs_removed: self.jobs_removed.load(order),
      job_queue_scheduled_current: self.job_queue_scheduled_current.load(order),
      workers_active_current: self.workers_active_current.load(order),
      job_execution_duration_count: self.job_execution_duration.get_count(),
      job_execution_duration_sum_micros: self.job_execution_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of the scheduler's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
  // Counters
  pub jobs_submitted: usize,
  pub jobs_deduplicated: usize,
  pub jobs_executed_success: usize,
  pub jobs_executed_fail: usize,
  pub jobs_panicked: usize,
  pub jobs_missing_handler: usize,
  pub jobs_recovered: usize,
  pub jobs_removed: usize,
  // Gauges
  pub job_queue_scheduled_current: usize,
  pub workers_active_current: usize,
  // Histogram Data
  pub job_execution_duration_count: usize,
  pub job_execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean job execution duration, `None` if no job has finished yet.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    if self.job_execution_duration_count == 0 {
      None
    } else {
      let micros = self.job_execution_duration_sum_micros / self.job_execution_duration_count;
      Some(Duration::from_micros(micros as u64))
    }
  }
}
