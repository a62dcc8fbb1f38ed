use crate::command::{CoordinatorCommand, ShutdownMode, StagedJob, WorkerOutcome};
use crate::coordinator::{Coordinator, CoordinatorState};
use crate::error::{BuildError, SchedulerError, ShutdownError};
use crate::job::store::{JobStore, MemoryJobStore};
use crate::job::{JobFuture, JobHandler, JobId, JobOutcome, JobRecord, Schedule};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::worker::Worker;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fibre::{mpmc, oneshot};
use futures::future::try_join_all;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_CHANNEL_BOUND: usize = 128; // For staging and command channels
const DEFAULT_JOB_DISPATCH_BOUND: usize = 1; // For coordinator -> worker job dispatch

/// Builder for configuring and creating a [`JobScheduler`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use vlive_keeper::{JobScheduler, MemoryJobStore};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = JobScheduler::builder()
///     .max_workers(4)
///     .store(Arc::new(MemoryJobStore::new()))
///     .build()?;
/// scheduler.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  max_workers: Option<usize>,
  store: Option<Arc<dyn JobStore>>,
  staging_buffer_size: usize,
  command_buffer_size: usize,
  job_dispatch_buffer_size: usize,
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      max_workers: None,
      store: None,
      staging_buffer_size: DEFAULT_CHANNEL_BOUND,
      command_buffer_size: DEFAULT_CHANNEL_BOUND,
      job_dispatch_buffer_size: DEFAULT_JOB_DISPATCH_BOUND,
    }
  }
}

impl fmt::Debug for SchedulerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchedulerBuilder")
      .field("max_workers", &self.max_workers)
      .field("has_store", &self.store.is_some())
      .field("staging_buffer_size", &self.staging_buffer_size)
      .field("command_buffer_size", &self.command_buffer_size)
      .field("job_dispatch_buffer_size", &self.job_dispatch_buffer_size)
      .finish()
  }
}

impl SchedulerBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the maximum number of jobs that can run concurrently (required, non-zero).
  pub fn max_workers(mut self, count: usize) -> Self {
    self.max_workers = Some(count);
    self
  }

  /// Sets the backing job store. Defaults to a volatile [`MemoryJobStore`].
  pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Sets the size of the internal buffer for staging newly submitted jobs.
  pub fn staging_buffer_size(mut self, size: usize) -> Self {
    self.staging_buffer_size = size.max(1);
    self
  }

  /// Sets the size of the internal buffer for commands.
  pub fn command_buffer_size(mut self, size: usize) -> Self {
    self.command_buffer_size = size.max(1);
    self
  }

  /// Sets the size of the channel used to dispatch claimed jobs to idle workers.
  /// A size of 1 (default) makes the coordinator wait until a worker picks the job up.
  pub fn job_dispatch_buffer_size(mut self, size: usize) -> Self {
    self.job_dispatch_buffer_size = size.max(1);
    self
  }

  /// Builds the scheduler, spawning the Coordinator task and the pool of Worker tasks.
  ///
  /// Must be called from within a Tokio runtime. Jobs are not dispatched until
  /// [`JobScheduler::start`] is called.
  ///
  /// # Errors
  ///
  /// Returns `Err(BuildError::MissingOrZeroMaxWorkers)` if `max_workers` was not set or
  /// is zero.
  pub fn build(self) -> Result<JobScheduler, BuildError> {
    let max_workers = self
      .max_workers
      .filter(|count| *count > 0)
      .ok_or(BuildError::MissingOrZeroMaxWorkers)?;

    let store = match self.store {
      Some(store) => store,
      None => {
        warn!("No job store configured; using an in-memory store. Jobs will not survive a restart.");
        Arc::new(MemoryJobStore::new())
      }
    };

    // --- Initialize Shared State & Channels ---
    let metrics = SchedulerMetrics::new();
    let handlers: Arc<RwLock<HashMap<String, JobHandler>>> = Arc::new(RwLock::new(HashMap::new()));
    let active_workers_counter = Arc::new(AtomicUsize::new(0));

    let (staging_tx, staging_rx) = mpsc::channel::<StagedJob>(self.staging_buffer_size);
    let (cmd_tx, cmd_rx) = mpsc::channel::<CoordinatorCommand>(self.command_buffer_size);
    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    let (job_dispatch_tx, job_dispatch_rx) = mpmc::bounded_async::<JobRecord>(self.job_dispatch_buffer_size);
    let (worker_outcome_tx, worker_outcome_rx) = mpsc::channel::<WorkerOutcome>(self.command_buffer_size);

    // --- Spawn Coordinator ---
    let coordinator_state = CoordinatorState::new(
      staging_rx,
      cmd_rx,
      shutdown_rx.clone(),
      worker_outcome_rx,
      job_dispatch_tx,
      store.clone(),
      handlers.clone(),
      metrics.clone(),
      active_workers_counter.clone(),
      max_workers,
    );

    let coordinator_handle = Handle::current().spawn(async move {
      let mut coordinator = Coordinator::new(coordinator_state);
      coordinator.run().await;
      info!("Coordinator task finished.");
    });

    // --- Spawn Workers ---
    let mut worker_handles = Vec::with_capacity(max_workers);
    for worker_id in 0..max_workers {
      let mut worker = Worker::new(
        worker_id,
        store.clone(),
        handlers.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
        worker_outcome_tx.clone(),
        job_dispatch_rx.clone(),
        active_workers_counter.clone(),
      );
      let handle = Handle::current().spawn(async move {
        worker.run().await;
      });
      worker_handles.push(handle);
    }
    // Drop the original outcome sender, workers hold the clones
    drop(worker_outcome_tx);

    Ok(JobScheduler {
      store,
      handlers,
      metrics,
      staging_tx,
      cmd_tx,
      shutdown_tx: Arc::new(shutdown_tx),
      coordinator_handle: Arc::new(Mutex::new(Some(coordinator_handle))),
      worker_handles: Arc::new(Mutex::new(worker_handles)),
    })
  }
}

/// Durable, named-job scheduler.
///
/// Job state lives in the [`JobStore`]; the scheduler is a cheap, cloneable handle to
/// the Coordinator and worker tasks. Handlers are registered by name with
/// [`define`](Self::define), and persisted jobs refer to their handler by that name,
/// so they can be picked up again after a restart.
#[derive(Clone)]
pub struct JobScheduler {
  store: Arc<dyn JobStore>,
  handlers: Arc<RwLock<HashMap<String, JobHandler>>>,
  metrics: SchedulerMetrics,
  // Channels for interacting with the Coordinator
  staging_tx: mpsc::Sender<StagedJob>,
  cmd_tx: mpsc::Sender<CoordinatorCommand>,
  shutdown_tx: Arc<watch::Sender<Option<ShutdownMode>>>,
  // Task handles for shutdown
  coordinator_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
  worker_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl fmt::Debug for JobScheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobScheduler")
      .field("handlers", &self.handlers.read().keys().collect::<Vec<_>>())
      .field("metrics", &self.metrics)
      .finish_non_exhaustive()
  }
}

impl JobScheduler {
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  /// Registers (or replaces) the handler for jobs named `name`.
  ///
  /// Handlers should be defined before [`start`](Self::start); a due job whose name has
  /// no handler is marked failed.
  pub fn define<F, Fut>(&self, name: impl Into<String>, handler: F)
  where
    F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
  {
    let name = name.into();
    let handler: JobHandler = Arc::new(move |record: JobRecord| -> JobFuture { Box::pin(handler(record)) });
    if self.handlers.write().insert(name.clone(), handler).is_some() {
      debug!(job_name = %name, "Replaced job handler.");
    } else {
      debug!(job_name = %name, "Defined job handler.");
    }
  }

  /// Loads persisted jobs and begins dispatching. Returns the number of jobs queued.
  ///
  /// Jobs left marked running by an interrupted process are queued to run immediately.
  ///
  /// # Errors
  ///
  /// - [`SchedulerError::AlreadyStarted`] on a second call.
  /// - [`SchedulerError::Store`] if the store could not be read.
  pub async fn start(&self) -> Result<usize, SchedulerError> {
    let (responder, response_rx) = oneshot::oneshot();
    self.send_command(CoordinatorCommand::Start { responder }).await?;
    response_rx.recv().await.map_err(|_| SchedulerError::ResponseFailed)?
  }

  /// Creates a one-shot job due at `run_at`.
  pub async fn schedule_at(
    &self,
    run_at: DateTime<Utc>,
    name: impl Into<String>,
    data: serde_json::Value,
  ) -> Result<JobId, SchedulerError> {
    let record = JobRecord::once(name, run_at, data);
    let job_id = record.id;
    self.submit(record).await?;
    Ok(job_id)
  }

  /// Creates a one-shot job due at `run_at` unless a job with `unique_key` already exists.
  ///
  /// Returns `None` when the key is taken.
  pub async fn schedule_unique(
    &self,
    run_at: DateTime<Utc>,
    name: impl Into<String>,
    data: serde_json::Value,
    unique_key: impl Into<String>,
  ) -> Result<Option<JobId>, SchedulerError> {
    let record = JobRecord::once(name, run_at, data).with_unique_key(unique_key);
    let job_id = record.id;
    if self.submit(record).await? {
      Ok(Some(job_id))
    } else {
      Ok(None)
    }
  }

  /// Creates a one-shot job due immediately.
  pub async fn run_now(&self, name: impl Into<String>) -> Result<JobId, SchedulerError> {
    self
      .schedule_at(Utc::now(), name, serde_json::Value::Null)
      .await
  }

  /// Ensures a single recurring job named `name` runs every `interval`.
  ///
  /// The first run is one interval from now. If a recurring job with this name already
  /// exists its interval is updated instead of creating another.
  ///
  /// # Errors
  ///
  /// - [`SchedulerError::InvalidInterval`] for a zero interval.
  pub async fn run_every(&self, interval: Duration, name: impl Into<String>) -> Result<JobId, SchedulerError> {
    let name = name.into();
    let fresh = JobRecord::every(name.clone(), interval)?;

    let existing = self
      .store
      .find_by_name(&name)
      .await?
      .into_iter()
      .find(|record| matches!(record.schedule, Schedule::Every(_)));

    let Some(mut record) = existing else {
      let job_id = fresh.id;
      self.submit(fresh).await?;
      info!(job_name = %name, ?interval, %job_id, "Created recurring job.");
      return Ok(job_id);
    };

    let unchanged = record.schedule == fresh.schedule && record.next_run_at.is_some();
    if unchanged {
      debug!(job_name = %name, job_id = %record.id, "Recurring job already scheduled.");
      return Ok(record.id);
    }

    record.schedule = fresh.schedule;
    record.next_run_at = fresh.next_run_at;
    self.store.save(&record).await?;
    if let Some(run_at) = record.next_run_at {
      self.stage(record.id, run_at).await?;
    }
    info!(job_name = %name, ?interval, job_id = %record.id, "Updated recurring job.");
    Ok(record.id)
  }

  pub async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, SchedulerError> {
    Ok(self.store.get(job_id).await?)
  }

  /// Jobs named `name` for which `predicate` holds.
  pub async fn find_jobs<P>(&self, name: &str, predicate: P) -> Result<Vec<JobRecord>, SchedulerError>
  where
    P: Fn(&JobRecord) -> bool,
  {
    let records = self.store.find_by_name(name).await?;
    Ok(records.into_iter().filter(|record| predicate(record)).collect())
  }

  /// Deletes a job from the store and the schedule.
  ///
  /// A run already in progress is not interrupted, but its result is discarded.
  ///
  /// # Errors
  ///
  /// - [`SchedulerError::JobNotFound`]: no job with the given id exists.
  pub async fn remove_job(&self, job_id: JobId) -> Result<(), SchedulerError> {
    let (responder, response_rx) = oneshot::oneshot();
    self
      .send_command(CoordinatorCommand::RemoveJob { job_id, responder })
      .await?;
    response_rx.recv().await.map_err(|_| SchedulerError::ResponseFailed)?
  }

  pub async fn get_metrics_snapshot(&self) -> Result<MetricsSnapshot, SchedulerError> {
    let (responder, response_rx) = oneshot::oneshot();
    self
      .send_command(CoordinatorCommand::GetMetricsSnapshot { responder })
      .await?;
    response_rx.recv().await.map_err(|_| SchedulerError::ResponseFailed)
  }

  /// Persists a new record and queues it. Returns `false` if the store rejected it as a
  /// duplicate.
  async fn submit(&self, record: JobRecord) -> Result<bool, SchedulerError> {
    if !self.store.insert(&record).await? {
      self
        .metrics
        .jobs_deduplicated
        .fetch_add(1, AtomicOrdering::Relaxed);
      debug!(job_name = %record.name, unique_key = ?record.unique_key, "Skipped duplicate job.");
      return Ok(false);
    }
    self
      .metrics
      .jobs_submitted
      .fetch_add(1, AtomicOrdering::Relaxed);

    if let Some(run_at) = record.next_run_at {
      self.stage(record.id, run_at).await?;
    }
    debug!(job_id = %record.id, job_name = %record.name, next_run = ?record.next_run_at, "Submitted job.");
    Ok(true)
  }

  async fn stage(&self, job_id: JobId, run_at: DateTime<Utc>) -> Result<(), SchedulerError> {
    self
      .staging_tx
      .send(StagedJob { job_id, run_at })
      .await
      .map_err(|_| SchedulerError::SchedulerShutdown)
  }

  async fn send_command(&self, cmd: CoordinatorCommand) -> Result<(), SchedulerError> {
    self
      .cmd_tx
      .send(cmd)
      .await
      .map_err(|_| SchedulerError::SchedulerShutdown)
  }

  /// Initiates a graceful shutdown.
  ///
  /// Stops dispatching, lets running jobs finish, then waits for the Coordinator and
  /// Worker tasks to exit or until `timeout` elapses.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::SignalFailed`]: Failed to send the shutdown signal.
  /// - [`ShutdownError::Timeout`]: Waiting for tasks exceeded the timeout.
  /// - [`ShutdownError::TaskPanic`]: A worker or coordinator task panicked.
  pub async fn shutdown_graceful(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating graceful shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Graceful))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  /// Initiates a forced shutdown.
  ///
  /// The Coordinator stops immediately. Jobs already running are not awaited by the
  /// Coordinator; their records stay marked running and are re-run on the next start.
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating forced shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Force))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  /// Helper to wait for task handles during shutdown.
  async fn await_shutdown(&self, timeout_duration: Option<Duration>) -> Result<(), ShutdownError> {
    let coordinator_handle_opt = self.coordinator_handle.lock().await.take();
    let worker_handles = {
      let mut guard = self.worker_handles.lock().await;
      std::mem::take(&mut *guard)
    };

    let mut tasks = Vec::with_capacity(1 + worker_handles.len());
    if let Some(coord_handle) = coordinator_handle_opt {
      tasks.push(tokio::spawn(async move {
        coord_handle.await.map_err(|e| {
          error!("Coordinator task panicked: {:?}", e);
          ShutdownError::TaskPanic
        })
      }));
    } else {
      warn!("Coordinator handle missing during shutdown wait.");
    }

    for (i, handle) in worker_handles.into_iter().enumerate() {
      tasks.push(tokio::spawn(async move {
        handle.await.map_err(|e| {
          error!(worker_id = i, "Worker task panicked: {:?}", e);
          ShutdownError::TaskPanic
        })
      }));
    }

    if tasks.is_empty() {
      warn!("No tasks found to await during shutdown.");
      return Ok(());
    }

    let join_all_fut = async {
      let results = try_join_all(tasks).await.map_err(|join_err| {
        error!("A shutdown wait task failed: {:?}", join_err);
        ShutdownError::TaskPanic
      })?;
      results.into_iter().collect::<Result<Vec<()>, ShutdownError>>()
    };

    let result = match timeout_duration {
      Some(timeout) => match tokio::time::timeout(timeout, join_all_fut).await {
        Ok(joined) => joined.map(|_| ()),
        Err(_) => {
          error!("Shutdown timed out after {:?}", timeout);
          Err(ShutdownError::Timeout)
        }
      },
      None => join_all_fut.await.map(|_| ()),
    };

    if result.is_ok() {
      info!("All tasks joined successfully.");
    } else {
      error!("Error during shutdown task joining: {:?}", result);
    }
    result
  }
}
