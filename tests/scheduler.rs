//! tests/scheduler.rs
//! Durable job scheduler: execution, recurrence, persistence, recovery and shutdown.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use crate::common::{memory_job_store, setup_tracing, started_scheduler, wait_until};
use vlive_keeper::{
  BuildError, Database, JobFailure, JobId, JobRecord, JobScheduler, JobStore, Schedule, SchedulerError,
  SqliteJobStore,
};

const WAIT: StdDuration = StdDuration::from_secs(5);

/// Defines `name` with a handler that counts its runs.
fn counting(scheduler: &JobScheduler, name: &str) -> Arc<AtomicUsize> {
  let runs = Arc::new(AtomicUsize::new(0));
  let counter = runs.clone();
  scheduler.define(name, move |_record| {
    let counter = counter.clone();
    async move {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  });
  runs
}

/// Polls the stored record until `check` holds.
async fn wait_for_record<F>(scheduler: &JobScheduler, job_id: JobId, check: F) -> JobRecord
where
  F: Fn(&JobRecord) -> bool,
{
  let deadline = tokio::time::Instant::now() + WAIT;
  loop {
    if let Some(record) = scheduler.get_job(job_id).await.unwrap() {
      if check(&record) {
        return record;
      }
    }
    assert!(tokio::time::Instant::now() < deadline, "timed out waiting for job {job_id}");
    tokio::time::sleep(StdDuration::from_millis(20)).await;
  }
}

#[tokio::test]
async fn build_requires_workers() {
  setup_tracing();
  assert!(matches!(
    JobScheduler::builder().build(),
    Err(BuildError::MissingOrZeroMaxWorkers)
  ));
  assert!(matches!(
    JobScheduler::builder().max_workers(0).build(),
    Err(BuildError::MissingOrZeroMaxWorkers)
  ));
}

#[tokio::test]
async fn start_twice_is_rejected() {
  setup_tracing();
  let scheduler = started_scheduler(1, memory_job_store()).await;
  assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyStarted)));
}

#[tokio::test]
async fn one_shot_job_runs_once_and_records_result() {
  setup_tracing();
  let scheduler = started_scheduler(2, memory_job_store()).await;
  let runs = counting(&scheduler, "ping");

  let job_id = scheduler
    .schedule_at(Utc::now() + ChronoDuration::milliseconds(50), "ping", json!({"n": 1}))
    .await
    .unwrap();

  let record = wait_for_record(&scheduler, job_id, |r| r.last_finished_at.is_some()).await;
  assert_eq!(runs.load(Ordering::SeqCst), 1);
  assert_eq!(record.run_count, 1);
  assert!(!record.running);
  assert!(!record.has_failed());
  assert_eq!(record.next_run_at, None);
  assert_eq!(record.data, json!({"n": 1}));

  tokio::time::sleep(StdDuration::from_millis(200)).await;
  assert_eq!(runs.load(Ordering::SeqCst), 1);

  let metrics = scheduler.get_metrics_snapshot().await.unwrap();
  assert_eq!(metrics.jobs_submitted, 1);
  assert_eq!(metrics.jobs_executed_success, 1);
  assert!(metrics.mean_execution_duration().is_some());
}

#[tokio::test]
async fn handler_receives_payload() {
  setup_tracing();
  let scheduler = started_scheduler(1, memory_job_store()).await;
  let seen = Arc::new(parking_lot::Mutex::new(None));
  let sink = seen.clone();
  scheduler.define("echo", move |record| {
    let sink = sink.clone();
    async move {
      *sink.lock() = Some(record.data);
      Ok(())
    }
  });

  scheduler.run_now("echo").await.unwrap();
  scheduler
    .schedule_at(Utc::now(), "echo", json!({"show_id": 7}))
    .await
    .unwrap();

  assert!(wait_until(WAIT, || *seen.lock() == Some(json!({"show_id": 7}))).await);
}

#[tokio::test]
async fn recurring_job_runs_repeatedly_under_one_record() {
  setup_tracing();
  let store = memory_job_store();
  let scheduler = started_scheduler(1, store.clone()).await;
  let runs = counting(&scheduler, "tick");

  let job_id = scheduler
    .run_every(StdDuration::from_millis(100), "tick")
    .await
    .unwrap();
  assert!(wait_until(WAIT, || runs.load(Ordering::SeqCst) >= 3).await);

  let records = store.find_by_name("tick").await.unwrap();
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].id, job_id);
  assert!(records[0].next_run_at.is_some());
}

#[tokio::test]
async fn run_every_reuses_existing_recurring_job() {
  setup_tracing();
  let store = memory_job_store();
  let scheduler = started_scheduler(1, store.clone()).await;
  counting(&scheduler, "refresh");

  let first = scheduler.run_every(StdDuration::from_secs(3600), "refresh").await.unwrap();
  let again = scheduler.run_every(StdDuration::from_secs(3600), "refresh").await.unwrap();
  let changed = scheduler.run_every(StdDuration::from_secs(600), "refresh").await.unwrap();
  assert_eq!(first, again);
  assert_eq!(first, changed);

  let records = store.find_by_name("refresh").await.unwrap();
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].schedule, Schedule::Every(StdDuration::from_secs(600)));
  let next = records[0].next_run_at.unwrap();
  assert!(next <= Utc::now() + ChronoDuration::seconds(600));

  assert!(matches!(
    scheduler.run_every(StdDuration::ZERO, "refresh").await,
    Err(SchedulerError::InvalidInterval(_))
  ));
}

#[tokio::test]
async fn unique_key_deduplicates_submissions() {
  setup_tracing();
  let scheduler = started_scheduler(1, memory_job_store()).await;
  let later = Utc::now() + ChronoDuration::hours(1);

  let first = scheduler
    .schedule_unique(later, "remind", json!({}), "reminder:English:1:101")
    .await
    .unwrap();
  let second = scheduler
    .schedule_unique(later, "remind", json!({}), "reminder:English:1:101")
    .await
    .unwrap();
  let other = scheduler
    .schedule_unique(later, "remind", json!({}), "reminder:English:1:102")
    .await
    .unwrap();

  assert!(first.is_some());
  assert_eq!(second, None);
  assert!(other.is_some());
  let metrics = scheduler.get_metrics_snapshot().await.unwrap();
  assert_eq!(metrics.jobs_deduplicated, 1);
  assert_eq!(metrics.job_queue_scheduled_current, 2);
}

#[tokio::test]
async fn removed_job_never_runs() {
  setup_tracing();
  let scheduler = started_scheduler(1, memory_job_store()).await;
  let runs = counting(&scheduler, "doomed");

  let job_id = scheduler
    .schedule_at(Utc::now() + ChronoDuration::milliseconds(200), "doomed", json!(null))
    .await
    .unwrap();
  scheduler.remove_job(job_id).await.unwrap();

  tokio::time::sleep(StdDuration::from_millis(400)).await;
  assert_eq!(runs.load(Ordering::SeqCst), 0);
  assert!(scheduler.get_job(job_id).await.unwrap().is_none());
  assert!(matches!(
    scheduler.remove_job(job_id).await,
    Err(SchedulerError::JobNotFound(id)) if id == job_id
  ));
}

#[tokio::test]
async fn failures_and_panics_are_recorded_on_the_job() {
  setup_tracing();
  let scheduler = started_scheduler(2, memory_job_store()).await;
  scheduler.define("flaky", |_record| async { Err(JobFailure::new("upstream said no")) });
  scheduler.define("explodes", |record| async move {
    if record.data.is_null() {
      panic!("boom");
    }
    Ok(())
  });

  let failing = scheduler.run_now("flaky").await.unwrap();
  let panicking = scheduler.run_now("explodes").await.unwrap();

  let failed = wait_for_record(&scheduler, failing, |r| r.last_finished_at.is_some()).await;
  assert!(failed.has_failed());
  assert_eq!(failed.fail_reason.as_deref(), Some("upstream said no"));
  assert_eq!(failed.fail_count, 1);

  let panicked = wait_for_record(&scheduler, panicking, |r| r.last_finished_at.is_some()).await;
  assert!(panicked.has_failed());
  assert!(panicked.fail_reason.unwrap().contains("panicked"));

  let metrics = scheduler.get_metrics_snapshot().await.unwrap();
  assert_eq!(metrics.jobs_executed_fail, 1);
  assert_eq!(metrics.jobs_panicked, 1);
}

#[tokio::test]
async fn job_without_handler_is_marked_failed() {
  setup_tracing();
  let scheduler = started_scheduler(1, memory_job_store()).await;
  let job_id = scheduler.run_now("undefined").await.unwrap();

  let record = wait_for_record(&scheduler, job_id, |r| r.has_failed()).await;
  assert_eq!(record.next_run_at, None);
  assert!(!record.running);
  assert!(record.fail_reason.unwrap().contains("undefined"));
  assert_eq!(scheduler.get_metrics_snapshot().await.unwrap().jobs_missing_handler, 1);
}

#[tokio::test]
async fn jobs_survive_restart_with_sqlite_store() {
  setup_tracing();
  let db = Database::open_in_memory().unwrap();

  let first = started_scheduler(1, Arc::new(SqliteJobStore::new(db.clone()))).await;
  let job_id = first
    .schedule_at(Utc::now() + ChronoDuration::milliseconds(300), "persisted", json!({"k": "v"}))
    .await
    .unwrap();
  first.shutdown_graceful(Some(WAIT)).await.unwrap();

  // A new process over the same database picks the job up and runs it.
  let second = JobScheduler::builder()
    .max_workers(1)
    .store(Arc::new(SqliteJobStore::new(db)))
    .build()
    .unwrap();
  let runs = counting(&second, "persisted");
  assert_eq!(second.start().await.unwrap(), 1);

  assert!(wait_until(WAIT, || runs.load(Ordering::SeqCst) == 1).await);
  let record = wait_for_record(&second, job_id, |r| r.last_finished_at.is_some()).await;
  assert_eq!(record.data, json!({"k": "v"}));
  assert_eq!(record.run_count, 1);
}

#[tokio::test]
async fn interrupted_run_is_recovered_on_start() {
  setup_tracing();
  let store = memory_job_store();

  // Left behind by a process that stopped mid-run.
  let mut interrupted = JobRecord::once("resume", Utc::now() - ChronoDuration::minutes(10), json!(null));
  interrupted.running = true;
  interrupted.run_count = 1;
  interrupted.last_run_at = Some(Utc::now() - ChronoDuration::minutes(10));
  store.insert(&interrupted).await.unwrap();

  let scheduler = JobScheduler::builder()
    .max_workers(1)
    .store(store.clone())
    .build()
    .unwrap();
  let runs = counting(&scheduler, "resume");
  assert_eq!(scheduler.start().await.unwrap(), 1);

  let record = wait_for_record(&scheduler, interrupted.id, |r| r.last_finished_at.is_some()).await;
  assert_eq!(runs.load(Ordering::SeqCst), 1);
  assert_eq!(record.run_count, 2);
  assert!(!record.running);
  assert_eq!(scheduler.get_metrics_snapshot().await.unwrap().jobs_recovered, 1);
}

#[tokio::test]
async fn jobs_wait_for_start() {
  setup_tracing();
  let scheduler = JobScheduler::builder()
    .max_workers(1)
    .store(memory_job_store())
    .build()
    .unwrap();
  let runs = counting(&scheduler, "early");
  scheduler.run_now("early").await.unwrap();

  tokio::time::sleep(StdDuration::from_millis(150)).await;
  assert_eq!(runs.load(Ordering::SeqCst), 0);

  scheduler.start().await.unwrap();
  assert!(wait_until(WAIT, || runs.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn graceful_shutdown_lets_running_job_finish() {
  setup_tracing();
  let scheduler = started_scheduler(1, memory_job_store()).await;
  let started = Arc::new(AtomicUsize::new(0));
  let finished = Arc::new(AtomicUsize::new(0));
  let (s, f) = (started.clone(), finished.clone());
  scheduler.define("slow", move |_record| {
    let (s, f) = (s.clone(), f.clone());
    async move {
      s.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(StdDuration::from_millis(200)).await;
      f.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  });

  scheduler.run_now("slow").await.unwrap();
  assert!(wait_until(WAIT, || started.load(Ordering::SeqCst) == 1).await);

  scheduler.shutdown_graceful(Some(WAIT)).await.unwrap();
  assert_eq!(finished.load(Ordering::SeqCst), 1);

  assert!(matches!(
    scheduler.run_now("slow").await,
    Err(SchedulerError::SchedulerShutdown)
  ));
}

#[tokio::test]
async fn forced_shutdown_returns_promptly() {
  setup_tracing();
  let scheduler = started_scheduler(1, memory_job_store()).await;
  scheduler
    .schedule_at(Utc::now() + ChronoDuration::hours(1), "later", json!(null))
    .await
    .unwrap();

  scheduler
    .shutdown_force(Some(StdDuration::from_secs(2)))
    .await
    .unwrap();
  assert!(scheduler.get_metrics_snapshot().await.is_err());
}
