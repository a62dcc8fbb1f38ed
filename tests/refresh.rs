//! tests/refresh.rs
//! Refresh cycles: new-show detection, per-region isolation and re-entrancy.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::common::{
  cleanup_sweeper, feed_url, feeds_for, harness, memory_job_store, raw_show_at, reminder_scheduler, setup_tracing,
  Harness, RecordingNotifier, RecordingPurger, StaticFeed,
};
use vlive_keeper::jobs::refresh_cycle;
use vlive_keeper::{
  JobScheduler, JobStore, MemoryShowStore, RefreshError, RefreshOrchestrator, RefreshPhase, Region, ScheduleCache,
  Services, Show, ShowStore, StoreError, REMINDER_JOB,
};

fn one_slot() -> [(ChronoDuration, ChronoDuration); 1] {
  [(ChronoDuration::zero(), ChronoDuration::minutes(30))]
}

#[tokio::test]
async fn first_refresh_reports_every_show_as_new() {
  setup_tracing();
  let h = harness(&[Region::English]);
  let base = Utc::now() + ChronoDuration::hours(2);
  h.feed.set(
    &feed_url(Region::English),
    vec![
      raw_show_at(1, "Alpha", base, &one_slot()),
      raw_show_at(2, "Beta", base + ChronoDuration::hours(1), &one_slot()),
    ],
  );

  let report = h.refresh.run_for_region(Region::English).await.unwrap();
  assert!(report.is_success());
  let new_ids: Vec<u64> = report.new_shows.get(Region::English).unwrap().iter().map(|s| s.id).collect();
  assert_eq!(new_ids, vec![1, 2]);
  assert_eq!(h.cache.get_all_shows(Region::English).unwrap().unwrap().len(), 2);
  assert_eq!(h.refresh.phase(Region::English), Some(RefreshPhase::Idle));

  // Same feed again: nothing new, store unchanged.
  let again = h.refresh.run_for_region(Region::English).await.unwrap();
  assert!(again.new_shows.is_empty());
  assert_eq!(again.new_shows.get(Region::English), Some(&[][..]));
  assert_eq!(h.store.get_all(Region::English).await.unwrap().len(), 2);
}

#[tokio::test]
async fn modified_show_is_updated_without_being_new() {
  setup_tracing();
  let h = harness(&[Region::English]);
  let base = Utc::now() + ChronoDuration::hours(2);
  let url = feed_url(Region::English);
  h.feed.set(&url, vec![raw_show_at(1, "Alpha", base, &one_slot())]);
  h.refresh.run_for_region(Region::English).await.unwrap();

  h.feed.set(&url, vec![raw_show_at(1, "Alpha (Rerun)", base, &one_slot())]);
  let report = h.refresh.run_for_region(Region::English).await.unwrap();

  assert!(report.new_shows.is_empty());
  let cached = h.cache.get_show_by_id(Region::English, 1).unwrap().unwrap();
  assert_eq!(cached.name, "Alpha (Rerun)");
}

#[tokio::test]
async fn failing_region_does_not_affect_others() {
  setup_tracing();
  let h = harness(&[Region::English, Region::Japanese]);
  let base = Utc::now() + ChronoDuration::hours(2);

  // Japanese has a previously cached show that must survive its failed refresh.
  h.feed.set(&feed_url(Region::Japanese), vec![raw_show_at(7, "Sakura", base, &one_slot())]);
  h.refresh.run_for_region(Region::Japanese).await.unwrap();

  h.feed.set(&feed_url(Region::English), vec![raw_show_at(1, "Alpha", base, &one_slot())]);
  h.feed.fail(&feed_url(Region::Japanese), "503 Service Unavailable");

  let report = h.refresh.run_for_all_regions().await;
  assert!(!report.is_success());
  assert_eq!(report.failures.keys().copied().collect::<Vec<_>>(), vec![Region::Japanese]);
  assert!(report.failures[&Region::Japanese].contains("503"));
  assert_eq!(report.new_shows.total(), 1);
  assert_eq!(report.new_shows.get(Region::English).unwrap()[0].id, 1);

  assert!(h.cache.get_show_by_id(Region::English, 1).unwrap().is_some());
  assert!(h.cache.get_show_by_id(Region::Japanese, 7).unwrap().is_some());
  assert_eq!(h.refresh.phase(Region::Japanese), Some(RefreshPhase::Idle));
}

#[tokio::test]
async fn concurrent_refresh_of_same_region_is_skipped() {
  setup_tracing();
  let h = harness(&[Region::English]);
  let base = Utc::now() + ChronoDuration::hours(2);
  h.feed.set(&feed_url(Region::English), vec![raw_show_at(1, "Alpha", base, &one_slot())]);
  h.feed.set_delay(StdDuration::from_millis(300));

  let refresh = h.refresh.clone();
  let first = tokio::spawn(async move { refresh.run_for_region(Region::English).await });
  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert_eq!(h.refresh.phase(Region::English), Some(RefreshPhase::Fetching));

  let second = h.refresh.run_for_region(Region::English).await.unwrap();
  assert_eq!(second.skipped, vec![Region::English]);
  assert!(second.new_shows.is_empty());

  let first = first.await.unwrap().unwrap();
  assert!(first.skipped.is_empty());
  assert_eq!(first.new_shows.total(), 1);
  assert_eq!(h.feed.calls(), 1);
}

#[tokio::test]
async fn unconfigured_region_is_rejected() {
  setup_tracing();
  let h = harness(&[Region::English]);
  let err = h.refresh.run_for_region(Region::Taiwanese).await.unwrap_err();
  assert!(matches!(err, RefreshError::RegionNotConfigured(Region::Taiwanese)));
  assert_eq!(h.refresh.phase(Region::Taiwanese), None);
}

/// Memory store whose reads can be switched to fail while writes keep working.
struct FlakyReads {
  inner: MemoryShowStore,
  fail_reads: AtomicBool,
}

#[async_trait]
impl ShowStore for FlakyReads {
  fn regions(&self) -> &[Region] {
    self.inner.regions()
  }

  async fn upsert(&self, region: Region, show: &Show) -> Result<u64, StoreError> {
    self.inner.upsert(region, show).await
  }

  async fn get_all(&self, region: Region) -> Result<Vec<Show>, StoreError> {
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(StoreError::Task("read timeout".to_string()));
    }
    self.inner.get_all(region).await
  }

  async fn delete_expired(&self, now: DateTime<Utc>, retention: ChronoDuration) -> Result<Vec<Show>, StoreError> {
    self.inner.delete_expired(now, retention).await
  }
}

#[tokio::test]
async fn shows_inserted_before_a_failed_resync_are_still_new() {
  setup_tracing();
  let regions = [Region::English];
  let store = Arc::new(FlakyReads {
    inner: MemoryShowStore::new(&regions),
    fail_reads: AtomicBool::new(true),
  });
  let cache = Arc::new(ScheduleCache::new(store.clone(), &regions));
  let feed = Arc::new(StaticFeed::new());
  let refresh = RefreshOrchestrator::new(feeds_for(&regions), feed.clone(), store.clone(), cache.clone());
  let base = Utc::now() + ChronoDuration::hours(2);
  feed.set(&feed_url(Region::English), vec![raw_show_at(1, "Alpha", base, &one_slot())]);

  let first = refresh.run_for_region(Region::English).await.unwrap();
  assert!(first.failures[&Region::English].contains("read timeout"));
  assert_eq!(first.new_shows.total(), 1);
  assert_eq!(first.new_shows.get(Region::English).unwrap()[0].id, 1);
  assert!(cache.get_all_shows(Region::English).unwrap().is_none());

  // The show is persisted, so the next cycle sees it as modified.
  store.fail_reads.store(false, Ordering::SeqCst);
  let second = refresh.run_for_region(Region::English).await.unwrap();
  assert!(second.is_success());
  assert!(second.new_shows.is_empty());
  assert!(cache.get_show_by_id(Region::English, 1).unwrap().is_some());
}

// --- Full cycle ---

struct Cycle {
  h: Harness,
  notifier: Arc<RecordingNotifier>,
  jobs: Arc<vlive_keeper::MemoryJobStore>,
  scheduler: JobScheduler,
  services: Services,
}

/// Wires a refresh cycle over a scheduler that is built but not started, so scheduled
/// reminders stay queued for inspection.
fn cycle(regions: &[Region]) -> Cycle {
  let h = harness(regions);
  let jobs = memory_job_store();
  let scheduler = JobScheduler::builder()
    .max_workers(1)
    .store(jobs.clone())
    .build()
    .unwrap();
  let notifier = Arc::new(RecordingNotifier::with_recipients(&["alice"]));
  let services = Services {
    refresh: h.refresh.clone(),
    reminders: Arc::new(reminder_scheduler(&scheduler, h.cache.clone(), notifier.clone())),
    cleanup: Arc::new(cleanup_sweeper(
      h.store.clone(),
      h.cache.clone(),
      &scheduler,
      Arc::new(RecordingPurger::default()),
    )),
    notifier: notifier.clone(),
  };
  Cycle {
    h,
    notifier,
    jobs,
    scheduler,
    services,
  }
}

#[tokio::test]
async fn cycle_schedules_reminders_only_for_new_shows() {
  setup_tracing();
  let c = cycle(&[Region::English]);
  let base = Utc::now() + ChronoDuration::hours(3);
  let url = feed_url(Region::English);
  let two_slots = [
    (ChronoDuration::zero(), ChronoDuration::minutes(30)),
    (ChronoDuration::hours(1), ChronoDuration::minutes(30)),
  ];

  // Two of the three shows are already known.
  c.h.feed.set(
    &url,
    vec![
      raw_show_at(1, "Known One", base, &one_slot()),
      raw_show_at(2, "Known Two", base, &one_slot()),
    ],
  );
  c.h.refresh.run_for_region(Region::English).await.unwrap();

  c.h.feed.set(
    &url,
    vec![
      raw_show_at(1, "Known One", base, &one_slot()),
      raw_show_at(2, "Known Two", base, &one_slot()),
      raw_show_at(3, "Brand New", base, &two_slots),
    ],
  );
  refresh_cycle(&c.services).await.unwrap();

  let mut occurrence_ids: Vec<u64> = c
    .jobs
    .find_by_name(REMINDER_JOB)
    .await
    .unwrap()
    .iter()
    .map(|record| record.data["occurrence_id"].as_u64().unwrap())
    .collect();
  occurrence_ids.sort_unstable();
  assert_eq!(occurrence_ids, vec![301, 302]);

  let announced = c.notifier.announced.lock().clone();
  assert_eq!(announced, vec![(Region::English, vec![3])]);
}

#[tokio::test]
async fn cycle_fails_when_a_region_fails() {
  setup_tracing();
  let c = cycle(&[Region::English, Region::Korean]);
  let base = Utc::now() + ChronoDuration::hours(3);
  c.h.feed.set(&feed_url(Region::English), vec![raw_show_at(1, "Alpha", base, &one_slot())]);
  c.h.feed.fail(&feed_url(Region::Korean), "timeout");

  let failure = refresh_cycle(&c.services).await.unwrap_err();
  assert!(failure.reason.contains("Korean"), "{}", failure.reason);

  // The healthy region still got its reminders.
  assert_eq!(c.jobs.find_by_name(REMINDER_JOB).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cycle_fails_when_reminders_cannot_be_scheduled() {
  setup_tracing();
  let c = cycle(&[Region::English]);
  let base = Utc::now() + ChronoDuration::hours(3);
  c.h.feed.set(&feed_url(Region::English), vec![raw_show_at(1, "Alpha", base, &one_slot())]);
  c.scheduler.shutdown_force(Some(StdDuration::from_secs(2))).await.unwrap();

  let failure = refresh_cycle(&c.services).await.unwrap_err();
  assert!(failure.reason.contains("1 reminder(s) could not be scheduled"), "{}", failure.reason);

  // The refresh itself went through and the show was still announced.
  assert!(c.h.cache.get_show_by_id(Region::English, 1).unwrap().is_some());
  assert_eq!(c.notifier.announced.lock().clone(), vec![(Region::English, vec![1])]);
}
