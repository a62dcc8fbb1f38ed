//! tests/common.rs
//! Shared fixtures for integration tests: tracing, feed JSON builders, fake collaborators
//! and service builders.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing_subscriber::fmt::TestWriter;
use vlive_keeper::{
  CleanupSweeper, FeedError, FeedSource, JobScheduler, JobStore, MemoryJobStore, MemoryShowStore,
  NotifyError, Notifier, Recipient, RefreshOrchestrator, Region, Reminder, ReminderScheduler,
  ScheduleCache, Show, ShowId, ShowStore, SubscriptionPurger,
};

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// --- Feed JSON builders ---

pub fn millis(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}

/// One raw occurrence record as the feed publishes it.
pub fn raw_occurrence(id: u64, show_id: u64, seq: u32, start: DateTime<Utc>, end: DateTime<Utc>) -> Value {
  json!({
    "id": id,
    "virtualLiveId": show_id,
    "seq": seq,
    "startAt": millis(start),
    "endAt": millis(end),
  })
}

/// One raw show record. Its own bounds are taken from the occurrence list, like the feed.
pub fn raw_show(id: u64, kind: &str, name: &str, occurrences: Vec<Value>) -> Value {
  let starts = occurrences.iter().filter_map(|o| o["startAt"].as_i64());
  let ends = occurrences.iter().filter_map(|o| o["endAt"].as_i64());
  json!({
    "id": id,
    "virtualLiveType": kind,
    "name": name,
    "startAt": starts.min().unwrap_or(0),
    "endAt": ends.max().unwrap_or(0),
    "virtualLiveSchedules": occurrences,
  })
}

/// A normal show with one occurrence per `(start offset, length)` from `base`.
/// Occurrence ids are `show_id * 100 + seq`.
pub fn raw_show_at(id: u64, name: &str, base: DateTime<Utc>, slots: &[(ChronoDuration, ChronoDuration)]) -> Value {
  let occurrences = slots
    .iter()
    .enumerate()
    .map(|(i, (offset, length))| {
      let seq = i as u32 + 1;
      let start = base + *offset;
      raw_occurrence(id * 100 + seq as u64, id, seq, start, start + *length)
    })
    .collect();
  raw_show(id, "normal", name, occurrences)
}

/// Normalized show with a single occurrence.
pub fn show(id: ShowId, name: &str, region: Region, start: DateTime<Utc>, end: DateTime<Utc>) -> Show {
  let raw = raw_show(id, "normal", name, vec![raw_occurrence(id * 100 + 1, id, 1, start, end)]);
  vlive_keeper::normalize(&[raw], start - ChronoDuration::days(365), region)
    .into_iter()
    .next()
    .expect("fixture show should normalize")
}

// --- Fake collaborators ---

/// Feed source serving canned responses per URL.
#[derive(Default)]
pub struct StaticFeed {
  responses: Mutex<HashMap<String, Result<Vec<Value>, String>>>,
  calls: AtomicUsize,
  delay: Mutex<Option<StdDuration>>,
}

impl StaticFeed {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&self, url: &str, records: Vec<Value>) {
    self.responses.lock().insert(url.to_string(), Ok(records));
  }

  pub fn fail(&self, url: &str, reason: &str) {
    self
      .responses
      .lock()
      .insert(url.to_string(), Err(reason.to_string()));
  }

  pub fn set_delay(&self, delay: StdDuration) {
    *self.delay.lock() = Some(delay);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl FeedSource for StaticFeed {
  async fn fetch_raw_shows(&self, url: &str) -> Result<Vec<Value>, FeedError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let delay = *self.delay.lock();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    let response = self.responses.lock().get(url).cloned();
    match response {
      Some(Ok(records)) => Ok(records),
      Some(Err(reason)) => Err(FeedError::Unavailable(format!("{url}: {reason}"))),
      None => Err(FeedError::Unavailable(url.to_string())),
    }
  }
}

/// Notifier recording deliveries and announcements.
#[derive(Default)]
pub struct RecordingNotifier {
  pub recipients: Mutex<Vec<Recipient>>,
  /// Recipients whose delivery fails.
  pub failing: Mutex<Vec<Recipient>>,
  pub lookup_error: Mutex<Option<String>>,
  pub delivered: Mutex<Vec<(Recipient, Reminder)>>,
  pub announced: Mutex<Vec<(Region, Vec<ShowId>)>>,
}

impl RecordingNotifier {
  pub fn with_recipients(names: &[&str]) -> Self {
    let notifier = Self::default();
    *notifier.recipients.lock() = names.iter().map(|n| Recipient(n.to_string())).collect();
    notifier
  }

  pub fn delivered(&self) -> Vec<(Recipient, Reminder)> {
    self.delivered.lock().clone()
  }
}

#[async_trait]
impl Notifier for RecordingNotifier {
  async fn recipients(&self, _region: Region, _show_id: ShowId) -> Result<Vec<Recipient>, NotifyError> {
    if let Some(reason) = self.lookup_error.lock().clone() {
      return Err(NotifyError::Lookup(reason));
    }
    Ok(self.recipients.lock().clone())
  }

  async fn deliver(&self, recipient: &Recipient, reminder: &Reminder) -> Result<(), NotifyError> {
    if self.failing.lock().contains(recipient) {
      return Err(NotifyError::Delivery(format!("{recipient} unreachable")));
    }
    self
      .delivered
      .lock()
      .push((recipient.clone(), reminder.clone()));
    Ok(())
  }

  async fn announce_new_shows(&self, region: Region, shows: &[Show]) -> Result<(), NotifyError> {
    self
      .announced
      .lock()
      .push((region, shows.iter().map(|s| s.id).collect()));
    Ok(())
  }
}

/// Purger recording purged shows.
#[derive(Default)]
pub struct RecordingPurger {
  pub purged: Mutex<Vec<(Region, ShowId)>>,
  pub fail_for: Mutex<Option<ShowId>>,
}

#[async_trait]
impl SubscriptionPurger for RecordingPurger {
  async fn purge_show(&self, region: Region, show_id: ShowId) -> Result<u64, NotifyError> {
    if *self.fail_for.lock() == Some(show_id) {
      return Err(NotifyError::Purge(format!("show {show_id}")));
    }
    self.purged.lock().push((region, show_id));
    Ok(1)
  }
}

// --- Service builders ---

pub fn feed_url(region: Region) -> String {
  format!("https://feeds.test/{}.json", region.as_str().to_lowercase())
}

pub fn feeds_for(regions: &[Region]) -> BTreeMap<Region, String> {
  regions.iter().map(|r| (*r, feed_url(*r))).collect()
}

pub struct Harness {
  pub store: Arc<MemoryShowStore>,
  pub cache: Arc<ScheduleCache>,
  pub feed: Arc<StaticFeed>,
  pub refresh: Arc<RefreshOrchestrator>,
}

/// Memory store, cache and refresh orchestrator over `regions` with a [`StaticFeed`].
pub fn harness(regions: &[Region]) -> Harness {
  let store = Arc::new(MemoryShowStore::new(regions));
  let cache = Arc::new(ScheduleCache::new(store.clone(), regions));
  let feed = Arc::new(StaticFeed::new());
  let refresh = Arc::new(RefreshOrchestrator::new(
    feeds_for(regions),
    feed.clone(),
    store.clone(),
    cache.clone(),
  ));
  Harness {
    store,
    cache,
    feed,
    refresh,
  }
}

// Builds a started scheduler over `store`.
pub async fn started_scheduler(max_workers: usize, store: Arc<dyn JobStore>) -> JobScheduler {
  let scheduler = JobScheduler::builder()
    .max_workers(max_workers)
    .store(store)
    .build()
    .expect("scheduler should build");
  scheduler.start().await.expect("scheduler should start");
  scheduler
}

pub fn memory_job_store() -> Arc<MemoryJobStore> {
  Arc::new(MemoryJobStore::new())
}

pub fn reminder_scheduler(
  scheduler: &JobScheduler,
  cache: Arc<ScheduleCache>,
  notifier: Arc<RecordingNotifier>,
) -> ReminderScheduler {
  ReminderScheduler::new(scheduler.clone(), cache, notifier, ChronoDuration::minutes(5))
}

pub fn cleanup_sweeper(
  store: Arc<dyn ShowStore>,
  cache: Arc<ScheduleCache>,
  scheduler: &JobScheduler,
  purger: Arc<RecordingPurger>,
) -> CleanupSweeper {
  CleanupSweeper::new(
    store,
    cache,
    scheduler.clone(),
    purger,
    ChronoDuration::days(1),
    ChronoDuration::weeks(1),
  )
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: StdDuration, mut check: F) -> bool
where
  F: FnMut() -> bool,
{
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if check() {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(StdDuration::from_millis(20)).await;
  }
}
