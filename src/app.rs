//! Process-level assembly: one instance of each service, wired together.

use crate::cache::ScheduleCache;
use crate::cleanup::CleanupSweeper;
use crate::config::Settings;
use crate::db::Database;
use crate::error::AppError;
use crate::feed::{FeedSource, HttpFeedSource};
use crate::job::store::SqliteJobStore;
use crate::jobs::{self, Services};
use crate::notify::{Notifier, SubscriptionPurger};
use crate::refresh::RefreshOrchestrator;
use crate::region::Region;
use crate::reminder::ReminderScheduler;
use crate::scheduler::JobScheduler;
use crate::store::{ShowStore, SqliteShowStore};

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

/// The running service: cache, refresh, reminders, cleanup and the job scheduler.
pub struct VliveKeeper {
  pub cache: Arc<ScheduleCache>,
  pub scheduler: JobScheduler,
  pub services: Services,
}

impl VliveKeeper {
  /// Opens the database, warms the cache and starts the scheduler with the recurring
  /// refresh and cleanup jobs installed.
  ///
  /// # Errors
  ///
  /// Configuration faults (unknown or missing feed regions), an unreadable database or
  /// a failed initial cache load.
  pub async fn start(
    settings: &Settings,
    notifier: Arc<dyn Notifier>,
    purger: Arc<dyn SubscriptionPurger>,
  ) -> Result<Self, AppError> {
    Self::start_with_source(settings, Arc::new(HttpFeedSource::new()), notifier, purger).await
  }

  /// Like [`start`](Self::start) with a custom feed source.
  pub async fn start_with_source(
    settings: &Settings,
    source: Arc<dyn FeedSource>,
    notifier: Arc<dyn Notifier>,
    purger: Arc<dyn SubscriptionPurger>,
  ) -> Result<Self, AppError> {
    let feeds = settings.feed_urls()?;
    let regions: Vec<Region> = feeds.keys().copied().collect();
    info!(?regions, database = %settings.database.path, "Starting vlive-keeper.");

    let db = Database::open(&settings.database.path)?;
    let show_store: Arc<dyn ShowStore> = Arc::new(SqliteShowStore::new(db.clone(), &regions)?);

    let cache = Arc::new(ScheduleCache::new(show_store.clone(), &regions));
    cache.resync_all().await?;

    let scheduler = JobScheduler::builder()
      .max_workers(settings.scheduler.max_workers)
      .store(Arc::new(SqliteJobStore::new(db)))
      .build()?;

    let refresh = Arc::new(RefreshOrchestrator::new(
      feeds,
      source,
      show_store.clone(),
      cache.clone(),
    ));
    let reminders = Arc::new(ReminderScheduler::new(
      scheduler.clone(),
      cache.clone(),
      notifier.clone(),
      settings.reminder_offset(),
    ));
    let cleanup = Arc::new(CleanupSweeper::new(
      show_store,
      cache.clone(),
      scheduler.clone(),
      purger,
      settings.retention(),
      settings.job_staleness(),
    ));
    let services = Services {
      refresh,
      reminders,
      cleanup,
      notifier,
    };

    jobs::register(&scheduler, &services);
    let queued = scheduler.start().await?;
    jobs::install_recurring(&scheduler, settings).await?;
    info!(persisted_jobs = queued, "vlive-keeper started.");

    Ok(Self {
      cache,
      scheduler,
      services,
    })
  }

  /// Stops dispatching new jobs and waits for running ones.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), AppError> {
    match self.scheduler.shutdown_graceful(timeout).await {
      Ok(()) => Ok(()),
      Err(e) => {
        warn!(error = %e, "Graceful shutdown did not complete.");
        Err(e.into())
      }
    }
  }
}
