//! Periodic removal of expired shows, their subscription state and finished reminder jobs.

use crate::cache::ScheduleCache;
use crate::jobs::{CLEANUP_JOB, REMINDER_JOB};
use crate::notify::SubscriptionPurger;
use crate::region::Region;
use crate::scheduler::JobScheduler;
use crate::show::ShowId;
use crate::store::ShowStore;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

/// What a sweep did. Sub-task failures are collected in `errors` instead of aborting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
  /// Shows deleted from the store.
  pub deleted: Vec<(Region, ShowId)>,
  /// Subscription records removed for the deleted shows.
  pub purged_records: u64,
  pub resynced: bool,
  pub reaped_jobs: usize,
  pub errors: Vec<String>,
}

impl SweepReport {
  pub fn is_clean(&self) -> bool {
    self.errors.is_empty()
  }
}

pub struct CleanupSweeper {
  store: Arc<dyn ShowStore>,
  cache: Arc<ScheduleCache>,
  scheduler: JobScheduler,
  purger: Arc<dyn SubscriptionPurger>,
  retention: Duration,
  job_staleness: Duration,
}

impl fmt::Debug for CleanupSweeper {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CleanupSweeper")
      .field("retention", &self.retention)
      .field("job_staleness", &self.job_staleness)
      .finish_non_exhaustive()
  }
}

impl CleanupSweeper {
  /// Shows ending before `now + retention` are deleted. Finished reminder jobs whose
  /// last run is older than `job_staleness` are reaped.
  pub fn new(
    store: Arc<dyn ShowStore>,
    cache: Arc<ScheduleCache>,
    scheduler: JobScheduler,
    purger: Arc<dyn SubscriptionPurger>,
    retention: Duration,
    job_staleness: Duration,
  ) -> Self {
    Self {
      store,
      cache,
      scheduler,
      purger,
      retention,
      job_staleness,
    }
  }

  pub async fn run(&self) -> SweepReport {
    self.run_at(Utc::now()).await
  }

  /// Runs the sweep as of `now`. Each step runs even if an earlier one failed.
  pub async fn run_at(&self, now: DateTime<Utc>) -> SweepReport {
    let mut report = SweepReport::default();

    self.delete_expired(now, &mut report).await;

    match self.cache.resync_all().await {
      Ok(()) => report.resynced = true,
      Err(e) => report.errors.push(format!("cache resync: {e}")),
    }

    self.reap_jobs(now, &mut report).await;

    if report.is_clean() {
      info!(
        deleted = report.deleted.len(),
        purged = report.purged_records,
        reaped = report.reaped_jobs,
        "Cleanup finished."
      );
    } else {
      warn!(errors = report.errors.len(), "Cleanup finished with errors.");
    }
    report
  }

  async fn delete_expired(&self, now: DateTime<Utc>, report: &mut SweepReport) {
    let deleted = match self.store.delete_expired(now, self.retention).await {
      Ok(deleted) => deleted,
      Err(e) => {
        error!(error = %e, "Failed to delete expired shows.");
        report.errors.push(format!("delete expired: {e}"));
        return;
      }
    };

    for show in deleted {
      debug!(region = %show.region, show_id = show.id, name = %show.name, "Deleted expired show.");
      match self.purger.purge_show(show.region, show.id).await {
        Ok(count) => report.purged_records += count,
        Err(e) => {
          warn!(region = %show.region, show_id = show.id, error = %e, "Failed to purge subscriptions.");
          report
            .errors
            .push(format!("purge {} {}: {e}", show.region, show.id));
        }
      }
      report.deleted.push((show.region, show.id));
    }
  }

  /// Removes finished one-shot jobs: reminders, and the start-up cleanup runs.
  async fn reap_jobs(&self, now: DateTime<Utc>, report: &mut SweepReport) {
    let stale_before = now - self.job_staleness;
    let mut finished = Vec::new();
    for name in [REMINDER_JOB, CLEANUP_JOB] {
      match self
        .scheduler
        .find_jobs(name, |record| record.is_reapable(stale_before))
        .await
      {
        Ok(records) => finished.extend(records),
        Err(e) => {
          error!(job_name = name, error = %e, "Failed to query finished jobs.");
          report.errors.push(format!("find finished {name} jobs: {e}"));
        }
      }
    }

    for record in finished {
      match self.scheduler.remove_job(record.id).await {
        Ok(()) => report.reaped_jobs += 1,
        Err(e) => {
          warn!(job_id = %record.id, error = %e, "Failed to remove finished job.");
          report.errors.push(format!("remove job {}: {e}", record.id));
        }
      }
    }
  }
}
