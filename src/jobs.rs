//! Named job definitions wiring the refresh, reminder and cleanup services to the
//! scheduler.

use crate::cleanup::CleanupSweeper;
use crate::config::Settings;
use crate::error::{JobFailure, SchedulerError};
use crate::job::JobOutcome;
use crate::notify::Notifier;
use crate::refresh::RefreshOrchestrator;
use crate::reminder::{ReminderJobData, ReminderScheduler};
use crate::scheduler::JobScheduler;

use std::sync::Arc;

use tracing::{info, warn};

pub const REFRESH_JOB: &str = "vlive-refresh";
pub const REMINDER_JOB: &str = "vlive-reminder";
pub const CLEANUP_JOB: &str = "vlive-cleanup";

/// The services the job handlers run against.
#[derive(Clone)]
pub struct Services {
  pub refresh: Arc<RefreshOrchestrator>,
  pub reminders: Arc<ReminderScheduler>,
  pub cleanup: Arc<CleanupSweeper>,
  pub notifier: Arc<dyn Notifier>,
}

/// Defines the refresh, reminder and cleanup handlers on `scheduler`.
pub fn register(scheduler: &JobScheduler, services: &Services) {
  let refresh_services = services.clone();
  scheduler.define(REFRESH_JOB, move |_record| {
    let services = refresh_services.clone();
    async move { refresh_cycle(&services).await }
  });

  let reminders = services.reminders.clone();
  scheduler.define(REMINDER_JOB, move |record| {
    let reminders = reminders.clone();
    async move {
      let data = ReminderJobData::from_value(&record.data).map_err(|e| JobFailure::new(e.to_string()))?;
      reminders
        .fire(&data)
        .await
        .map(|_| ())
        .map_err(|e| JobFailure::new(e.to_string()))
    }
  });

  let cleanup = services.cleanup.clone();
  scheduler.define(CLEANUP_JOB, move |_record| {
    let cleanup = cleanup.clone();
    async move {
      let report = cleanup.run().await;
      if report.is_clean() {
        Ok(())
      } else {
        Err(JobFailure::new(report.errors.join("; ")))
      }
    }
  });
}

/// One refresh cycle: refresh all regions, schedule reminders for new shows and announce
/// them. Fails when any region failed to refresh or any reminder could not be scheduled.
pub async fn refresh_cycle(services: &Services) -> JobOutcome {
  let report = services.refresh.run_for_all_regions().await;
  let mut problems: Vec<String> = report
    .failures
    .iter()
    .map(|(region, reason)| format!("refresh failed for {region}: {reason}"))
    .collect();

  if !report.new_shows.is_empty() {
    let scheduled = services
      .reminders
      .schedule_for_new_shows(&report.new_shows)
      .await;
    if scheduled.failed > 0 {
      warn!(failed = scheduled.failed, "Some reminders could not be scheduled.");
      problems.push(format!("{} reminder(s) could not be scheduled", scheduled.failed));
    }

    for (region, shows) in report.new_shows.iter() {
      if shows.is_empty() {
        continue;
      }
      if let Err(e) = services.notifier.announce_new_shows(region, shows).await {
        warn!(%region, error = %e, "Failed to announce new shows.");
      }
    }
  }

  if problems.is_empty() {
    Ok(())
  } else {
    Err(JobFailure::new(problems.join("; ")))
  }
}

/// Installs the recurring refresh and cleanup jobs, plus a one-off cleanup right away.
pub async fn install_recurring(scheduler: &JobScheduler, settings: &Settings) -> Result<(), SchedulerError> {
  scheduler
    .run_every(settings.refresh_interval(), REFRESH_JOB)
    .await?;
  scheduler
    .run_every(settings.cleanup_interval(), CLEANUP_JOB)
    .await?;
  scheduler.run_now(CLEANUP_JOB).await?;
  info!(
    refresh_every = ?settings.refresh_interval(),
    cleanup_every = ?settings.cleanup_interval(),
    "Recurring jobs installed."
  );
  Ok(())
}
