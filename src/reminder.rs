//! Durable per-occurrence reminder jobs and their delivery.

use crate::cache::ScheduleCache;
use crate::error::ReminderError;
use crate::jobs::REMINDER_JOB;
use crate::notify::{Notifier, Reminder};
use crate::refresh::NewShows;
use crate::region::Region;
use crate::scheduler::JobScheduler;
use crate::show::{Occurrence, OccurrenceId, Show, ShowId};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Show details captured when the reminder was scheduled.
///
/// Used when the show has left the cache by the time the reminder fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackSnapshot {
  pub name: String,
  pub start_at: DateTime<Utc>,
  pub end_at: DateTime<Utc>,
}

/// Payload of a [`REMINDER_JOB`] record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderJobData {
  pub region: Region,
  pub show_id: ShowId,
  pub occurrence_id: OccurrenceId,
  pub fire_at: DateTime<Utc>,
  pub fallback: FallbackSnapshot,
}

impl ReminderJobData {
  pub fn new(show: &Show, occurrence: &Occurrence, fire_at: DateTime<Utc>) -> Self {
    Self {
      region: show.region,
      show_id: show.id,
      occurrence_id: occurrence.id,
      fire_at,
      fallback: FallbackSnapshot {
        name: show.name.clone(),
        start_at: occurrence.start_at,
        end_at: occurrence.end_at,
      },
    }
  }

  /// Deduplication key: one reminder per region, show and occurrence.
  pub fn unique_key(&self) -> String {
    format!(
      "reminder:{}:{}:{}",
      self.region, self.show_id, self.occurrence_id
    )
  }

  /// Decodes the payload stored on a job record.
  ///
  /// # Errors
  ///
  /// [`ReminderError::InvalidPayload`] for missing fields or an unknown region.
  pub fn from_value(value: &serde_json::Value) -> Result<Self, ReminderError> {
    Ok(Self::deserialize(value)?)
  }
}

/// Counts from one [`ReminderScheduler::schedule_for_new_shows`] fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
  pub scheduled: usize,
  /// Occurrences that already had a reminder job.
  pub deduplicated: usize,
  pub failed: usize,
}

/// Result of a delivered reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
  pub recipients: usize,
  /// The payload snapshot was used because the show was no longer cached.
  pub possibly_stale: bool,
}

/// Schedules reminder jobs for new shows and delivers them when they fire.
pub struct ReminderScheduler {
  scheduler: JobScheduler,
  cache: Arc<ScheduleCache>,
  notifier: Arc<dyn Notifier>,
  offset: Duration,
}

impl fmt::Debug for ReminderScheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ReminderScheduler")
      .field("offset", &self.offset)
      .finish_non_exhaustive()
  }
}

impl ReminderScheduler {
  /// `offset` is how long before an occurrence starts its reminder fires.
  pub fn new(
    scheduler: JobScheduler,
    cache: Arc<ScheduleCache>,
    notifier: Arc<dyn Notifier>,
    offset: Duration,
  ) -> Self {
    Self {
      scheduler,
      cache,
      notifier,
      offset,
    }
  }

  pub fn offset(&self) -> Duration {
    self.offset
  }

  /// Enqueues one durable reminder job per occurrence of every new show.
  ///
  /// All submissions are awaited; a failed one is logged and counted without stopping
  /// the others. A fire time already in the past is moved to now.
  pub async fn schedule_for_new_shows(&self, new_shows: &NewShows) -> ScheduleReport {
    let now = Utc::now();
    let pending: Vec<ReminderJobData> = new_shows
      .iter()
      .flat_map(|(_, shows)| shows.iter())
      .flat_map(|show| {
        show.occurrences.iter().map(move |occurrence| {
          let fire_at = (occurrence.start_at - self.offset).max(now);
          ReminderJobData::new(show, occurrence, fire_at)
        })
      })
      .collect();

    let submissions = pending.into_iter().map(|data| async move {
      let key = data.unique_key();
      let payload = serde_json::to_value(&data).map_err(|e| e.to_string())?;
      self
        .scheduler
        .schedule_unique(data.fire_at, REMINDER_JOB, payload, key.clone())
        .await
        .map(|job_id| (key.clone(), job_id))
        .map_err(|e| format!("{key}: {e}"))
    });

    let mut report = ScheduleReport::default();
    for result in join_all(submissions).await {
      match result {
        Ok((key, Some(job_id))) => {
          debug!(unique_key = %key, %job_id, "Scheduled reminder.");
          report.scheduled += 1;
        }
        Ok((key, None)) => {
          debug!(unique_key = %key, "Reminder already scheduled.");
          report.deduplicated += 1;
        }
        Err(reason) => {
          warn!(reason = %reason, "Failed to schedule reminder.");
          report.failed += 1;
        }
      }
    }

    if report.scheduled + report.deduplicated + report.failed > 0 {
      info!(
        scheduled = report.scheduled,
        deduplicated = report.deduplicated,
        failed = report.failed,
        "Scheduled reminders for new shows."
      );
    }
    report
  }

  /// Delivers the reminder described by `data` to every current recipient.
  ///
  /// The show is resolved from the cache; if it is gone the payload snapshot is sent
  /// instead, flagged as possibly stale.
  ///
  /// # Errors
  ///
  /// - [`ReminderError::Recipients`]: recipients could not be resolved.
  /// - [`ReminderError::Delivery`]: at least one delivery failed (the rest were still
  ///   attempted).
  pub async fn fire(&self, data: &ReminderJobData) -> Result<DeliveryReport, ReminderError> {
    let reminder = self.resolve(data);
    let recipients = self
      .notifier
      .recipients(data.region, data.show_id)
      .await
      .map_err(ReminderError::Recipients)?;

    let attempted = recipients.len();
    let mut failed = 0;
    for recipient in &recipients {
      if let Err(e) = self.notifier.deliver(recipient, &reminder).await {
        warn!(%recipient, show_id = data.show_id, error = %e, "Failed to deliver reminder.");
        failed += 1;
      }
    }

    if failed > 0 {
      return Err(ReminderError::Delivery { failed, attempted });
    }

    info!(
      region = %data.region,
      show_id = data.show_id,
      occurrence_id = data.occurrence_id,
      recipients = attempted,
      possibly_stale = reminder.possibly_stale,
      "Delivered reminder."
    );
    Ok(DeliveryReport {
      recipients: attempted,
      possibly_stale: reminder.possibly_stale,
    })
  }

  fn resolve(&self, data: &ReminderJobData) -> Reminder {
    let live = match self.cache.get_show_by_id(data.region, data.show_id) {
      Ok(show) => show.and_then(|show| {
        let occurrence = show.occurrence(data.occurrence_id)?.clone();
        Some((show, occurrence))
      }),
      Err(e) => {
        warn!(region = %data.region, error = %e, "Cache lookup failed for reminder.");
        None
      }
    };

    match live {
      Some((show, occurrence)) => Reminder {
        region: data.region,
        show_id: data.show_id,
        occurrence_id: data.occurrence_id,
        name: show.name.clone(),
        start_at: occurrence.start_at,
        end_at: occurrence.end_at,
        is_last_occurrence: show.is_last_occurrence(occurrence.id),
        possibly_stale: false,
      },
      None => {
        debug!(show_id = data.show_id, occurrence_id = data.occurrence_id, "Show not cached, using snapshot.");
        Reminder {
          region: data.region,
          show_id: data.show_id,
          occurrence_id: data.occurrence_id,
          name: data.fallback.name.clone(),
          start_at: data.fallback.start_at,
          end_at: data.fallback.end_at,
          is_last_occurrence: false,
          possibly_stale: true,
        }
      }
    }
  }
}
