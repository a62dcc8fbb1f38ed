//! Collaborator seams for the chat-platform side of the system.
//!
//! Subscription state and message rendering are owned elsewhere. The core hands plain
//! data to a [`Notifier`] and asks a [`SubscriptionPurger`] to drop per-show state once a
//! show is deleted.

use crate::error::NotifyError;
use crate::region::Region;
use crate::show::{OccurrenceId, Show, ShowId};

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Opaque notification destination (user, channel or role mention).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient(pub String);

impl fmt::Display for Recipient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A fully resolved reminder, ready to be rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
  pub region: Region,
  pub show_id: ShowId,
  pub occurrence_id: OccurrenceId,
  pub name: String,
  pub start_at: DateTime<Utc>,
  pub end_at: DateTime<Utc>,
  /// The occurrence is the final showing of the show.
  pub is_last_occurrence: bool,
  /// Built from the snapshot taken at scheduling time because the show is no longer
  /// cached; the show may have changed or ended.
  pub possibly_stale: bool,
}

#[async_trait]
pub trait Notifier: Send + Sync {
  /// Who should be reminded about `show_id`: auto-reminder subscribers plus explicit
  /// opt-ins, minus anyone who dismissed the show.
  async fn recipients(&self, region: Region, show_id: ShowId) -> Result<Vec<Recipient>, NotifyError>;

  /// Delivers a reminder to one recipient.
  async fn deliver(&self, recipient: &Recipient, reminder: &Reminder) -> Result<(), NotifyError>;

  /// Announces shows first seen by a refresh cycle.
  async fn announce_new_shows(&self, _region: Region, _shows: &[Show]) -> Result<(), NotifyError> {
    Ok(())
  }
}

#[async_trait]
pub trait SubscriptionPurger: Send + Sync {
  /// Removes opt-in/dismissal state tied to a deleted show. Returns the number of
  /// records removed.
  async fn purge_show(&self, region: Region, show_id: ShowId) -> Result<u64, NotifyError>;
}

/// [`Notifier`] that writes reminders and announcements to the log.
///
/// Every reminder goes to a single `log` recipient. Used by the stand-alone binary.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
  async fn recipients(&self, _region: Region, _show_id: ShowId) -> Result<Vec<Recipient>, NotifyError> {
    Ok(vec![Recipient("log".to_string())])
  }

  async fn deliver(&self, recipient: &Recipient, reminder: &Reminder) -> Result<(), NotifyError> {
    info!(
      %recipient,
      region = %reminder.region,
      show_id = reminder.show_id,
      occurrence_id = reminder.occurrence_id,
      name = %reminder.name,
      start_at = %reminder.start_at,
      last = reminder.is_last_occurrence,
      possibly_stale = reminder.possibly_stale,
      "Show starting soon."
    );
    Ok(())
  }

  async fn announce_new_shows(&self, region: Region, shows: &[Show]) -> Result<(), NotifyError> {
    for show in shows {
      info!(%region, show_id = show.id, name = %show.name, start_at = %show.start_at, "New show announced.");
    }
    Ok(())
  }
}

/// [`SubscriptionPurger`] for deployments without subscription storage.
#[derive(Debug, Default, Clone)]
pub struct NoopPurger;

#[async_trait]
impl SubscriptionPurger for NoopPurger {
  async fn purge_show(&self, _region: Region, _show_id: ShowId) -> Result<u64, NotifyError> {
    Ok(0)
  }
}
