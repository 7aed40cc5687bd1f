//! Core trait and types for sync state tracking.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::SyncStateError;

/// Last successful fetch recorded for one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRecord {
  /// Tag of the requirements that were fetched
  pub tag: String,
  /// When the fetch was saved
  pub last_fetched: DateTime<Utc>,
}

/// Durable map from tag to the time of its last successful fetch.
///
/// Everything is keyed by the tag string alone; implementations know nothing
/// about cache contents.
pub trait SyncStateManager: Send + Sync {
  /// When `tag` was last fetched, if ever.
  fn last_time_fetched_data(&self, tag: &str) -> Result<Option<DateTime<Utc>>, SyncStateError>;

  /// Record that `tag` was successfully fetched at `fetched_at`.
  fn update_age_of_data(&self, tag: &str, fetched_at: DateTime<Utc>) -> Result<(), SyncStateError>;

  /// All recorded tags, ordered by tag.
  fn records(&self) -> Result<Vec<SyncRecord>, SyncStateError>;

  /// Drop the record for `tag`. The next repository to use it starts from
  /// "no cache".
  fn forget(&self, tag: &str) -> Result<(), SyncStateError>;

  /// Drop every record.
  fn clear(&self) -> Result<(), SyncStateError>;

  fn has_ever_fetched_data(&self, tag: &str) -> Result<bool, SyncStateError> {
    Ok(self.last_time_fetched_data(tag)?.is_some())
  }

  /// True if `tag` was never fetched, or was fetched more than `max_age` ago.
  fn is_data_too_old(&self, tag: &str, max_age: Duration) -> Result<bool, SyncStateError> {
    Ok(match self.last_time_fetched_data(tag)? {
      Some(last_fetched) => is_older_than(last_fetched, max_age, Utc::now()),
      None => true,
    })
  }
}

/// Check if `last_fetched` is more than `max_age` before `now`.
fn is_older_than(last_fetched: DateTime<Utc>, max_age: Duration, now: DateTime<Utc>) -> bool {
  now - last_fetched > max_age
}
