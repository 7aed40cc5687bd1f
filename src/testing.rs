//! Helpers for putting a repository's storage into a known state in tests.
//!
//! These touch the data source and sync state directly, the same way a
//! successful refresh would, without going through a repository.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::SyncStateError;
use crate::repository::{DataSource, Requirements};
use crate::sync_state::SyncStateManager;

/// Seeding failed in the data source or in the sync state.
#[derive(Debug, Error)]
pub enum SeedError<E: std::error::Error + 'static> {
  #[error("saving seeded cache failed: {0}")]
  Save(#[source] E),

  #[error(transparent)]
  SyncState(#[from] SyncStateError),
}

/// Save `fetched` as the cache for `requirements` and record it as fetched
/// at `fetched_at`.
///
/// Pass a `fetched_at` older than the data source's max age to get a cache
/// that a repository will refresh as soon as it sees it.
pub fn seed_cache<D: DataSource>(
  data_source: &D,
  sync_state: &dyn SyncStateManager,
  requirements: &D::Requirements,
  fetched: &D::FetchResult,
  fetched_at: DateTime<Utc>,
) -> Result<(), SeedError<D::Error>> {
  data_source
    .save_cache(fetched, requirements)
    .map_err(SeedError::Save)?;
  sync_state.update_age_of_data(&requirements.tag(), fetched_at)?;
  Ok(())
}

/// Make `requirements` look like they were never fetched. Whatever the data
/// source holds is left alone.
pub fn seed_no_cache<R: Requirements>(
  sync_state: &dyn SyncStateManager,
  requirements: &R,
) -> Result<(), SyncStateError> {
  sync_state.forget(&requirements.tag())
}
