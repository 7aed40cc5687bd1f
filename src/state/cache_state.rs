//! Point-in-time snapshot of a cache's lifecycle.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::machine::{
  CacheContents, FetchingFreshCacheState, IllegalTransition, Machine, NoCacheState, StateMachine,
};

/// Which branch of the lifecycle a snapshot is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
  /// Sentinel: no requirements set, nothing is being observed.
  None,
  /// Nothing has ever been saved for the current requirements.
  NoCache,
  /// A cache has been saved at least once.
  CacheExists,
}

/// Immutable snapshot of a cache's lifecycle.
///
/// Snapshots are never built ad hoc by the repository: they come from one of
/// the entry constructors when requirements change, or from a transition on
/// the previous snapshot's [`StateMachine`].
pub struct CacheState<C, E> {
  machine: Option<StateMachine<C>>,
  pub(crate) just_finished_first_fetch: bool,
  pub(crate) just_finished_successful_refresh: bool,
  pub(crate) refresh_error: Option<Arc<E>>,
}

impl<C, E> CacheState<C, E> {
  /// The sentinel snapshot meaning "not observing any requirements".
  ///
  /// Reports `cache_exists() == true` with no age, and has no machine to
  /// transition from. Observer streams never deliver it.
  pub fn none() -> Self {
    Self {
      machine: None,
      just_finished_first_fetch: false,
      just_finished_successful_refresh: false,
      refresh_error: None,
    }
  }

  /// Entry state for requirements that have never been fetched.
  pub fn no_cache_exists() -> Self {
    Self::from_machine(Machine::NoCache(NoCacheState::NoCacheExists))
  }

  /// Entry state for requirements fetched before, not observed yet.
  pub fn cache_exists_since(last_fetched: DateTime<Utc>) -> Self {
    Self::from_machine(Machine::CacheExists {
      contents: CacheContents::NotObserved,
      last_fetched,
      fetching: FetchingFreshCacheState::NotFetching,
    })
  }

  pub(crate) fn from_machine(machine: Machine<C>) -> Self {
    Self {
      machine: Some(StateMachine::new(machine)),
      just_finished_first_fetch: false,
      just_finished_successful_refresh: false,
      refresh_error: None,
    }
  }

  /// Handle used to produce the next snapshot.
  ///
  /// Fails for the sentinel, which has nothing to transition from.
  pub fn change(&self) -> Result<&StateMachine<C>, IllegalTransition> {
    self.machine.as_ref().ok_or_else(|| IllegalTransition {
      transition: "change",
      state: "none (no requirements set)".to_string(),
    })
  }

  pub fn status(&self) -> CacheStatus {
    match self.machine.as_ref().map(|m| &m.machine) {
      None => CacheStatus::None,
      Some(Machine::NoCache(_)) => CacheStatus::NoCache,
      Some(Machine::CacheExists { .. }) => CacheStatus::CacheExists,
    }
  }

  /// True for the sentinel snapshot.
  pub fn is_none(&self) -> bool {
    self.machine.is_none()
  }

  /// Whether a cache has ever been saved for these requirements.
  pub fn cache_exists(&self) -> bool {
    !matches!(self.status(), CacheStatus::NoCache)
  }

  /// When the cache was last successfully fetched.
  pub fn cache_age(&self) -> Option<DateTime<Utc>> {
    match self.machine.as_ref().map(|m| &m.machine) {
      Some(Machine::CacheExists { last_fetched, .. }) => Some(*last_fetched),
      _ => None,
    }
  }

  /// The last observed cache value. `None` when no cache exists, when the
  /// cache has not been observed yet, or when it was observed empty.
  pub fn cache(&self) -> Option<&C> {
    match self.machine.as_ref().map(|m| &m.machine) {
      Some(Machine::CacheExists {
        contents: CacheContents::Data(cache),
        ..
      }) => Some(cache),
      _ => None,
    }
  }

  /// Whether the last observation found an empty cache.
  pub fn is_cache_empty(&self) -> bool {
    matches!(
      self.machine.as_ref().map(|m| &m.machine),
      Some(Machine::CacheExists {
        contents: CacheContents::Empty,
        ..
      })
    )
  }

  /// Whether a fetch is in flight, first fetch or refresh.
  pub fn is_refreshing(&self) -> bool {
    self.is_fetching_first_cache() || self.is_fetching_fresh_cache()
  }

  pub fn is_fetching_first_cache(&self) -> bool {
    matches!(
      self.machine.as_ref().map(|m| &m.machine),
      Some(Machine::NoCache(NoCacheState::IsFetching))
    )
  }

  pub fn is_fetching_fresh_cache(&self) -> bool {
    matches!(
      self.machine.as_ref().map(|m| &m.machine),
      Some(Machine::CacheExists {
        fetching: FetchingFreshCacheState::IsFetching,
        ..
      })
    )
  }

  pub fn just_finished_first_fetch(&self) -> bool {
    self.just_finished_first_fetch
  }

  pub fn just_finished_successful_refresh(&self) -> bool {
    self.just_finished_successful_refresh
  }

  /// Error of the fetch (or save) that just failed. Only set on the snapshot
  /// right after the failure.
  pub fn refresh_error(&self) -> Option<&Arc<E>> {
    self.refresh_error.as_ref()
  }
}

impl<C: Clone, E> Clone for CacheState<C, E> {
  fn clone(&self) -> Self {
    Self {
      machine: self.machine.clone(),
      just_finished_first_fetch: self.just_finished_first_fetch,
      just_finished_successful_refresh: self.just_finished_successful_refresh,
      refresh_error: self.refresh_error.clone(),
    }
  }
}

impl<C, E> Default for CacheState<C, E> {
  fn default() -> Self {
    Self::none()
  }
}

impl<C: fmt::Debug, E: fmt::Debug> fmt::Debug for CacheState<C, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheState")
      .field("status", &self.status())
      .field("is_refreshing", &self.is_refreshing())
      .field("cache_age", &self.cache_age())
      .field("cache", &self.cache())
      .field("just_finished_first_fetch", &self.just_finished_first_fetch)
      .field(
        "just_finished_successful_refresh",
        &self.just_finished_successful_refresh,
      )
      .field("refresh_error", &self.refresh_error)
      .finish()
  }
}
