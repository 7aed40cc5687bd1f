//! Transition machine attached to every non-sentinel [`CacheState`].
//!
//! The machine is a closed set of sub-machines. A key starts in the
//! `NoCache` branch and crosses into `CacheExists` exactly once, when the
//! first fetch succeeds. Both branches are variants of one enum, so they can
//! never be active at the same time.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::cache_state::CacheState;

/// A transition was requested from a state where it is not allowed.
///
/// This is always an orchestration bug, never a runtime failure of the data
/// source.
#[derive(Debug, Clone, Error)]
#[error("illegal transition `{transition}` from state: {state}")]
pub struct IllegalTransition {
  /// Name of the transition that was attempted
  pub transition: &'static str,
  /// Human readable description of the state the machine was in
  pub state: String,
}

/// Sub-machine used until a cache has been saved for the first time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NoCacheState {
  NoCacheExists,
  IsFetching,
}

/// What the last observation of the cache produced.
#[derive(Debug, Clone)]
pub(crate) enum CacheContents<C> {
  /// Cache exists on disk but has not been read since requirements were set
  NotObserved,
  Empty,
  Data(C),
}

/// Sub-machine tracking a refresh of an existing cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchingFreshCacheState {
  NotFetching,
  IsFetching,
}

#[derive(Debug, Clone)]
pub(crate) enum Machine<C> {
  NoCache(NoCacheState),
  CacheExists {
    contents: CacheContents<C>,
    last_fetched: DateTime<Utc>,
    fetching: FetchingFreshCacheState,
  },
}

/// The only legal way to produce the next [`CacheState`].
///
/// Obtained through [`CacheState::change`]. Each transition returns a fresh
/// snapshot; one-shot flags (`just_finished_*`, `refresh_error`) are set only
/// on the snapshot a completing transition returns and are never stored in
/// the machine itself.
#[derive(Debug, Clone)]
pub struct StateMachine<C> {
  pub(crate) machine: Machine<C>,
}

impl<C> StateMachine<C> {
  pub(crate) fn new(machine: Machine<C>) -> Self {
    Self { machine }
  }

  fn illegal(&self, transition: &'static str) -> IllegalTransition {
    IllegalTransition {
      transition,
      state: self.to_string(),
    }
  }
}

impl<C: Clone> StateMachine<C> {
  /// Begin (or re-enter) the first fetch of a key that has no cache.
  pub fn first_fetch<E>(&self) -> Result<CacheState<C, E>, IllegalTransition> {
    match &self.machine {
      Machine::NoCache(_) => Ok(CacheState::from_machine(Machine::NoCache(
        NoCacheState::IsFetching,
      ))),
      Machine::CacheExists { .. } => Err(self.illegal("first_fetch")),
    }
  }

  /// The first fetch was saved. Leaves the `NoCache` branch for good.
  pub fn successful_first_fetch<E>(
    &self,
    fetched_at: DateTime<Utc>,
  ) -> Result<CacheState<C, E>, IllegalTransition> {
    match &self.machine {
      Machine::NoCache(NoCacheState::IsFetching) => {
        let mut state = CacheState::from_machine(Machine::CacheExists {
          contents: CacheContents::NotObserved,
          last_fetched: fetched_at,
          fetching: FetchingFreshCacheState::NotFetching,
        });
        state.just_finished_first_fetch = true;
        Ok(state)
      }
      _ => Err(self.illegal("successful_first_fetch")),
    }
  }

  /// The first fetch failed. There is no cache to keep, so the key goes back
  /// to `NoCacheExists`.
  pub fn failed_first_fetch<E>(
    &self,
    error: Arc<E>,
  ) -> Result<CacheState<C, E>, IllegalTransition> {
    match &self.machine {
      Machine::NoCache(NoCacheState::IsFetching) => {
        let mut state = CacheState::from_machine(Machine::NoCache(NoCacheState::NoCacheExists));
        state.refresh_error = Some(error);
        Ok(state)
      }
      _ => Err(self.illegal("failed_first_fetch")),
    }
  }

  /// The observed cache is empty.
  pub fn cache_is_empty<E>(&self) -> Result<CacheState<C, E>, IllegalTransition> {
    self.observed("cache_is_empty", CacheContents::Empty)
  }

  /// The observed cache holds `cache`.
  pub fn cached_data<E>(&self, cache: C) -> Result<CacheState<C, E>, IllegalTransition> {
    self.observed("cached_data", CacheContents::Data(cache))
  }

  fn observed<E>(
    &self,
    transition: &'static str,
    contents: CacheContents<C>,
  ) -> Result<CacheState<C, E>, IllegalTransition> {
    match &self.machine {
      Machine::CacheExists {
        last_fetched,
        fetching,
        ..
      } => Ok(CacheState::from_machine(Machine::CacheExists {
        contents,
        last_fetched: *last_fetched,
        fetching: *fetching,
      })),
      Machine::NoCache(_) => Err(self.illegal(transition)),
    }
  }

  /// Begin refreshing an existing cache.
  pub fn fetching_fresh_cache<E>(&self) -> Result<CacheState<C, E>, IllegalTransition> {
    match &self.machine {
      Machine::CacheExists {
        contents,
        last_fetched,
        fetching: FetchingFreshCacheState::NotFetching,
      } => Ok(CacheState::from_machine(Machine::CacheExists {
        contents: contents.clone(),
        last_fetched: *last_fetched,
        fetching: FetchingFreshCacheState::IsFetching,
      })),
      _ => Err(self.illegal("fetching_fresh_cache")),
    }
  }

  /// The refresh of an existing cache was saved at `fetched_at`.
  pub fn successful_fetching_fresh_cache<E>(
    &self,
    fetched_at: DateTime<Utc>,
  ) -> Result<CacheState<C, E>, IllegalTransition> {
    match &self.machine {
      Machine::CacheExists {
        contents,
        fetching: FetchingFreshCacheState::IsFetching,
        ..
      } => {
        let mut state = CacheState::from_machine(Machine::CacheExists {
          contents: contents.clone(),
          last_fetched: fetched_at,
          fetching: FetchingFreshCacheState::NotFetching,
        });
        state.just_finished_successful_refresh = true;
        Ok(state)
      }
      _ => Err(self.illegal("successful_fetching_fresh_cache")),
    }
  }

  /// The refresh of an existing cache failed. The last known cache and its
  /// age are kept.
  pub fn fail_fetching_fresh_cache<E>(
    &self,
    error: Arc<E>,
  ) -> Result<CacheState<C, E>, IllegalTransition> {
    match &self.machine {
      Machine::CacheExists {
        contents,
        last_fetched,
        fetching: FetchingFreshCacheState::IsFetching,
      } => {
        let mut state = CacheState::from_machine(Machine::CacheExists {
          contents: contents.clone(),
          last_fetched: *last_fetched,
          fetching: FetchingFreshCacheState::NotFetching,
        });
        state.refresh_error = Some(error);
        Ok(state)
      }
      _ => Err(self.illegal("fail_fetching_fresh_cache")),
    }
  }

  /// The fetch in progress was cancelled. Goes back to the state it started
  /// from, with no flags and no error.
  pub fn cancelled_fetch<E>(&self) -> Result<CacheState<C, E>, IllegalTransition> {
    match &self.machine {
      Machine::NoCache(NoCacheState::IsFetching) => Ok(CacheState::from_machine(Machine::NoCache(
        NoCacheState::NoCacheExists,
      ))),
      Machine::CacheExists {
        contents,
        last_fetched,
        fetching: FetchingFreshCacheState::IsFetching,
      } => Ok(CacheState::from_machine(Machine::CacheExists {
        contents: contents.clone(),
        last_fetched: *last_fetched,
        fetching: FetchingFreshCacheState::NotFetching,
      })),
      _ => Err(self.illegal("cancelled_fetch")),
    }
  }
}

impl<C> fmt::Display for StateMachine<C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.machine {
      Machine::NoCache(NoCacheState::NoCacheExists) => write!(f, "no cache exists, not fetching"),
      Machine::NoCache(NoCacheState::IsFetching) => write!(f, "no cache exists, fetching first cache"),
      Machine::CacheExists {
        contents,
        last_fetched,
        fetching,
      } => {
        let contents = match contents {
          CacheContents::NotObserved => "not observed yet",
          CacheContents::Empty => "empty",
          CacheContents::Data(_) => "has data",
        };
        let fetching = match fetching {
          FetchingFreshCacheState::NotFetching => "not fetching",
          FetchingFreshCacheState::IsFetching => "fetching fresh cache",
        };
        write!(
          f,
          "cache exists ({}), last fetched {}, {}",
          contents,
          last_fetched.to_rfc3339(),
          fetching
        )
      }
    }
  }
}
