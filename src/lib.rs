//! Offline-first cache synchronization.
//!
//! A [`Repository`](repository::Repository) binds a cache key (its
//! requirements) to a lifecycle state machine, decides when the cache must
//! be fetched again, and publishes [`CacheState`](state::CacheState)
//! snapshots to any number of observers. Fetches are single-flight per tag
//! through a [`RefreshManager`](refresh::RefreshManager), and the time of
//! each tag's last successful fetch is kept by a
//! [`SyncStateManager`](sync_state::SyncStateManager).

pub mod error;
pub mod paging;
pub mod refresh;
pub mod repository;
pub mod state;
pub mod sync_state;
pub mod testing;

pub use error::{Result, SyncStateError, TellerError};
