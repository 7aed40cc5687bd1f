//! Error types for teller.

use thiserror::Error;

use crate::state::IllegalTransition;

/// Errors raised by a [`SyncStateManager`](crate::sync_state::SyncStateManager).
#[derive(Error, Debug)]
pub enum SyncStateError {
  /// SQLite error from the backing database.
  #[error("Sync state database error: {0}")]
  Database(#[from] rusqlite::Error),

  /// I/O error while preparing the database location.
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  /// A stored timestamp could not be parsed.
  #[error("Invalid timestamp '{value}' stored for tag '{tag}'")]
  InvalidTimestamp { tag: String, value: String },

  /// The platform data directory could not be determined.
  #[error("Could not determine data directory")]
  NoDataDir,

  /// Failed to acquire the storage lock.
  #[error("Sync state lock poisoned")]
  LockPoisoned,
}

/// Errors returned by repositories.
///
/// Every variant is a precondition violation or an infrastructure failure.
/// Failures of the data source itself are never returned here: they are
/// reported as data, on the next [`CacheState`](crate::state::CacheState).
#[derive(Error, Debug)]
pub enum TellerError {
  /// `refresh` was called before any requirements were set.
  #[error("Requirements are not set")]
  RequirementsNotSet,

  /// The repository attempted a transition its state machine does not allow.
  #[error(transparent)]
  IllegalTransition(#[from] IllegalTransition),

  /// Reading or writing the last-fetched timestamps failed.
  #[error(transparent)]
  SyncState(#[from] SyncStateError),

  /// A background task could not be joined.
  #[error("Background task failed: {0}")]
  Join(String),
}

impl From<tokio::task::JoinError> for TellerError {
  fn from(err: tokio::task::JoinError) -> Self {
    Self::Join(err.to_string())
  }
}

/// Result alias used across the crate.
pub type Result<T, E = TellerError> = std::result::Result<T, E>;
