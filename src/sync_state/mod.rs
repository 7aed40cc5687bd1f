//! Per-tag record of the last successful fetch, used to decide staleness.
//!
//! This module provides:
//! - The [`SyncStateManager`] trait, keyed purely by tag string
//! - A durable SQLite implementation for applications
//! - An in-memory implementation for tests and ephemeral caches

mod storage;
mod traits;

pub use storage::{InMemorySyncStateManager, SqliteSyncStateManager};
pub use traits::{SyncRecord, SyncStateManager};
