//! Sync state storage backends: SQLite for durable use, in-memory for tests.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::traits::{SyncRecord, SyncStateManager};
use crate::error::SyncStateError;

/// Sync state kept in memory only. Nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemorySyncStateManager {
  records: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl InMemorySyncStateManager {
  pub fn new() -> Self {
    Self::default()
  }

  fn records_guard(&self) -> Result<MutexGuard<'_, BTreeMap<String, DateTime<Utc>>>, SyncStateError> {
    self.records.lock().map_err(|_| SyncStateError::LockPoisoned)
  }
}

impl SyncStateManager for InMemorySyncStateManager {
  fn last_time_fetched_data(&self, tag: &str) -> Result<Option<DateTime<Utc>>, SyncStateError> {
    Ok(self.records_guard()?.get(tag).copied())
  }

  fn update_age_of_data(&self, tag: &str, fetched_at: DateTime<Utc>) -> Result<(), SyncStateError> {
    self.records_guard()?.insert(tag.to_string(), fetched_at);
    Ok(())
  }

  fn records(&self) -> Result<Vec<SyncRecord>, SyncStateError> {
    Ok(
      self
        .records_guard()?
        .iter()
        .map(|(tag, last_fetched)| SyncRecord {
          tag: tag.clone(),
          last_fetched: *last_fetched,
        })
        .collect(),
    )
  }

  fn forget(&self, tag: &str) -> Result<(), SyncStateError> {
    self.records_guard()?.remove(tag);
    Ok(())
  }

  fn clear(&self) -> Result<(), SyncStateError> {
    self.records_guard()?.clear();
    Ok(())
  }
}

/// SQLite-based sync state storage.
pub struct SqliteSyncStateManager {
  conn: Mutex<Connection>,
}

impl SqliteSyncStateManager {
  /// Open the sync state database at the default location.
  pub fn open() -> Result<Self, SyncStateError> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the sync state database at `path`.
  pub fn open_at(path: &Path) -> Result<Self, SyncStateError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "opened sync state database");

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Open a private in-memory SQLite database. Useful for tests that want
  /// the SQL path without touching disk.
  pub fn open_in_memory() -> Result<Self, SyncStateError> {
    let storage = Self {
      conn: Mutex::new(Connection::open_in_memory()?),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, SyncStateError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(SyncStateError::NoDataDir)?;

    Ok(data_dir.join("teller").join("sync_state.db"))
  }

  /// Run database migrations for the sync state table.
  fn run_migrations(&self) -> Result<(), SyncStateError> {
    self.conn()?.execute_batch(SYNC_STATE_SCHEMA)?;
    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, SyncStateError> {
    self.conn.lock().map_err(|_| SyncStateError::LockPoisoned)
  }
}

/// Schema for the sync state table.
const SYNC_STATE_SCHEMA: &str = r#"
-- Last successful fetch per tag (RFC 3339, UTC)
CREATE TABLE IF NOT EXISTS sync_state (
    tag TEXT PRIMARY KEY,
    last_fetched TEXT NOT NULL
);
"#;

impl SyncStateManager for SqliteSyncStateManager {
  fn last_time_fetched_data(&self, tag: &str) -> Result<Option<DateTime<Utc>>, SyncStateError> {
    let conn = self.conn()?;
    let value: Option<String> = conn
      .query_row(
        "SELECT last_fetched FROM sync_state WHERE tag = ?",
        params![tag],
        |row| row.get(0),
      )
      .optional()?;

    value.map(|value| parse_datetime(tag, &value)).transpose()
  }

  fn update_age_of_data(&self, tag: &str, fetched_at: DateTime<Utc>) -> Result<(), SyncStateError> {
    self.conn()?.execute(
      "INSERT OR REPLACE INTO sync_state (tag, last_fetched) VALUES (?, ?)",
      params![tag, fetched_at.to_rfc3339()],
    )?;
    Ok(())
  }

  fn records(&self) -> Result<Vec<SyncRecord>, SyncStateError> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT tag, last_fetched FROM sync_state ORDER BY tag")?;

    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(tag, value)| {
        let last_fetched = parse_datetime(&tag, &value)?;
        Ok(SyncRecord { tag, last_fetched })
      })
      .collect()
  }

  fn forget(&self, tag: &str) -> Result<(), SyncStateError> {
    self
      .conn()?
      .execute("DELETE FROM sync_state WHERE tag = ?", params![tag])?;
    Ok(())
  }

  fn clear(&self) -> Result<(), SyncStateError> {
    self.conn()?.execute("DELETE FROM sync_state", [])?;
    Ok(())
  }
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(tag: &str, value: &str) -> Result<DateTime<Utc>, SyncStateError> {
  DateTime::parse_from_rfc3339(value)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| SyncStateError::InvalidTimestamp {
      tag: tag.to_string(),
      value: value.to_string(),
    })
}
