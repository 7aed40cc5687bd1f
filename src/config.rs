use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use teller::sync_state::SqliteSyncStateManager;

/// Environment variable overriding the database path from the config file.
const DATABASE_ENV: &str = "TELLER_DATABASE";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Sync state database (defaults to the platform data directory)
  pub database: Option<PathBuf>,
  /// Max age used by `status` when `--max-age` is not given
  pub default_max_age_secs: u64,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      database: None,
      default_max_age_secs: 60 * 60,
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// `tracing` filter directives, overridden by TELLER_LOG
  pub filter: String,
  /// Also write daily rolling log files here
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      filter: "teller=info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./teller.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/teller/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("teller.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("teller").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file is a valid, default config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Resolve the sync state database path.
  ///
  /// Checks TELLER_DATABASE first, then the config file, then falls back to
  /// the platform data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Ok(path) = std::env::var(DATABASE_ENV) {
      return Ok(PathBuf::from(path));
    }
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }
    SqliteSyncStateManager::default_path()
      .map_err(|e| eyre!("Could not locate sync state database: {}", e))
  }

  pub fn default_max_age(&self) -> Result<chrono::Duration> {
    max_age_from_secs(self.default_max_age_secs)
  }
}

/// Convert a max age given in seconds, rejecting values chrono cannot hold.
pub fn max_age_from_secs(secs: u64) -> Result<chrono::Duration> {
  i64::try_from(secs)
    .ok()
    .and_then(chrono::Duration::try_seconds)
    .ok_or_else(|| eyre!("Max age of {} seconds is too large", secs))
}
