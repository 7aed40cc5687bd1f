mod config;
mod logging;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};

use teller::sync_state::{SqliteSyncStateManager, SyncRecord, SyncStateManager};

#[derive(Parser, Debug)]
#[command(name = "teller")]
#[command(about = "Inspect and edit the sync state of offline-first caches")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/teller/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Sync state database to use instead of the configured one
  #[arg(short, long)]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List every tag with the time it was last fetched
  List {
    #[arg(long)]
    json: bool,
  },
  /// Show whether a tag has a cache and whether it is too old
  Status {
    tag: String,
    /// Max age in seconds (default from config)
    #[arg(long)]
    max_age: Option<u64>,
    #[arg(long)]
    json: bool,
  },
  /// Mark a tag as fetched just now
  Touch { tag: String },
  /// Forget a tag so its next repository starts with no cache
  Forget { tag: String },
  /// Forget every tag
  Clear,
}

/// Staleness report for one tag.
#[derive(Debug, Serialize)]
struct Status {
  tag: String,
  last_fetched: Option<DateTime<Utc>>,
  max_age_secs: i64,
  too_old: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let database = match args.database {
    Some(path) => path,
    None => config.database_path()?,
  };
  debug!(database = %database.display(), "opening sync state");
  let sync_state = SqliteSyncStateManager::open_at(&database)
    .map_err(|e| eyre!("Failed to open sync state {}: {}", database.display(), e))?;

  match args.command {
    Command::List { json } => list(&sync_state, json)?,
    Command::Status { tag, max_age, json } => {
      let max_age = match max_age {
        Some(secs) => config::max_age_from_secs(secs)?,
        None => config.default_max_age()?,
      };
      status(&sync_state, tag, max_age, json)?;
    }
    Command::Touch { tag } => {
      let now = Utc::now();
      sync_state.update_age_of_data(&tag, now)?;
      info!(tag = %tag, "marked as fetched");
      println!("{}  {}", tag, now.to_rfc3339());
    }
    Command::Forget { tag } => {
      sync_state.forget(&tag)?;
      info!(tag = %tag, "forgotten");
    }
    Command::Clear => {
      let count = sync_state.records()?.len();
      sync_state.clear()?;
      info!(count, "cleared sync state");
    }
  }

  Ok(())
}

fn list(sync_state: &dyn SyncStateManager, json: bool) -> Result<()> {
  let records = sync_state.records()?;
  if json {
    println!("{}", serde_json::to_string_pretty(&records)?);
    return Ok(());
  }
  if records.is_empty() {
    println!("No tags have been fetched");
    return Ok(());
  }

  let width = records.iter().map(|r| r.tag.len()).max().unwrap_or(0);
  for SyncRecord { tag, last_fetched } in records {
    println!("{:width$}  {}", tag, last_fetched.to_rfc3339(), width = width);
  }
  Ok(())
}

fn status(
  sync_state: &dyn SyncStateManager,
  tag: String,
  max_age: chrono::Duration,
  json: bool,
) -> Result<()> {
  let status = Status {
    last_fetched: sync_state.last_time_fetched_data(&tag)?,
    too_old: sync_state.is_data_too_old(&tag, max_age)?,
    max_age_secs: max_age.num_seconds(),
    tag,
  };

  if json {
    println!("{}", serde_json::to_string_pretty(&status)?);
    return Ok(());
  }

  match status.last_fetched {
    Some(last_fetched) => {
      let verdict = if status.too_old { "too old" } else { "fresh" };
      println!(
        "{}: last fetched {} ({})",
        status.tag,
        last_fetched.to_rfc3339(),
        verdict
      );
    }
    None => println!("{}: never fetched", status.tag),
  }
  Ok(())
}
