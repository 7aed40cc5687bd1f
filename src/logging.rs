//! Tracing setup for the `teller` binary.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;

/// Environment variable overriding the configured filter.
const FILTER_ENV: &str = "TELLER_LOG";

/// Install the global subscriber. Logs go to stderr, and to a daily rolling
/// file when a directory is configured.
///
/// The returned guard flushes the file writer and must be kept alive until
/// exit.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env(FILTER_ENV)
    .or_else(|_| EnvFilter::try_new(&config.filter))
    .map_err(|e| eyre!("Invalid log filter '{}': {}", config.filter, e))?;

  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

  let (file, guard) = match &config.directory {
    Some(directory) => {
      let appender = tracing_appender::rolling::daily(directory, "teller.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_writer(writer).with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr)
    .with(file)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
