//! File logging for the binary. stdout is reserved for command output.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_ENV: &str = "TALLY_LOG";

/// Directory for the rolling log files: $XDG_DATA_HOME/tally/logs
pub fn log_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .map(|d| d.join("tally").join("logs"))
    .ok_or_else(|| eyre!("Could not determine data directory"))
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// so buffered lines are flushed.
pub fn init(config_filter: &str) -> Result<WorkerGuard> {
  let dir = log_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "tally.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(build_filter(config_filter))
    .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}

/// `TALLY_LOG` wins over the configured filter; an unparseable value falls
/// through to the next source.
fn build_filter(config_filter: &str) -> EnvFilter {
  if let Ok(directives) = std::env::var(LOG_ENV) {
    if let Ok(filter) = EnvFilter::try_new(&directives) {
      return filter;
    }
  }
  EnvFilter::try_new(config_filter).unwrap_or_else(|_| EnvFilter::new("info"))
}
