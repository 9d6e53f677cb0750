//! Logging configuration using tracing
//!
//! Logs go to stderr and to a daily rolling file. Filtering follows RUST_LOG
//! and defaults to "warn".

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// When `log_dir` is given, a `dashcache.log.<date>` file is written there
/// as well. Keep the returned guard alive until exit so buffered file output
/// is flushed.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  let stderr_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "dashcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_ansi(false).with_writer(writer);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

  Ok(guard)
}

/// Directory for log files next to the default cache database.
pub fn default_log_dir() -> Option<std::path::PathBuf> {
  dirs::data_dir().map(|d| d.join("dashcache").join("logs"))
}
