//! File logging
//!
//! The binaries log to `$XDG_STATE_HOME/foresight/foresight.log.<date>`,
//! rotated daily. Nothing is written to the terminal so CLI output stays clean.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FILE_PREFIX: &str = "foresight.log";

/// Install the global subscriber, writing to the XDG state directory.
///
/// `RUST_LOG` takes precedence over `logging.level`.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    init_in(&Config::state_dir(), config)
}

/// Install the global subscriber, writing to `dir`.
pub fn init_in(dir: &Path, config: &LoggingConfig) -> Result<LoggingGuard> {
    std::fs::create_dir_all(dir)?;
    let (writer, flush) = tracing_appender::non_blocking(rolling_appender(dir, config.max_files)?);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(dir = %dir.display(), level = %config.level, "File logging enabled");
    Ok(LoggingGuard { _flush: flush })
}

fn rolling_appender(dir: &Path, max_files: usize) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(FILE_PREFIX)
        .max_log_files(max_files.max(1))
        .build(dir)
        .map_err(|e| Error::Config(format!("cannot log to {}: {}", dir.display(), e)))
}

/// Subscriber for unit tests; output goes through the test harness capture.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Flushes buffered log lines when dropped; hold it for the life of `main`.
pub struct LoggingGuard {
    _flush: WorkerGuard,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_appender_writes_prefixed_file() {
        let dir = TempDir::new().unwrap();
        let mut appender = rolling_appender(dir.path(), 3).unwrap();
        appender.write_all(b"hello\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with(FILE_PREFIX));
    }

    #[test]
    fn test_log_path_is_in_state_dir() {
        assert!(Config::log_path().starts_with(Config::state_dir()));
    }
}
