//! Log output for Undertow processes.
//!
//! Two sinks: the console, filtered to the level picked on the command line
//! (or `RUST_LOG`), and `undertow-last-run.log`, rewritten on every start.
//! The file keeps undertow's own crates at `trace` and everything else at
//! `debug` so a stalled transcode can be reconstructed after the fact.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub const LOG_FILE_NAME: &str = "undertow-last-run.log";

const DEFAULT_LOGS_DIR: &str = "logs";
const FILE_DIRECTIVES: &str = "debug,undertow=trace,undertow_core=trace,undertow_web=trace";

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Cannot open log file {path}: {reason}")]
    LogFile { path: PathBuf, reason: String },

    #[error("A global tracing subscriber is already installed")]
    AlreadyInstalled,
}

/// Where the run log goes for a given `--logs-dir`.
pub fn log_file_path(logs_dir: Option<&Path>) -> PathBuf {
    logs_dir
        .unwrap_or_else(|| Path::new(DEFAULT_LOGS_DIR))
        .join(LOG_FILE_NAME)
}

/// Installs the console and run-log subscribers process-wide.
///
/// # Errors
/// - `TracingError::LogFile` - Logs directory or file cannot be created
/// - `TracingError::AlreadyInstalled` - Called twice in one process
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> Result<(), TracingError> {
    let path = log_file_path(logs_dir);
    let log_file = open_log_file(&path)?;

    tracing_subscriber::registry()
        .with(console_layer(console_level))
        .with(file_layer(log_file))
        .try_init()
        .map_err(|_| TracingError::AlreadyInstalled)?;

    tracing::info!("Logging at {} to console, full log in {}", console_level, path.display());
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File, TracingError> {
    let to_error = |e: std::io::Error| TracingError::LogFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(to_error)?;
    }
    File::create(path).map_err(to_error)
}

fn console_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()))
}

fn console_layer(level: Level) -> impl Layer<Registry> + Send + Sync {
    fmt::layer()
        .compact()
        .with_target(false)
        .with_filter(console_filter(level))
}

fn file_layer<S>(file: File) -> impl Layer<S> + Send + Sync
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    fmt::layer()
        .with_ansi(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(file)
        .with_filter(EnvFilter::new(FILE_DIRECTIVES))
}

/// `--log-level` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        self.into()
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_tracing_level().as_str().to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_level_conversion() {
        assert_eq!(Level::from(CliLogLevel::Error), Level::ERROR);
        assert_eq!(CliLogLevel::Trace.as_tracing_level(), Level::TRACE);
        assert_eq!(CliLogLevel::Warn.to_string(), "warn");
    }

    #[test]
    fn test_log_file_path_defaults_to_logs_dir() {
        assert_eq!(log_file_path(None), Path::new("logs").join(LOG_FILE_NAME));
        assert_eq!(
            log_file_path(Some(Path::new("/var/log/undertow"))),
            Path::new("/var/log/undertow/undertow-last-run.log")
        );
    }

    #[test]
    fn test_log_file_created_with_missing_parents() {
        let dir = tempdir().unwrap();
        let path = log_file_path(Some(&dir.path().join("nested/logs")));

        open_log_file(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_file_directives_parse() {
        assert!(EnvFilter::try_new(FILE_DIRECTIVES).is_ok());
    }
}
