//! Log output for the `tapin` binary.
//!
//! Command results own stdout, so log lines always go to stderr. With
//! `--production` a JSON copy of every event is also appended to a daily log
//! file in [`log_directory`].

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Fallback filter when `RUST_LOG` is unset.
pub const LOG_LEVEL_VAR: &str = "TAPIN_LOG_LEVEL";

/// Overrides the directory for production log files.
pub const LOG_DIR_VAR: &str = "TAPIN_LOG_DIR";

/// Flushes the file writer on exit; must outlive the subscriber.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter does not parse, if the log directory cannot
/// be created or written in production mode, or if a subscriber is already
/// installed.
pub fn init(production: bool, default_level: &str) -> anyhow::Result<()> {
    let filter = level_filter(default_level)?;
    let stderr = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_ansi(!production);

    if !production {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr.with_span_events(FmtSpan::CLOSE))
            .try_init()?;
        return Ok(());
    }

    let dir = log_directory()?;
    let (writer, guard) = file_writer(&dir)?;
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .try_init()?;
    let _ = FILE_GUARD.set(guard);
    tracing::debug!(dir = %dir.display(), "Writing JSON logs");
    Ok(())
}

/// `RUST_LOG` if set, otherwise `TAPIN_LOG_LEVEL`, otherwise `default_level`.
fn level_filter(default_level: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = std::env::var(LOG_LEVEL_VAR).unwrap_or_else(|_| default_level.to_string());
    EnvFilter::try_new(&level).with_context(|| format!("Invalid log filter '{level}'"))
}

/// Directory for production log files: `TAPIN_LOG_DIR`, or `logs` under the
/// user's local data directory.
///
/// # Errors
///
/// Returns an error if neither is available.
pub fn log_directory() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os(LOG_DIR_VAR).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    directories::ProjectDirs::from("", "", "tapin")
        .map(|dirs| dirs.data_local_dir().join("logs"))
        .with_context(|| format!("Cannot determine a log directory; set {LOG_DIR_VAR}"))
}

/// Open a non-blocking writer onto `tapin.<date>.log` in `dir`, creating the
/// directory first.
fn file_writer(dir: &Path) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("tapin")
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("Failed to open a log file in {}", dir.display()))?;
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_writer_creates_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("nested").join("logs");

        let (_writer, guard) = file_writer(&dir).unwrap();
        drop(guard);

        assert!(dir.is_dir());
    }

    #[test]
    fn test_file_writer_reports_unusable_directory() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let err = file_writer(&blocker.join("logs")).unwrap_err();
        assert!(err.to_string().contains("Failed to create log directory"));
    }

    #[test]
    fn test_level_filter_uses_default() {
        let filter = level_filter("debug").unwrap();
        assert!(!filter.to_string().is_empty());
    }

    #[test]
    fn test_default_log_directory_is_per_user() {
        if std::env::var_os(LOG_DIR_VAR).is_some() {
            return;
        }
        let Some(base) = directories::BaseDirs::new() else {
            return;
        };
        let dir = log_directory().unwrap();
        assert!(dir.starts_with(base.data_local_dir()), "{}", dir.display());
        assert!(dir.ends_with("logs"));
    }
}
