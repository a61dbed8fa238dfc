//! Tracing setup: a compact stdout layer plus a non-blocking file layer.
//!
//! `RUST_LOG` filters both (default `info`). The file is `DOCPIPE_LOG_FILE` when set, otherwise
//! `logs/docpipe.log`; missing parent directories are created.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE_ENV: &str = "DOCPIPE_LOG_FILE";
const DEFAULT_LOG_FILE: &str = "logs/docpipe.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Later calls are no-ops.
///
/// Stage targets are only written to the file, where module paths help when reading a batch run
/// after the fact.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let path = log_file_path(std::env::var(LOG_FILE_ENV).ok());
    let file_layer = match open_writer(&path) {
        Ok(writer) => Some(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .compact(),
        ),
        Err(error) => {
            eprintln!("File logging disabled, cannot open {}: {error}", path.display());
            None
        }
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .with(file_layer)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Log file location for an optional `DOCPIPE_LOG_FILE` value; blank counts as unset.
pub fn log_file_path(configured: Option<String>) -> PathBuf {
    configured
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_LOG_FILE), PathBuf::from)
}

fn open_writer(path: &Path) -> io::Result<NonBlocking> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    // Only the first subscriber's writer is ever used.
    let _ = FILE_GUARD.set(guard);
    Ok(writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_or_missing_setting_uses_default_file() {
        assert_eq!(log_file_path(None), PathBuf::from("logs/docpipe.log"));
        assert_eq!(log_file_path(Some("  ".into())), PathBuf::from("logs/docpipe.log"));
        assert_eq!(
            log_file_path(Some("/var/log/docpipe.log".into())),
            PathBuf::from("/var/log/docpipe.log")
        );
    }

    #[test]
    fn writer_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/run.log");
        open_writer(&path).unwrap();
        assert!(path.exists());
    }
}
