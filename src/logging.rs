use crate::infra::{ensure_private_dir, set_private_mode};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_DIR: &str = "logs";
const LOG_FILE: &str = "derun.log";
const DEFAULT_FILTER: &str = "derun=info";

#[derive(Debug, Error)]
pub enum InitLoggingError {
    #[error("failed to prepare log file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to install log subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

pub fn log_path(state_root: &Path) -> PathBuf {
    state_root.join(LOG_DIR).join(LOG_FILE)
}

/// Installs a JSON subscriber appending to `<state_root>/logs/derun.log`.
///
/// The terminal belongs to the child, so nothing is logged there. Keep the
/// returned guard alive until exit or buffered events are lost.
pub fn init_logging(state_root: &Path) -> Result<WorkerGuard, InitLoggingError> {
    let dir = state_root.join(LOG_DIR);
    ensure_private_dir(&dir).map_err(|source| InitLoggingError::Io {
        path: dir.clone(),
        source,
    })?;

    let path = log_path(state_root);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| InitLoggingError::Io {
            path: path.clone(),
            source,
        })?;
    set_private_mode(&path, 0o600).map_err(|source| InitLoggingError::Io { path, source })?;

    let (writer, guard) = tracing_appender::non_blocking(file);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false),
        )
        .try_init()?;

    Ok(guard)
}
