use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the watcher, its control protocol and the daemon runtime.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// Directory validation, marker or configuration failure.
    #[error(transparent)]
    Core(#[from] sysvol_core::CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },

    #[error("watcher is already running")]
    AlreadyRunning,

    #[error("watcher is already stopping or not running")]
    NotRunning,

    #[error("failed to watch directory {path:?}: {reason}")]
    WatchInit { path: PathBuf, reason: String },

    /// A changed path lies outside every configured root.
    #[error("no root directory matches {path:?}")]
    NoMatchingRoot { path: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
