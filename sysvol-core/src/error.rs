//! Error types for sysvol-core.

use std::path::PathBuf;

use thiserror::Error;

/// Why a marker document did not yield a version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionParseError {
    #[error("no Version key in [General] section")]
    Missing,

    #[error("version is not a non-negative integer: {0:?}")]
    NotAnInteger(String),
}

/// All errors that can arise from marker and configuration operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The marker exists but its `Version` key is absent or malformed.
    #[error("invalid version marker {path}: {source}")]
    Version {
        path: PathBuf,
        #[source]
        source: VersionParseError,
    },

    /// Bumping would overflow the version counter.
    #[error("version counter overflow in {path}")]
    VersionOverflow { path: PathBuf },

    /// YAML serialization error (config save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("needs at least one directory to watch")]
    NoDirectories,

    #[error("directory {path:?} does not exist")]
    DirectoryNotFound { path: PathBuf },

    /// `dirs::config_dir()` returned `None`.
    #[error("cannot determine configuration directory; set $HOME or equivalent")]
    ConfigDirNotFound,

    #[error("invalid bundle name {name:?}: {reason}")]
    InvalidBundleName { name: String, reason: &'static str },
}

impl CoreError {
    /// True when the error is an I/O "not found" on the annotated path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Convenience constructor for [`CoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}
