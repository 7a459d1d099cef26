//! Error types for sysvol-sync.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use sysvol_core::{BundleName, CoreError, VersionParseError};

use crate::engine::SyncReport;

/// All errors that can arise from enumeration and synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Marker or bundle-name failure from the core crate.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Local filesystem failure, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The remote share could not be opened, listed or read.
    #[error("remote access to {url} failed: {source}")]
    Remote {
        url: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote share could not be configured for this pass.
    #[error("cannot connect to remote share: {0}")]
    Connect(#[source] std::io::Error),

    /// The remote `GPT.INI` exists but carries no usable version.
    #[error("invalid remote GPT.INI at {url}: {source}")]
    RemoteMarker {
        url: String,
        #[source]
        source: VersionParseError,
    },

    /// The remote hierarchy holds something other than files and directories.
    #[error("unsupported type {kind:?} for entry {url}")]
    UnsupportedEntry { url: String, kind: String },

    /// The enumeration collaborator could not be run or exited with failure.
    #[error("failed to retrieve the list of GPOs: {0}")]
    Enumeration(String),

    /// The enumeration output did not follow the `name\tURL` format.
    #[error("malformed GPO listing at line {line}: {content:?}")]
    ListingFormat { line: usize, content: String },

    /// A bundle lock was poisoned by a panicking download.
    #[error("lock for GPO {0} is poisoned")]
    LockPoisoned(BundleName),

    /// A per-bundle task panicked or was aborted.
    #[error("task for GPO {name} failed: {reason}")]
    Task { name: BundleName, reason: String },

    #[error("synchronization cancelled")]
    Cancelled,

    /// One or more bundles failed; every failing name is listed.
    #[error("one or more errors while fetching GPOs: {}", BundleFailures(failures))]
    Bundles {
        failures: Vec<BundleFailure>,
        partial: Box<SyncReport>,
    },
}

/// A bundle that could not be synchronized, and why.
#[derive(Debug)]
pub struct BundleFailure {
    pub name: BundleName,
    pub error: SyncError,
}

struct BundleFailures<'a>(&'a [BundleFailure]);

impl fmt::Display for BundleFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "can't download GPO {:?}: {}", failure.name.0, failure.error)?;
        }
        Ok(())
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`SyncError::Remote`].
pub(crate) fn remote_err(url: impl Into<String>, source: std::io::Error) -> SyncError {
    SyncError::Remote {
        url: url.into(),
        source,
    }
}
