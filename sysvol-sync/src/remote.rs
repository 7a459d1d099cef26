//! Remote content capability used by the sync engine.
//!
//! The engine only needs to open a file and list a directory. Transports
//! implement [`RemoteShare`]; a [`Connector`] builds one per
//! synchronization pass once the credential scope is in place.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::credentials::CredentialScope;

/// Kind of a listed remote entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Anything else; carries a short description for error messages.
    Unsupported(String),
}

/// One child of a remote directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl RemoteEntry {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Read access to a remote policy hierarchy addressed by URL.
pub trait RemoteShare: Send + Sync {
    fn open(&self, url: &str) -> io::Result<Box<dyn Read + Send>>;

    /// List the children of `url`. `.` and `..` may be included; callers
    /// skip them.
    fn opendir(&self, url: &str) -> io::Result<Vec<RemoteEntry>>;
}

/// Builds a [`RemoteShare`] bound to the credentials of one pass.
pub trait Connector: Send + Sync {
    fn connect(&self, scope: &CredentialScope) -> io::Result<Arc<dyn RemoteShare>>;
}

// ---------------------------------------------------------------------------
// LocalShare
// ---------------------------------------------------------------------------

/// [`RemoteShare`] over a local directory tree or a mounted share.
///
/// Accepts `file://` URLs and absolute paths. When built with
/// [`LocalShare::with_mount`], `smb://<host>/<path>` resolves to
/// `<mount>/<path>`.
#[derive(Debug, Clone, Default)]
pub struct LocalShare {
    mount: Option<PathBuf>,
}

impl LocalShare {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mount(mount: impl Into<PathBuf>) -> Self {
        Self {
            mount: Some(mount.into()),
        }
    }

    /// Map a URL to a local path.
    pub fn resolve(&self, url: &str) -> io::Result<PathBuf> {
        if let Some(path) = url.strip_prefix("file://") {
            return absolute(path, url);
        }
        if let Some(rest) = url.strip_prefix("smb://") {
            let Some(mount) = &self.mount else {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("no mount configured for {url}"),
                ));
            };
            let relative = rest.split_once('/').map(|(_host, path)| path).unwrap_or("");
            return Ok(mount.join(relative.trim_start_matches('/')));
        }
        absolute(url, url)
    }
}

fn absolute(path: &str, url: &str) -> io::Result<PathBuf> {
    let path = Path::new(path);
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported URL {url:?}: expected file:// or an absolute path"),
        ))
    }
}

impl RemoteShare for LocalShare {
    fn open(&self, url: &str) -> io::Result<Box<dyn Read + Send>> {
        let path = self.resolve(url)?;
        Ok(Box::new(fs::File::open(path)?))
    }

    fn opendir(&self, url: &str) -> io::Result<Vec<RemoteEntry>> {
        let path = self.resolve(url)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else if file_type.is_symlink() {
                EntryKind::Unsupported("symlink".to_owned())
            } else {
                EntryKind::Unsupported("special file".to_owned())
            };
            entries.push(RemoteEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                kind,
            ));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

impl Connector for LocalShare {
    fn connect(&self, _scope: &CredentialScope) -> io::Result<Arc<dyn RemoteShare>> {
        Ok(Arc::new(self.clone()))
    }
}
