//! YAML configuration for the watch daemon and for sync passes.
//!
//! # Storage layout
//!
//! ```text
//! <config_dir>/sysvol/
//!   watchd.yaml   (directories to watch: mode 0600)
//!   sync.yaml     (cache location, enumeration command: optional)
//! ```
//!
//! # API pattern
//!
//! Path helpers come in two forms:
//! - `fn_at(config_root: &Path)`: explicit root; used in tests with `TempDir`
//! - `fn()`: derives the root from `dirs::config_dir()`, delegates to `_at`
//!
//! Loading never fails: a missing or unreadable file yields the defaults so a
//! daemon can still start from command-line arguments alone.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};

pub const WATCH_CONFIG_FILE: &str = "watchd.yaml";
pub const SYNC_CONFIG_FILE: &str = "sync.yaml";

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<config_root>/sysvol/watchd.yaml`: pure, no I/O.
pub fn watch_config_path_at(config_root: &Path) -> PathBuf {
    config_root.join("sysvol").join(WATCH_CONFIG_FILE)
}

/// `watch_config_path_at` convenience wrapper.
pub fn watch_config_path() -> Result<PathBuf, CoreError> {
    Ok(watch_config_path_at(&config_root()?))
}

/// `<config_root>/sysvol/sync.yaml`: pure, no I/O.
pub fn sync_config_path_at(config_root: &Path) -> PathBuf {
    config_root.join("sysvol").join(SYNC_CONFIG_FILE)
}

/// `sync_config_path_at` convenience wrapper.
pub fn sync_config_path() -> Result<PathBuf, CoreError> {
    Ok(sync_config_path_at(&config_root()?))
}

// ---------------------------------------------------------------------------
// 2. Watch daemon configuration
// ---------------------------------------------------------------------------

/// Configurable options of the watch daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WatchConfig {
    #[serde(default)]
    pub verbose: u8,
    #[serde(default)]
    pub dirs: Vec<PathBuf>,
}

impl WatchConfig {
    /// Load from `path`; defaults when the file is missing or malformed.
    pub fn load(path: &Path) -> Self {
        load_or_default(path)
    }

    /// Persist to `path` after checking every directory exists.
    ///
    /// Write flow: serialize → `.tmp` sibling → `chmod 0600` → `rename`.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        validate_dirs(&self.dirs)?;
        save_yaml(path, self)
    }
}

/// Require at least one directory and that each of them exists.
///
/// Reports the first missing directory; nothing is adopted on failure.
pub fn validate_dirs(dirs: &[PathBuf]) -> Result<(), CoreError> {
    if dirs.is_empty() {
        return Err(CoreError::NoDirectories);
    }
    for dir in dirs {
        match std::fs::metadata(dir) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::DirectoryNotFound { path: dir.clone() });
            }
            Err(err) => return Err(io_err(dir, err)),
        }
    }
    Ok(())
}

/// Keep only the entries of `dirs` that are existing directories.
pub fn filter_absent_dirs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    dirs.iter().filter(|dir| dir.is_dir()).cloned().collect()
}

// ---------------------------------------------------------------------------
// 3. Sync configuration
// ---------------------------------------------------------------------------

/// Settings for a synchronization pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Local cache root; each bundle lives in `<cache_dir>/<name>`.
    pub cache_dir: PathBuf,
    /// Enumeration collaborator argv prefix.
    pub gpo_list_cmd: Vec<String>,
    /// Directory holding per-object ticket-cache links.
    pub krb5_cache_dir: PathBuf,
    /// Directory service URL handed to the enumeration collaborator.
    pub server_url: Option<String>,
    /// Local mount of the SYSVOL share; `smb://<host>/<path>` URLs resolve
    /// to `<mount>/<path>`.
    pub mount: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/cache/sysvol/gpo_cache"),
            gpo_list_cmd: vec!["/usr/libexec/adsys-gpolist".to_owned()],
            krb5_cache_dir: PathBuf::from("/run/sysvol/krb5cc"),
            server_url: None,
            mount: None,
        }
    }
}

impl SyncConfig {
    /// Load from `path`; defaults when the file is missing or malformed.
    pub fn load(path: &Path) -> Self {
        load_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        save_yaml(path, self)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn load_or_default<T>(path: &Path) -> T
where
    T: Default + for<'de> Deserialize<'de>,
{
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "could not read config file");
            return T::default();
        }
    };
    match serde_yaml::from_str(&contents) {
        Ok(config) => config,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "could not parse config YAML");
            T::default()
        }
    }
}

fn save_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            set_dir_permissions(parent)?;
        }
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_owned());
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    let yaml = serde_yaml::to_string(value)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(io_err(path, err));
    }
    Ok(())
}

fn config_root() -> Result<PathBuf, CoreError> {
    dirs::config_dir().ok_or(CoreError::ConfigDirNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o750))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
