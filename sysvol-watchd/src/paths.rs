use std::path::{Path, PathBuf};
use std::time::Duration;

/// Quiet period after the last change before markers are bumped.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

pub const WATCHD_SOCKET: &str = "watchd.sock";

pub fn sysvol_root(home: &Path) -> PathBuf {
    home.join(".sysvol")
}

pub fn socket_path(home: &Path) -> PathBuf {
    sysvol_root(home).join(WATCHD_SOCKET)
}
