//! Process-wide credential scoping.
//!
//! Kerberos libraries read the ticket cache location from the
//! `KRB5CCNAME` environment variable, which is shared by the whole
//! process. A [`CredentialScope`] holds a global lock for as long as the
//! variable points at one pass's ticket, so concurrent passes can't see
//! each other's credentials.

use std::ffi::OsString;
use std::path::Path;
use std::sync::OnceLock;

use tokio::sync::{Mutex, MutexGuard};

use crate::error::{io_err, SyncError};

/// Environment variable naming the ticket cache.
pub const KRB5_TICKET_ENV: &str = "KRB5CCNAME";

fn credential_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Exclusive hold on the process credential environment.
///
/// The previous value of [`KRB5_TICKET_ENV`] is restored on drop.
#[derive(Debug)]
pub struct CredentialScope {
    previous: Option<OsString>,
    _guard: MutexGuard<'static, ()>,
}

impl CredentialScope {
    /// Wait for the credential lock, then point [`KRB5_TICKET_ENV`] at
    /// `ticket`, or clear it when `ticket` is `None`.
    pub async fn acquire(ticket: Option<&Path>) -> Self {
        let guard = credential_lock().lock().await;
        let previous = std::env::var_os(KRB5_TICKET_ENV);
        match ticket {
            Some(ticket) => std::env::set_var(KRB5_TICKET_ENV, ticket),
            None => std::env::remove_var(KRB5_TICKET_ENV),
        }
        tracing::trace!(ticket = ?ticket, "credential scope acquired");
        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for CredentialScope {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => std::env::set_var(KRB5_TICKET_ENV, value),
            None => std::env::remove_var(KRB5_TICKET_ENV),
        }
    }
}

/// Make `dst` a symlink to the ticket cache at `src`.
///
/// `src` is made absolute first. An existing link already pointing there is
/// left alone; anything else at `dst` is replaced.
pub async fn ensure_ticket_link(src: &Path, dst: &Path) -> Result<(), SyncError> {
    let _guard = credential_lock().lock().await;

    let src = if src.is_absolute() {
        src.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| io_err(src, e))?
            .join(src)
    };

    match std::fs::read_link(dst) {
        Ok(target) if target == src => return Ok(()),
        Ok(_) => {
            tracing::debug!(link = %dst.display(), "replacing stale ticket link");
            std::fs::remove_file(dst).map_err(|e| io_err(dst, e))?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(_) => {
            // Not a symlink: a leftover regular file.
            std::fs::remove_file(dst).map_err(|e| io_err(dst, e))?;
        }
    }

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    symlink(&src, dst)
}

#[cfg(unix)]
fn symlink(src: &Path, dst: &Path) -> Result<(), SyncError> {
    std::os::unix::fs::symlink(src, dst).map_err(|e| io_err(dst, e))
}

#[cfg(not(unix))]
fn symlink(_src: &Path, dst: &Path) -> Result<(), SyncError> {
    Err(io_err(
        dst,
        std::io::Error::new(std::io::ErrorKind::Unsupported, "symlinks need a unix host"),
    ))
}
