//! Version-gated synchronization of bundles into the local cache.
//!
//! ## Per-bundle protocol
//!
//! 1. Look up the bundle in the [`GpoRegistry`].
//! 2. Under the bundle's shared lock, read the cached `GPT.INI` version.
//!    Missing or malformed counts as 0.
//! 3. Read the remote `GPT.INI` version. Failure is fatal for the bundle.
//! 4. `local >= remote` → skip.
//! 5. Take the bundle's exclusive lock and re-read the cached version; a
//!    concurrent pass may have refreshed it meanwhile.
//! 6. Download the remote tree into `<cache>/.staging-<name>.XXXX`.
//! 7. Commit: move the old entry aside, rename staging into place, delete
//!    the aside copy. The old entry is moved back if the rename fails.
//!
//! All bundles of a pass run in parallel on the blocking pool while one
//! [`CredentialScope`] and a shared [`CacheLock`] are held. Leftovers of
//! interrupted commits are pruned only while no pass holds the cache.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysvol_core::version_file::{find_marker, parse_version};
use sysvol_core::{BundleName, BundleSet, VersionFile, GPT_FILE_NAME};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::cache_lock::CacheLock;
use crate::credentials::CredentialScope;
use crate::error::{io_err, remote_err, BundleFailure, SyncError};
use crate::registry::{Bundle, GpoRegistry};
use crate::remote::{Connector, EntryKind, RemoteShare};

const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";
const COPY_CHUNK: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What happened to one bundle during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BundleOutcome {
    /// The cached copy was at least as recent as the remote one.
    UpToDate { local: u64, remote: u64 },
    /// The remote tree was fetched and committed.
    Downloaded { previous: u64, current: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleReport {
    pub name: BundleName,
    #[serde(flatten)]
    pub outcome: BundleOutcome,
}

/// Result of one [`SyncEngine::synchronize`] call.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub synced_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Successful bundles, in name order.
    pub bundles: Vec<BundleReport>,
}

impl SyncReport {
    pub fn downloaded(&self) -> usize {
        self.bundles
            .iter()
            .filter(|b| matches!(b.outcome, BundleOutcome::Downloaded { .. }))
            .count()
    }
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

/// Keeps a local cache of bundles in step with their remote copies.
pub struct SyncEngine {
    cache_dir: PathBuf,
    registry: GpoRegistry,
    connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("cache_dir", &self.cache_dir)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Create the cache directory if needed and clear leftovers of
    /// interrupted commits, unless a pass is using the cache right now.
    pub fn new(cache_dir: impl Into<PathBuf>, connector: Arc<dyn Connector>) -> Result<Self, SyncError> {
        let cache_dir = cache_dir.into();
        create_private_dir(&cache_dir, true)?;
        match CacheLock::try_exclusive(&cache_dir)? {
            Some(_exclusive) => prune_leftovers(&cache_dir),
            None => {
                tracing::debug!(cache = %cache_dir.display(), "cache in use, leaving leftovers for a later engine");
            }
        }
        Ok(Self {
            cache_dir,
            registry: GpoRegistry::new(),
            connector,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Location of the cached copy of `name`.
    pub fn cache_path(&self, name: &BundleName) -> Result<PathBuf, SyncError> {
        Ok(self.cache_dir.join(name.cache_component()?))
    }

    pub fn registry(&self) -> &GpoRegistry {
        &self.registry
    }

    /// Bring every bundle of `bundles` up to date.
    ///
    /// Every bundle is attempted even when others fail; the returned
    /// [`SyncError::Bundles`] names each failing bundle and carries the
    /// report of those that succeeded.
    pub async fn synchronize(
        &self,
        cancel: &CancellationToken,
        ticket: Option<&Path>,
        bundles: &BundleSet,
    ) -> Result<SyncReport, SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let started = Instant::now();
        let synced_at = Utc::now();

        let scope = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            scope = CredentialScope::acquire(ticket) => scope,
        };
        let cache_lock = {
            let cache_dir = self.cache_dir.clone();
            tokio::task::spawn_blocking(move || CacheLock::shared(&cache_dir))
                .await
                .map_err(|join| io_err(&self.cache_dir, std::io::Error::other(join)))??
        };
        let share = self.connector.connect(&scope).map_err(SyncError::Connect)?;
        tracing::info!(count = bundles.len(), cache = %self.cache_dir.display(), "synchronizing GPOs");

        let mut tasks = Vec::with_capacity(bundles.len());
        for (name, url) in bundles {
            let job = BundleJob {
                bundle: self.registry.get_or_create(name, url),
                url: url.clone(),
                cache_dir: self.cache_dir.clone(),
                share: Arc::clone(&share),
                cancel: cancel.clone(),
            };
            tasks.push((name.clone(), tokio::task::spawn_blocking(move || job.run())));
        }

        let mut reports = Vec::with_capacity(tasks.len());
        let mut failures = Vec::new();
        for (name, task) in tasks {
            match task.await {
                Ok(Ok(outcome)) => reports.push(BundleReport { name, outcome }),
                Ok(Err(error)) => {
                    tracing::warn!(bundle = %name, error = %error, "GPO synchronization failed");
                    failures.push(BundleFailure { name, error });
                }
                Err(join) => failures.push(BundleFailure {
                    name: name.clone(),
                    error: SyncError::Task {
                        name,
                        reason: join.to_string(),
                    },
                }),
            }
        }
        drop(cache_lock);
        drop(scope);

        let report = SyncReport {
            synced_at,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            bundles: reports,
        };
        tracing::info!(
            downloaded = report.downloaded(),
            failed = failures.len(),
            duration_ms = report.duration_ms,
            "synchronization finished"
        );

        if failures.is_empty() {
            Ok(report)
        } else if failures
            .iter()
            .all(|f| matches!(f.error, SyncError::Cancelled))
        {
            Err(SyncError::Cancelled)
        } else {
            Err(SyncError::Bundles {
                failures,
                partial: Box::new(report),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Per-bundle work
// ---------------------------------------------------------------------------

struct BundleJob {
    bundle: Arc<Bundle>,
    url: String,
    cache_dir: PathBuf,
    share: Arc<dyn RemoteShare>,
    cancel: CancellationToken,
}

impl BundleJob {
    fn run(self) -> Result<BundleOutcome, SyncError> {
        let name = self.bundle.name();
        let component = name.cache_component()?;
        let dest = self.cache_dir.join(component);

        let local = {
            let _shared = self.bundle.read()?;
            local_version(name, &dest)
        };
        let remote = remote_version(self.share.as_ref(), &self.url)?;
        if local >= remote {
            tracing::debug!(bundle = %name, local, remote, "GPO is up to date");
            return Ok(BundleOutcome::UpToDate { local, remote });
        }
        self.check_cancelled()?;

        let _exclusive = self.bundle.write()?;
        let local = local_version(name, &dest);
        if local >= remote {
            tracing::debug!(bundle = %name, local, remote, "GPO refreshed by a concurrent pass");
            return Ok(BundleOutcome::UpToDate { local, remote });
        }

        tracing::info!(bundle = %name, local, remote, url = %self.url, "downloading GPO");
        self.bundle.record_transfer();
        let staging = tempfile::Builder::new()
            .prefix(&format!("{STAGING_PREFIX}{component}."))
            .tempdir_in(&self.cache_dir)
            .map_err(|e| io_err(&self.cache_dir, e))?;
        download_tree(self.share.as_ref(), &self.url, staging.path(), &self.cancel)?;
        self.check_cancelled()?;

        commit(staging, &dest, &self.cache_dir, component)?;
        // The remote marker may have moved on while the tree was copied.
        let current = local_version(name, &dest);
        tracing::info!(bundle = %name, version = current, "GPO committed");
        Ok(BundleOutcome::Downloaded {
            previous: local,
            current,
        })
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn local_version(name: &BundleName, dest: &Path) -> u64 {
    if !dest.is_dir() {
        tracing::debug!(bundle = %name, "no cached copy");
        return 0;
    }
    let Some(marker) = find_marker(dest) else {
        tracing::warn!(bundle = %name, path = %dest.display(), "cached copy has no GPT.INI, treating as version 0");
        return 0;
    };
    match VersionFile::new(marker).read() {
        Ok(version) => version,
        Err(err) => {
            tracing::warn!(bundle = %name, error = %err, "unreadable cached GPT.INI, treating as version 0");
            0
        }
    }
}

fn remote_version(share: &dyn RemoteShare, url: &str) -> Result<u64, SyncError> {
    let marker_url = join_url(url, GPT_FILE_NAME);
    let mut reader = share.open(&marker_url).map_err(|e| remote_err(&marker_url, e))?;
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| remote_err(&marker_url, e))?;
    parse_version(&String::from_utf8_lossy(&bytes)).map_err(|source| SyncError::RemoteMarker {
        url: marker_url,
        source,
    })
}

fn join_url(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Mirror the remote tree at `url` into the existing directory `dir`.
fn download_tree(
    share: &dyn RemoteShare,
    url: &str,
    dir: &Path,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    let entries = share.opendir(url).map_err(|e| remote_err(url, e))?;
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        let child_url = join_url(url, &entry.name);
        if entry.name.is_empty() || entry.name.contains(['/', '\\']) {
            return Err(SyncError::UnsupportedEntry {
                url: child_url,
                kind: "invalid entry name".to_owned(),
            });
        }
        let target = dir.join(&entry.name);
        match entry.kind {
            EntryKind::Directory => {
                create_private_dir(&target, false)?;
                download_tree(share, &child_url, &target, cancel)?;
            }
            EntryKind::File => copy_file(share, &child_url, &target, cancel)?,
            EntryKind::Unsupported(kind) => {
                return Err(SyncError::UnsupportedEntry {
                    url: child_url,
                    kind,
                });
            }
        }
    }
    Ok(())
}

fn copy_file(
    share: &dyn RemoteShare,
    url: &str,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    let mut reader = share.open(url).map_err(|e| remote_err(url, e))?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(target).map_err(|e| io_err(target, e))?;

    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(remote_err(url, e)),
        };
        file.write_all(&buf[..n]).map_err(|e| io_err(target, e))?;
    }
    file.flush().map_err(|e| io_err(target, e))
}

/// Swap `staging` in as `dest`.
///
/// Both live in `cache_dir`, so every step is a same-filesystem rename.
fn commit(staging: TempDir, dest: &Path, cache_dir: &Path, component: &str) -> Result<(), SyncError> {
    let retired = retire(dest, cache_dir, component)?;
    install(staging, dest, retired)
}

/// Move the current entry, if any, to a `.retired-` sibling.
fn retire(dest: &Path, cache_dir: &Path, component: &str) -> Result<Option<TempDir>, SyncError> {
    if fs::symlink_metadata(dest).is_err() {
        return Ok(None);
    }
    // An empty directory may be replaced by rename.
    let aside = tempfile::Builder::new()
        .prefix(&format!("{RETIRED_PREFIX}{component}."))
        .tempdir_in(cache_dir)
        .map_err(|e| io_err(cache_dir, e))?;
    fs::rename(dest, aside.path()).map_err(|e| io_err(dest, e))?;
    Ok(Some(aside))
}

/// Rename `staging` to `dest`. On failure the retired entry goes back, or
/// stays on disk for [`prune_leftovers`] when even that fails.
fn install(staging: TempDir, dest: &Path, retired: Option<TempDir>) -> Result<(), SyncError> {
    if let Err(err) = fs::rename(staging.path(), dest) {
        if let Some(aside) = retired {
            if let Err(restore) = fs::rename(aside.path(), dest) {
                let kept = aside.keep();
                tracing::error!(
                    path = %dest.display(),
                    kept = %kept.display(),
                    error = %restore,
                    "cannot restore previous cache entry"
                );
            }
        }
        return Err(io_err(dest, err));
    }
    // The retired tree is removed when `retired` drops.
    drop(retired);
    Ok(())
}

/// Remove staging directories and restore or remove retired entries left
/// by an interrupted commit.
fn prune_leftovers(cache_dir: &Path) {
    let Ok(entries) = fs::read_dir(cache_dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let path = entry.path();
        if file_name.starts_with(STAGING_PREFIX) {
            tracing::debug!(path = %path.display(), "removing leftover staging directory");
            remove_quietly(&path);
        } else if let Some(rest) = file_name.strip_prefix(RETIRED_PREFIX) {
            let Some((name, _suffix)) = rest.rsplit_once('.') else {
                continue;
            };
            let original = cache_dir.join(name);
            if name.is_empty() || original.exists() {
                remove_quietly(&path);
            } else {
                tracing::warn!(path = %original.display(), "restoring cache entry from interrupted commit");
                if let Err(err) = fs::rename(&path, &original) {
                    tracing::warn!(path = %path.display(), error = %err, "cannot restore cache entry");
                }
            }
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_dir_all(path) {
        tracing::warn!(path = %path.display(), error = %err, "cannot remove leftover directory");
    }
}

fn create_private_dir(path: &Path, recursive: bool) -> Result<(), SyncError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(recursive);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path).map_err(|e| io_err(path, e))
}
