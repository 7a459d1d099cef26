//! Process-lifetime registry of bundles.
//!
//! Each bundle name maps to one [`Bundle`] that carries the reader/writer
//! lock serializing downloads of that name. Entries are never evicted; the
//! map is bounded by the number of distinct names ever requested.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use sysvol_core::BundleName;

use crate::error::SyncError;

/// Shared per-name state.
#[derive(Debug)]
pub struct Bundle {
    name: BundleName,
    url: Mutex<String>,
    lock: RwLock<()>,
    transfers: AtomicU64,
}

impl Bundle {
    fn new(name: BundleName, url: &str) -> Self {
        Self {
            name,
            url: Mutex::new(url.to_owned()),
            lock: RwLock::new(()),
            transfers: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &BundleName {
        &self.name
    }

    /// Last remote location this bundle was requested from.
    pub fn remote_location(&self) -> String {
        self.url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of completed content transfers since the process started.
    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    pub(crate) fn record_transfer(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    /// Shared access for version checks.
    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, ()>, SyncError> {
        self.lock
            .read()
            .map_err(|_| SyncError::LockPoisoned(self.name.clone()))
    }

    /// Exclusive access for download and commit.
    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, ()>, SyncError> {
        self.lock
            .write()
            .map_err(|_| SyncError::LockPoisoned(self.name.clone()))
    }

    fn relocate(&self, url: &str) {
        let mut current = self.url.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != url {
            tracing::debug!(bundle = %self.name, from = %current, to = %url, "GPO moved");
            *current = url.to_owned();
        }
    }
}

/// Thread-safe name → [`Bundle`] map.
#[derive(Debug, Default)]
pub struct GpoRegistry {
    bundles: Mutex<HashMap<BundleName, Arc<Bundle>>>,
}

impl GpoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the bundle for `name`, creating it on first reference.
    ///
    /// An existing entry keeps its lock; its remote location follows `url`.
    pub fn get_or_create(&self, name: &BundleName, url: &str) -> Arc<Bundle> {
        let mut bundles = self.bundles.lock().unwrap_or_else(PoisonError::into_inner);
        match bundles.get(name) {
            Some(bundle) => {
                bundle.relocate(url);
                Arc::clone(bundle)
            }
            None => {
                let bundle = Arc::new(Bundle::new(name.clone(), url));
                bundles.insert(name.clone(), Arc::clone(&bundle));
                bundle
            }
        }
    }

    pub fn get(&self, name: &BundleName) -> Option<Arc<Bundle>> {
        self.bundles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.bundles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn same_name_shares_one_bundle() {
        let registry = GpoRegistry::new();
        let name = BundleName::from("{GUID-A}");
        let a = registry.get_or_create(&name, "smb://dc/SYSVOL/a");
        let b = registry.get_or_create(&name, "smb://dc/SYSVOL/a");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_names_get_distinct_locks() {
        let registry = GpoRegistry::new();
        let a = registry.get_or_create(&BundleName::from("a"), "smb://dc/a");
        let b = registry.get_or_create(&BundleName::from("b"), "smb://dc/b");
        let _held = a.write().expect("lock a");
        assert!(b.lock.try_write().is_ok(), "b must not be blocked by a");
    }

    #[test]
    fn location_follows_latest_request() {
        let registry = GpoRegistry::new();
        let name = BundleName::from("a");
        registry.get_or_create(&name, "smb://old/a");
        let bundle = registry.get_or_create(&name, "smb://new/a");
        assert_eq!(bundle.remote_location(), "smb://new/a");
    }

    #[test]
    fn concurrent_creation_yields_single_entry() {
        let registry = Arc::new(GpoRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.get_or_create(&BundleName::from("x"), "smb://dc/x"))
            })
            .collect();
        let bundles: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();
        assert!(bundles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }
}
