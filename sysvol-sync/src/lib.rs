//! # sysvol-sync
//!
//! Version-gated synchronization of remote policy bundles into a local
//! cache.
//!
//! Build a [`SyncEngine`] over a [`Connector`] and call
//! [`SyncEngine::synchronize`] with the bundles to refresh. Bundle lists
//! come from [`enumerate::list_bundles`] or [`enumerate::parse_listing`].

pub mod cache_lock;
pub mod credentials;
pub mod engine;
pub mod enumerate;
pub mod error;
pub mod registry;
pub mod remote;

pub use cache_lock::CACHE_LOCK_FILE;
pub use credentials::{ensure_ticket_link, CredentialScope, KRB5_TICKET_ENV};
pub use engine::{BundleOutcome, BundleReport, SyncEngine, SyncReport};
pub use error::{BundleFailure, SyncError};
pub use registry::{Bundle, GpoRegistry};
pub use remote::{Connector, EntryKind, LocalShare, RemoteEntry, RemoteShare};
