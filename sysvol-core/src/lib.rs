//! sysvol core library: version markers, domain types, configuration, errors.
//!
//! Public API surface:
//! - [`version_file`]: `GPT.INI` read / bump contract shared by the watcher
//!   and the sync engine
//! - [`ini`]: order-preserving INI document used by the marker codec
//! - [`types`]: bundle and object newtypes
//! - [`config`]: YAML configuration for the watch daemon and sync passes
//! - [`error`]: [`CoreError`]

pub mod config;
pub mod error;
pub mod ini;
pub mod types;
pub mod version_file;

pub use config::{SyncConfig, WatchConfig};
pub use error::{CoreError, VersionParseError};
pub use types::{BundleName, BundleSet, BundleSpec, ObjectClass};
pub use version_file::{is_marker_file, VersionFile, GPT_FILE_NAME};
