//! Domain types shared by the sync engine and the CLI.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// The unique name of a remotely hosted policy bundle (a GPO).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BundleName(pub String);

impl BundleName {
    /// The name as a single path component inside the local cache.
    ///
    /// Names that would escape the cache directory or collide with the
    /// engine's hidden staging entries are rejected.
    pub fn cache_component(&self) -> Result<&str, CoreError> {
        let name = self.0.as_str();
        let reason = if name.is_empty() {
            Some("empty name")
        } else if name == "." || name == ".." {
            Some("relative path component")
        } else if name.contains('/') || name.contains('\\') {
            Some("contains a path separator")
        } else if name.starts_with('.') {
            Some("leading dot is reserved for staging entries")
        } else if name.contains('\0') {
            Some("contains a NUL byte")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(CoreError::InvalidBundleName {
                name: name.to_owned(),
                reason,
            }),
            None => Ok(name),
        }
    }
}

impl fmt::Display for BundleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for BundleName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BundleName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Directory object class a bundle list is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    #[default]
    User,
    Computer,
}

impl ObjectClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectClass::User => "user",
            ObjectClass::Computer => "computer",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(ObjectClass::User),
            "computer" => Ok(ObjectClass::Computer),
            other => Err(format!(
                "unknown object class '{other}'; expected: user, computer"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Bundle listings
// ---------------------------------------------------------------------------

/// One `name\tURL` entry as produced by the enumeration collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSpec {
    pub name: BundleName,
    pub url: String,
}

/// Bundles requested for one synchronization pass, keyed by name.
pub type BundleSet = BTreeMap<BundleName, String>;

/// Collapse an ordered listing into a [`BundleSet`]; a repeated name keeps
/// the last URL seen.
pub fn to_bundle_set<I>(specs: I) -> BundleSet
where
    I: IntoIterator<Item = BundleSpec>,
{
    specs.into_iter().map(|spec| (spec.name, spec.url)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
