//! `GPT.INI` version markers.
//!
//! # Contract
//!
//! ```text
//! [General]
//! Version=<non-negative integer>
//! ```
//!
//! The watcher bumps the marker of a root directory after content under it
//! changed; the sync engine compares the remote marker against the cached
//! copy to decide whether a bundle must be fetched again. The file name is
//! matched case-insensitively everywhere.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::{io_err, CoreError, VersionParseError};
use crate::ini::IniDocument;

pub const GPT_FILE_NAME: &str = "GPT.INI";
pub const GENERAL_SECTION: &str = "General";
pub const VERSION_KEY: &str = "Version";

/// True if `path` names a version marker, whatever its case.
pub fn is_marker_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.eq_ignore_ascii_case(GPT_FILE_NAME))
}

/// Locate the marker inside `dir`, accepting any spelling of its name.
pub fn find_marker(dir: &Path) -> Option<PathBuf> {
    let exact = dir.join(GPT_FILE_NAME);
    if exact.is_file() {
        return Some(exact);
    }
    let entries = fs::read_dir(dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_marker_file(p) && p.is_file())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Extract `[General] Version` from a marker document.
pub fn parse_version(text: &str) -> Result<u64, VersionParseError> {
    let doc = IniDocument::parse(text);
    version_of(&doc)
}

fn version_of(doc: &IniDocument) -> Result<u64, VersionParseError> {
    let raw = doc
        .get(GENERAL_SECTION, VERSION_KEY)
        .ok_or(VersionParseError::Missing)?;
    raw.parse::<u64>()
        .map_err(|_| VersionParseError::NotAnInteger(raw.to_owned()))
}

/// Handle on the marker file of one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionFile {
    path: PathBuf,
}

impl VersionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The marker of `dir`: an existing file in any case spelling, or
    /// `dir/GPT.INI` when none exists yet.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(find_marker(dir).unwrap_or_else(|| dir.join(GPT_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current version.
    ///
    /// A missing file surfaces as an I/O error ([`CoreError::is_not_found`]);
    /// a missing or malformed key as [`CoreError::Version`]. Callers decide
    /// what either means for them.
    pub fn read(&self) -> Result<u64, CoreError> {
        let text = read_lossy(&self.path)?;
        parse_version(&text).map_err(|source| CoreError::Version {
            path: self.path.clone(),
            source,
        })
    }

    /// Increment the version by one and rewrite the whole file.
    ///
    /// A missing, unreadable or malformed marker counts as version 0, so the
    /// first bump always yields 1. Other sections and keys survive the
    /// rewrite. Returns the new version.
    pub fn bump(&self) -> Result<u64, CoreError> {
        let mut doc = match read_lossy(&self.path) {
            Ok(text) => IniDocument::parse(&text),
            Err(err) => {
                if !err.is_not_found() {
                    tracing::info!(path = %self.path.display(), error = %err, "cannot load marker, creating a new one");
                }
                IniDocument::default()
            }
        };

        let current = match version_of(&doc) {
            Ok(version) => version,
            Err(VersionParseError::Missing) => 0,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "malformed marker version, restarting from 0");
                0
            }
        };
        let next = current
            .checked_add(1)
            .ok_or_else(|| CoreError::VersionOverflow {
                path: self.path.clone(),
            })?;
        doc.set(GENERAL_SECTION, VERSION_KEY, &next.to_string());

        let mut file = open_truncating(&self.path)?;
        file.write_all(doc.to_string().as_bytes())
            .map_err(|e| io_err(&self.path, e))?;
        file.flush().map_err(|e| io_err(&self.path, e))?;

        tracing::info!(path = %self.path.display(), version = next, "bumped marker version");
        Ok(next)
    }
}

fn read_lossy(path: &Path) -> Result<String, CoreError> {
    let bytes = fs::read(path).map_err(|e| io_err(path, e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn open_truncating(path: &Path) -> Result<fs::File, CoreError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => io_err(path.parent().unwrap_or(path), e),
        _ => io_err(path, e),
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    #[rstest]
    #[case("GPT.INI")]
    #[case("gpt.ini")]
    #[case("Gpt.Ini")]
    fn marker_name_matches_any_case(#[case] name: &str) {
        assert!(is_marker_file(&Path::new("/sysvol/policy").join(name)));
    }

    #[test]
    fn other_names_are_not_markers() {
        assert!(!is_marker_file(Path::new("/sysvol/GPT.INI.bak")));
        assert!(!is_marker_file(Path::new("/sysvol/Registry.pol")));
    }

    #[rstest]
    #[case("[General]\nVersion=7\n", Ok(7))]
    #[case("[General]\ndisplayName=x\n", Err(VersionParseError::Missing))]
    #[case("[Other]\nVersion=7\n", Err(VersionParseError::Missing))]
    #[case("[General]\nVersion=-1\n", Err(VersionParseError::NotAnInteger("-1".into())))]
    #[case("[General]\nVersion=abc\n", Err(VersionParseError::NotAnInteger("abc".into())))]
    fn parse_version_cases(#[case] text: &str, #[case] expected: Result<u64, VersionParseError>) {
        assert_eq!(parse_version(text), expected);
    }

    #[test]
    fn bump_creates_missing_marker_at_one() {
        let dir = TempDir::new().expect("tempdir");
        let marker = VersionFile::in_dir(dir.path());
        assert_eq!(marker.bump().expect("bump"), 1);
        let text = fs::read_to_string(dir.path().join(GPT_FILE_NAME)).expect("read");
        assert_eq!(text, "[General]\nVersion=1\n");
    }

    #[test]
    fn bump_is_monotonic_by_one() {
        let dir = TempDir::new().expect("tempdir");
        let marker = VersionFile::in_dir(dir.path());
        for expected in 1..=5 {
            assert_eq!(marker.bump().expect("bump"), expected);
            assert_eq!(marker.read().expect("read"), expected);
        }
    }

    #[test]
    fn bump_treats_malformed_version_as_zero() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(GPT_FILE_NAME);
        fs::write(&path, "[General]\nVersion=oops\n").expect("write");
        assert_eq!(VersionFile::new(&path).bump().expect("bump"), 1);
    }

    #[test]
    fn bump_truncates_longer_previous_content() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(GPT_FILE_NAME);
        fs::write(&path, "[General]\nVersion=9\n; a very long trailing comment line\n")
            .expect("write");
        VersionFile::new(&path).bump().expect("bump");
        assert_eq!(fs::read_to_string(&path).expect("read"), "[General]\nVersion=10\n");
    }

    #[test]
    fn in_dir_reuses_lowercase_marker() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("gpt.ini"), "[General]\nVersion=3\n").expect("write");
        let marker = VersionFile::in_dir(dir.path());
        assert_eq!(marker.read().expect("read"), 3);
        assert_eq!(marker.bump().expect("bump"), 4);
    }

    #[test]
    fn read_missing_marker_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let err = VersionFile::in_dir(dir.path()).read().unwrap_err();
        assert!(err.is_not_found(), "got: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn created_marker_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().expect("tempdir");
        let marker = VersionFile::in_dir(dir.path());
        marker.bump().expect("bump");
        let mode = fs::metadata(marker.path()).expect("meta").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
