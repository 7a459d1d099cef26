//! Attribution of changed paths to configured root directories.

use std::path::{Component, Path, PathBuf};

use crate::error::DaemonError;

/// Return the root in `roots` that owns `path`.
///
/// Both sides are cleaned lexically and `\` is read as a separator. When
/// several roots contain `path` the most deeply nested one wins. Matching is
/// per component, so `/ab` is not under `/a`.
pub fn resolve(path: &Path, roots: &[PathBuf]) -> Result<PathBuf, DaemonError> {
    let target = normalize(path);
    roots
        .iter()
        .map(|root| (root, normalize(root)))
        .filter(|(_, normalized)| target.starts_with(normalized))
        .max_by_key(|(_, normalized)| normalized.components().count())
        .map(|(root, _)| root.clone())
        .ok_or_else(|| DaemonError::NoMatchingRoot {
            path: path.to_path_buf(),
        })
}

/// Lexically clean `path`: unify separators, drop `.`, fold `..`.
pub fn normalize(path: &Path) -> PathBuf {
    let text = path.to_string_lossy().replace('\\', "/");
    let mut out = PathBuf::new();
    for component in Path::new(&text).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn roots(list: &[&str]) -> Vec<PathBuf> {
        list.iter().map(PathBuf::from).collect()
    }

    #[rstest]
    #[case("/a/b/c", &["/a", "/a/b"], "/a/b")]
    #[case("/a/b/c", &["/a/b", "/a"], "/a/b")]
    #[case("/a/x", &["/a", "/a/b"], "/a")]
    #[case("/a/b", &["/a", "/a/b"], "/a/b")]
    #[case("/a/b/c", &["/a/", "/a/b/"], "/a/b/")]
    #[case("/a/./b/../b/c", &["/a", "/a/b"], "/a/b")]
    #[case("\\a\\b\\c", &["/a", "/a/b"], "/a/b")]
    fn longest_prefix_wins(#[case] path: &str, #[case] candidates: &[&str], #[case] expected: &str) {
        let root = resolve(Path::new(path), &roots(candidates)).expect("resolve");
        assert_eq!(root, PathBuf::from(expected));
    }

    #[test]
    fn sibling_with_common_prefix_does_not_match() {
        let err = resolve(Path::new("/ab/file"), &roots(&["/a"])).unwrap_err();
        assert!(matches!(err, DaemonError::NoMatchingRoot { .. }));
    }

    #[test]
    fn no_roots_is_an_error() {
        assert!(resolve(Path::new("/a/file"), &[]).is_err());
    }

    #[rstest]
    #[case("/a/b/../c", "/a/c")]
    #[case("/../a", "/a")]
    #[case("a/../../b", "../b")]
    #[case("/a//b/", "/a/b")]
    fn normalize_cleans_lexically(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize(Path::new(input)), PathBuf::from(expected));
    }
}
