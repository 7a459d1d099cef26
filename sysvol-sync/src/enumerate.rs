//! Bundle enumeration.
//!
//! The list of bundles applying to a user or computer comes from an
//! external collaborator that prints one `name\tURL` line per bundle.

use std::path::Path;
use std::process::Stdio;

use sysvol_core::{BundleName, BundleSpec, ObjectClass};
use tokio::process::Command;

use crate::credentials::KRB5_TICKET_ENV;
use crate::error::SyncError;

/// Parse `name\tURL` lines, keeping their order. Blank lines are skipped.
pub fn parse_listing(text: &str) -> Result<Vec<BundleSpec>, SyncError> {
    let mut specs = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let malformed = || SyncError::ListingFormat {
            line: index + 1,
            content: line.to_owned(),
        };
        let (name, url) = line.split_once('\t').ok_or_else(malformed)?;
        let (name, url) = (name.trim(), url.trim());
        if name.is_empty() || url.is_empty() {
            return Err(malformed());
        }
        specs.push(BundleSpec {
            name: BundleName::from(name),
            url: url.to_owned(),
        });
    }
    Ok(specs)
}

/// Drop a trailing `@REALM` from an object name.
pub fn strip_realm(object: &str) -> &str {
    object.split_once('@').map_or(object, |(name, _realm)| name)
}

/// Ask the collaborator `cmd` for the bundles applying to `object`.
///
/// The collaborator runs with `KRB5CCNAME` pointing at `ticket` and
/// receives `--objectclass <class> <server_url> <object>`.
pub async fn list_bundles(
    cmd: &[String],
    class: ObjectClass,
    server_url: &str,
    object: &str,
    ticket: Option<&Path>,
) -> Result<Vec<BundleSpec>, SyncError> {
    let (program, args) = cmd
        .split_first()
        .ok_or_else(|| SyncError::Enumeration("no enumeration command configured".to_owned()))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .arg("--objectclass")
        .arg(class.as_str())
        .arg(server_url)
        .arg(strip_realm(object))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ticket) = ticket {
        command.env(KRB5_TICKET_ENV, ticket);
    }

    tracing::debug!(program = %program, object = %object, class = %class, "listing GPOs");
    let output = command
        .output()
        .await
        .map_err(|e| SyncError::Enumeration(format!("cannot run {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SyncError::Enumeration(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let specs = parse_listing(&String::from_utf8_lossy(&output.stdout))?;
    tracing::debug!(count = specs.len(), "GPO list retrieved");
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn listing_keeps_order() {
        let specs = parse_listing(
            "{B}\tsmb://dc/SYSVOL/Policies/{B}\n{A}\tsmb://dc/SYSVOL/Policies/{A}\r\n\n",
        )
        .expect("parse");
        let names: Vec<_> = specs.iter().map(|s| s.name.0.as_str()).collect();
        assert_eq!(names, vec!["{B}", "{A}"]);
        assert_eq!(specs[1].url, "smb://dc/SYSVOL/Policies/{A}");
    }

    #[rstest]
    #[case("no-tab-here", 1)]
    #[case("ok\tsmb://x\n\tsmb://x", 2)]
    #[case("name\t  ", 1)]
    fn malformed_lines_are_reported(#[case] text: &str, #[case] expected_line: usize) {
        match parse_listing(text) {
            Err(SyncError::ListingFormat { line, .. }) => assert_eq!(line, expected_line),
            other => panic!("expected ListingFormat, got {other:?}"),
        }
    }

    #[rstest]
    #[case("alice@EXAMPLE.COM", "alice")]
    #[case("host$", "host$")]
    fn realm_is_stripped(#[case] object: &str, #[case] expected: &str) {
        assert_eq!(strip_realm(object), expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn collaborator_output_is_parsed() {
        let cmd = vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            // $0 is "--objectclass"; echo the class and object back as a listing.
            r#"printf '%s\tsmb://dc/%s\n' "$1" "$3""#.to_owned(),
        ];
        let specs = list_bundles(&cmd, ObjectClass::Computer, "ldap://dc", "host$@EXAMPLE.COM", None)
            .await
            .expect("list");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name.0, "computer");
        assert_eq!(specs[0].url, "smb://dc/host$");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_collaborator_carries_stderr() {
        let cmd = vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            "echo 'no such object' >&2; exit 3".to_owned(),
        ];
        let err = list_bundles(&cmd, ObjectClass::User, "ldap://dc", "bob", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Enumeration(_)));
        assert!(err.to_string().contains("no such object"), "got: {err}");
    }
}
