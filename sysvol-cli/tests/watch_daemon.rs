use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::str::contains;
use sysvol_core::{VersionFile, WatchConfig};
use tempfile::TempDir;

fn sysvol_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("sysvol"));
    cmd.env("HOME", home);
    cmd
}

struct DaemonProcess {
    child: Child,
    home: PathBuf,
}

impl DaemonProcess {
    fn start(home: &Path, config: &Path, dirs: &[&Path]) -> Self {
        let child = sysvol_cmd(home)
            .args(["watch", "run", "--grace-ms", "200", "-c"])
            .arg(config)
            .args(dirs)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        Self {
            child,
            home: home.to_path_buf(),
        }
    }

    fn wait_exit(&mut self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return true;
            }
            sleep(Duration::from_millis(50));
        }
        false
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        let _ = sysvol_cmd(&self.home).args(["watch", "stop"]).status();
        if !self.wait_exit(Duration::from_secs(2)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn daemon_running(home: &Path) -> bool {
    let Ok(output) = sysvol_cmd(home).args(["watch", "status"]).output() else {
        return false;
    };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&output.stdout) else {
        return false;
    };
    value.get("running").and_then(|v| v.as_bool()) == Some(true)
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn status_without_daemon_reports_not_running() {
    let home = TempDir::new().expect("home");

    sysvol_cmd(home.path())
        .args(["watch", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));
}

#[test]
fn stop_without_daemon_is_not_an_error() {
    let home = TempDir::new().expect("home");

    sysvol_cmd(home.path())
        .args(["watch", "stop"])
        .assert()
        .success()
        .stdout(contains("not running"));
}

#[test]
fn run_without_any_directory_fails() {
    let home = TempDir::new().expect("home");
    let config = home.path().join("watchd.yaml");

    sysvol_cmd(home.path())
        .args(["watch", "run", "-c"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("no directories to watch"));
}

#[test]
fn run_with_missing_directory_fails() {
    let home = TempDir::new().expect("home");
    let config = home.path().join("watchd.yaml");

    sysvol_cmd(home.path())
        .args(["watch", "run", "-c"])
        .arg(&config)
        .arg(home.path().join("nope"))
        .assert()
        .failure()
        .stderr(contains("does not exist"));
}

#[test]
fn daemon_bumps_markers_and_accepts_new_directories() {
    let home = TempDir::new().expect("home");
    let policies = TempDir::new().expect("policies");
    let first = policies.path().join("first");
    let second = policies.path().join("second");
    fs::create_dir_all(&first).expect("first");
    fs::create_dir_all(&second).expect("second");
    let config = home.path().join("watchd.yaml");

    let mut daemon = DaemonProcess::start(home.path(), &config, &[&first]);
    wait_until("daemon startup", || daemon_running(home.path()));

    sysvol_cmd(home.path())
        .args(["watch", "dirs"])
        .assert()
        .success()
        .stdout(contains(first.display().to_string()));

    fs::write(first.join("Registry.pol"), "x").expect("write");
    wait_until("first marker bump", || {
        VersionFile::in_dir(&first).read().ok() == Some(1)
    });

    sysvol_cmd(home.path())
        .args(["watch", "update-dirs"])
        .arg(&second)
        .assert()
        .success()
        .stdout(contains(second.display().to_string()));
    assert_eq!(WatchConfig::load(&config).dirs, vec![second.clone()]);

    fs::write(second.join("Registry.pol"), "y").expect("write");
    wait_until("second marker bump", || {
        VersionFile::in_dir(&second).read().ok() == Some(1)
    });

    sysvol_cmd(home.path())
        .args(["watch", "update-dirs"])
        .arg(policies.path().join("gone"))
        .assert()
        .failure()
        .stderr(contains("does not exist"));
    assert_eq!(WatchConfig::load(&config).dirs, vec![second.clone()]);

    sysvol_cmd(home.path())
        .args(["watch", "stop"])
        .assert()
        .success();
    assert!(daemon.wait_exit(Duration::from_secs(5)), "daemon did not exit");
    assert_eq!(VersionFile::in_dir(&first).read().ok(), Some(1));
}
