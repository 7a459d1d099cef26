//! `sysvol watch`: directory watch daemon lifecycle.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use sysvol_core::config::{filter_absent_dirs, watch_config_path};
use sysvol_core::WatchConfig;
use sysvol_watchd::paths::{socket_path, DEFAULT_GRACE_PERIOD};
use sysvol_watchd::{
    request_dirs, request_status, request_stop, request_update_dirs, start_blocking, DaemonError,
    DaemonOptions,
};

#[derive(Subcommand, Debug)]
pub enum WatchCommand {
    /// Run the watcher in the foreground, serving the control socket.
    Run(WatchRunArgs),
    /// Query daemon state over the control socket.
    Status,
    /// List the directories the daemon watches.
    Dirs,
    /// Replace the watched directories; the new list is saved to the daemon's config.
    UpdateDirs {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
    },
    /// Flush pending version bumps and stop the daemon.
    Stop,
}

#[derive(Args, Debug)]
pub struct WatchRunArgs {
    /// Watch config file; also receives accepted `update-dirs` lists.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Quiet period after the last change before a marker is bumped.
    #[arg(long, value_name = "MS")]
    pub grace_ms: Option<u64>,

    /// Directories to watch; defaults to the `dirs` list of the config file.
    pub dirs: Vec<PathBuf>,
}

pub fn run(command: WatchCommand, verbosity: u8) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;

    match command {
        WatchCommand::Run(args) => {
            let config_path = match args.config {
                Some(path) => path,
                None => watch_config_path().context("could not determine config directory")?,
            };
            let config = WatchConfig::load(&config_path);
            sysvol_watchd::init_tracing(if verbosity > 0 { verbosity } else { config.verbose });

            let dirs = if args.dirs.is_empty() {
                let present = filter_absent_dirs(&config.dirs);
                if present.len() < config.dirs.len() {
                    tracing::warn!(
                        skipped = config.dirs.len() - present.len(),
                        "ignoring configured directories that do not exist"
                    );
                }
                present
            } else {
                args.dirs
            };
            if dirs.is_empty() {
                bail!(
                    "no directories to watch: pass them as arguments or list them in {}",
                    config_path.display()
                );
            }

            let grace = args
                .grace_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_GRACE_PERIOD);
            start_blocking(DaemonOptions {
                home,
                dirs,
                config_path: Some(config_path),
                grace,
            })
            .context("watch daemon exited with error")?;
        }
        WatchCommand::Status => match request_status(&home) {
            Ok(status) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let payload = serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        WatchCommand::Dirs => {
            let dirs = request_dirs(&home).context("failed to query watched directories")?;
            for dir in dirs {
                println!("{}", dir.display());
            }
        }
        WatchCommand::UpdateDirs { dirs } => {
            let dirs = request_update_dirs(&home, absolute(dirs)?)
                .context("failed to update watched directories")?;
            println!("watching {} directories", dirs.len());
            for dir in dirs {
                println!("  {}", dir.display());
            }
        }
        WatchCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("watch daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("watch daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop watch daemon"),
        },
    }

    Ok(())
}

/// The daemon resolves paths against its own working directory.
fn absolute(dirs: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let cwd = std::env::current_dir().context("could not determine working directory")?;
    Ok(dirs
        .into_iter()
        .map(|dir| if dir.is_absolute() { dir } else { cwd.join(dir) })
        .collect())
}
