//! sysvol: version-gated GPO synchronization and policy directory watching.
//!
//! # Usage
//!
//! ```text
//! sysvol sync --object <name> --object-class user|computer [--server <url>] [--ticket <path>]
//! sysvol sync --bundles-from <file> [--cache-dir <dir>] [--json]
//! sysvol version <dir>
//! sysvol bump <dir>
//! sysvol watch run [-c <config>] [--grace-ms <n>] [DIR...]
//! sysvol watch status|dirs|stop
//! sysvol watch update-dirs <DIR>...
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    marker::{BumpArgs, VersionArgs},
    sync::SyncArgs,
    watch::WatchCommand,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "sysvol",
    version,
    about = "Synchronize GPO bundles from SYSVOL and keep authored policy versions current",
    long_about = None,
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refresh the local GPO cache from the remote share.
    Sync(SyncArgs),

    /// Print the GPT.INI version of a directory.
    Version(VersionArgs),

    /// Increment the GPT.INI version of a directory.
    Bump(BumpArgs),

    /// Run or control the directory watch daemon.
    Watch {
        #[command(subcommand)]
        command: WatchCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Sync(args) => args.run(cli.verbose),
        Commands::Version(args) => {
            sysvol_watchd::init_tracing(cli.verbose);
            args.run()
        }
        Commands::Bump(args) => {
            sysvol_watchd::init_tracing(cli.verbose);
            args.run()
        }
        Commands::Watch { command } => commands::watch::run(command, cli.verbose),
    }
}
