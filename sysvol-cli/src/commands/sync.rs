//! `sysvol sync`: refresh the local GPO cache for one user or computer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};
use tokio_util::sync::CancellationToken;

use sysvol_core::config::sync_config_path;
use sysvol_core::types::to_bundle_set;
use sysvol_core::{BundleSet, ObjectClass, SyncConfig};
use sysvol_sync::enumerate::{list_bundles, parse_listing, strip_realm};
use sysvol_sync::{
    ensure_ticket_link, BundleFailure, BundleOutcome, LocalShare, SyncEngine, SyncError,
    SyncReport,
};

/// Arguments for `sysvol sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// User or computer whose GPOs are fetched (a trailing @REALM is ignored).
    #[arg(long, required_unless_present = "bundles_from", requires = "object_class")]
    pub object: Option<String>,

    /// Object class of `--object`: user or computer.
    #[arg(long, value_name = "CLASS")]
    pub object_class: Option<ObjectClass>,

    /// Directory service URL; defaults to `server_url` from the sync config.
    #[arg(long, requires = "object")]
    pub server: Option<String>,

    /// Kerberos ticket cache used for enumeration and downloads.
    #[arg(long, requires = "object")]
    pub ticket: Option<PathBuf>,

    /// Read `name<TAB>URL` lines from a file instead of running the enumeration command.
    #[arg(long, value_name = "FILE", conflicts_with = "object")]
    pub bundles_from: Option<PathBuf>,

    /// Cache root; defaults to `cache_dir` from the sync config.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Local mount of the SYSVOL share for `smb://` URLs; defaults to
    /// `mount` from the sync config.
    #[arg(long, value_name = "DIR")]
    pub mount: Option<PathBuf>,

    /// Sync config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn run(self, verbosity: u8) -> Result<()> {
        sysvol_watchd::init_tracing(verbosity);

        let config_path = match self.config.clone() {
            Some(path) => path,
            None => sync_config_path().context("could not determine config directory")?,
        };
        let config = SyncConfig::load(&config_path);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        runtime.block_on(self.run_async(config))
    }

    async fn run_async(self, config: SyncConfig) -> Result<()> {
        let ticket = self.prepare_ticket(&config).await?;
        let bundles = self.bundle_set(&config, ticket.as_deref()).await?;
        let cache_dir = self.cache_dir.clone().unwrap_or(config.cache_dir);
        let share = match self.mount.clone().or(config.mount) {
            Some(mount) => LocalShare::with_mount(mount),
            None => LocalShare::new(),
        };

        let engine = SyncEngine::new(&cache_dir, Arc::new(share))
            .with_context(|| format!("cannot prepare cache directory {}", cache_dir.display()))?;

        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupted, cancelling synchronization");
                    cancel.cancel();
                }
            })
        };
        let result = engine.synchronize(&cancel, ticket.as_deref(), &bundles).await;
        interrupt.abort();

        match result {
            Ok(report) => {
                self.print(&report, &[])?;
                Ok(())
            }
            Err(SyncError::Bundles { failures, partial }) => {
                self.print(&partial, &failures)?;
                bail!("{} of {} GPOs failed to synchronize", failures.len(), bundles.len())
            }
            Err(err) => Err(err).context("synchronization failed"),
        }
    }

    /// Link the given ticket cache under the configured ticket directory,
    /// keyed by object name, and use the link from then on.
    async fn prepare_ticket(&self, config: &SyncConfig) -> Result<Option<PathBuf>> {
        let (Some(ticket), Some(object)) = (&self.ticket, &self.object) else {
            return Ok(None);
        };
        let link = config.krb5_cache_dir.join(strip_realm(object));
        ensure_ticket_link(ticket, &link)
            .await
            .with_context(|| format!("cannot link ticket cache {}", ticket.display()))?;
        Ok(Some(link))
    }

    async fn bundle_set(&self, config: &SyncConfig, ticket: Option<&Path>) -> Result<BundleSet> {
        let specs = if let Some(file) = &self.bundles_from {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("cannot read bundle list {}", file.display()))?;
            parse_listing(&text).with_context(|| format!("invalid bundle list {}", file.display()))?
        } else {
            let object = self
                .object
                .as_deref()
                .context("provide --object or --bundles-from")?;
            let class = self.object_class.context("--object needs --object-class")?;
            let server = self
                .server
                .as_deref()
                .or(config.server_url.as_deref())
                .context("no directory server: pass --server or set server_url in the sync config")?;
            list_bundles(&config.gpo_list_cmd, class, server, object, ticket)
                .await
                .with_context(|| format!("cannot list GPOs for {object}"))?
        };
        Ok(to_bundle_set(specs))
    }

    fn print(&self, report: &SyncReport, failures: &[BundleFailure]) -> Result<()> {
        if self.json {
            print_json(report, failures)
        } else {
            print_table(report, failures);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SyncOutputJson<'a> {
    #[serde(flatten)]
    report: &'a SyncReport,
    failures: Vec<FailureJson>,
}

#[derive(Serialize)]
struct FailureJson {
    name: String,
    error: String,
}

fn print_json(report: &SyncReport, failures: &[BundleFailure]) -> Result<()> {
    let payload = SyncOutputJson {
        report,
        failures: failures
            .iter()
            .map(|f| FailureJson {
                name: f.name.to_string(),
                error: f.error.to_string(),
            })
            .collect(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to render sync report JSON")?
    );
    Ok(())
}

#[derive(Tabled)]
struct SyncTableRow {
    #[tabled(rename = "gpo")]
    name: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "version")]
    version: String,
}

fn print_table(report: &SyncReport, failures: &[BundleFailure]) {
    let mut rows: Vec<SyncTableRow> = report
        .bundles
        .iter()
        .map(|bundle| {
            let (status, version) = match bundle.outcome {
                BundleOutcome::UpToDate { local, remote } => (
                    "up to date".green().to_string(),
                    format!("{local} (remote {remote})"),
                ),
                BundleOutcome::Downloaded { previous, current } => (
                    "downloaded".cyan().to_string(),
                    format!("{previous} → {current}"),
                ),
            };
            SyncTableRow {
                name: bundle.name.to_string(),
                status,
                version,
            }
        })
        .collect();
    rows.extend(failures.iter().map(|failure| SyncTableRow {
        name: failure.name.to_string(),
        status: "failed".red().to_string(),
        version: "-".to_string(),
    }));

    if rows.is_empty() {
        println!("No GPOs to synchronize.");
        return;
    }

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    println!(
        "{} downloaded, {} up to date, {} failed ({} ms)",
        report.downloaded(),
        report.bundles.len() - report.downloaded(),
        failures.len(),
        report.duration_ms
    );
    for failure in failures {
        eprintln!("{} {}: {}", "✗".red(), failure.name, failure.error);
    }
}
