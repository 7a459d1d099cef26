//! `sysvol version` / `sysvol bump`: one-shot marker tools.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use sysvol_core::VersionFile;

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Directory holding the GPT.INI marker.
    pub dir: PathBuf,
}

impl VersionArgs {
    pub fn run(self) -> Result<()> {
        let marker = VersionFile::in_dir(&self.dir);
        let version = marker
            .read()
            .with_context(|| format!("cannot read version of {}", self.dir.display()))?;
        println!("{version}");
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct BumpArgs {
    /// Directory whose marker is incremented; created with version 1 when absent.
    pub dir: PathBuf,
}

impl BumpArgs {
    pub fn run(self) -> Result<()> {
        let marker = VersionFile::in_dir(&self.dir);
        let version = marker
            .bump()
            .with_context(|| format!("cannot bump version of {}", self.dir.display()))?;
        println!("{} → {version}", marker.path().display());
        Ok(())
    }
}
