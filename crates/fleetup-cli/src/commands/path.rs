//! `fleetup path {show|validate}`.

use anyhow::{Context as _, Result, bail};
use clap::Subcommand;

use fleetup_core::upgrade_paths::UpgradePathTable;

use crate::Context;

/// Upgrade-path table inspection.
#[derive(Subcommand, Debug)]
pub enum PathAction {
    /// Show the table, or one entry.
    Show {
        /// Only the path for this source version.
        #[arg(long)]
        version: Option<String>,
    },
    /// Check the table for curation mistakes.
    Validate,
}

/// Entry point.
pub fn run(ctx: &Context, action: PathAction) -> Result<()> {
    let table = UpgradePathTable::load(&ctx.workdir.upgrade_paths_file())
        .context("could not load upgrade paths")?;

    match action {
        PathAction::Show { version } => {
            if let Some(version) = version {
                match table.plan(&version) {
                    Some(path) => println!("{version} -> {}", path.join(" -> ")),
                    None => println!("{version}: no upgrade path (devices on it are skipped)"),
                }
                return Ok(());
            }
            if table.is_empty() {
                println!(
                    "Upgrade-path table is empty ({})",
                    ctx.workdir.upgrade_paths_file().display()
                );
                return Ok(());
            }
            for (source, path) in table.entries() {
                println!("{source} -> {}", path.join(" -> "));
            }
            Ok(())
        }
        PathAction::Validate => {
            let problems = table.problems();
            if problems.is_empty() {
                println!("Upgrade-path table OK ({} source versions)", table.len());
                Ok(())
            } else {
                for problem in &problems {
                    eprintln!("problem: {problem}");
                }
                bail!("{} problem(s) in the upgrade-path table", problems.len());
            }
        }
    }
}
