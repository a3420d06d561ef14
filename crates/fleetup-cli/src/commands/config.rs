//! `fleetup config {set|show}`.

use anyhow::{Context as _, Result};
use clap::Subcommand;

use crate::Context;

/// Configuration management.
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Set a dotted-key value, e.g. `workers.count 8`.
    Set {
        /// Dotted key (`workers.count`, `validation.min_disk_gb`, ...).
        key: String,
        /// New value; numbers and booleans are parsed, everything else is a
        /// string.
        value: String,
    },
    /// Print the effective configuration.
    Show,
}

/// Entry point.
pub fn run(ctx: &Context, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            let mut config = ctx.config.clone();
            config.set_key(&key, &value)?;
            config
                .save(&ctx.workdir.config_file())
                .context("could not write configuration")?;
            println!("Set {key} = {value}");
            Ok(())
        }
        ConfigAction::Show => {
            println!("Work directory: {}", ctx.workdir.root().display());
            println!("Config file:    {}", ctx.workdir.config_file().display());
            println!();

            let mut masked = ctx.config.clone();
            if !masked.console.api_key.is_empty() {
                masked.console.api_key = "********".to_string();
            }
            if !masked.device.password.is_empty() {
                masked.device.password = "********".to_string();
            }
            println!("{}", serde_json::to_string_pretty(&masked)?);
            Ok(())
        }
    }
}
