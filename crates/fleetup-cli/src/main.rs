//! fleetup: operator CLI for the upgrade orchestrator.
//!
//! A thin client over the file-system control plane: jobs and commands are
//! written as files, status is read from files, and only the device
//! commands (`device validate|metrics|discover`) talk to the network.
//!
//! Exit codes: 0 success, 1 operational failure, 2 usage or validation
//! error (duplicate or conflicting job, malformed descriptor, unknown or
//! unreachable device serial).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fleetup_core::config::Config;
use fleetup_core::guard::GuardRejection;
use fleetup_core::inventory::InventoryError;
use fleetup_core::job::JobShapeError;
use fleetup_core::workdir::{self, WorkDir};

mod commands;

use commands::{bulk, config as config_cmd, daemon, device, job, path};

/// fleetup - appliance fleet upgrade orchestrator.
#[derive(Parser, Debug)]
#[command(name = "fleetup")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Work directory. Falls back to $FLEETUP_HOME, then ~/.fleetup.json,
    /// then /opt/fleetup.
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the daemon process.
    Daemon {
        #[command(subcommand)]
        action: daemon::DaemonAction,
    },

    /// Submit and inspect upgrade jobs.
    Job {
        #[command(subcommand)]
        action: job::JobAction,
    },

    /// Inspect and discover devices.
    Device {
        #[command(subcommand)]
        action: device::DeviceAction,
    },

    /// Read or edit configuration.
    Config {
        #[command(subcommand)]
        action: config_cmd::ConfigAction,
    },

    /// Inspect the upgrade-path table.
    Path {
        #[command(subcommand)]
        action: path::PathAction,
    },

    /// Submit full upgrades for every serial in a CSV file.
    Upgrade {
        /// CSV with a `serial` column.
        csv: PathBuf,
        /// Perform all bookkeeping but simulate mutating device calls.
        #[arg(long)]
        dry_run: bool,
    },

    /// Submit full upgrades for HA pairs listed in a CSV file.
    UpgradeHaPairs {
        /// CSV with `serial_a` and `serial_b` columns.
        csv: PathBuf,
        /// Perform all bookkeeping but simulate mutating device calls.
        #[arg(long)]
        dry_run: bool,
    },

    /// Pre-download images for every serial in a CSV file.
    Download {
        /// CSV with a `serial` column.
        csv: PathBuf,
        /// Perform all bookkeeping but simulate mutating device calls.
        #[arg(long)]
        dry_run: bool,
    },

    /// Pre-download images for HA pairs listed in a CSV file.
    DownloadHaPairs {
        /// CSV with `serial_a` and `serial_b` columns.
        csv: PathBuf,
        /// Perform all bookkeeping but simulate mutating device calls.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Everything a subcommand needs.
pub struct Context {
    /// Resolved work directory.
    pub workdir: WorkDir,
    /// Loaded configuration.
    pub config: Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .with_target(false)
        .init();

    let (root, source) = workdir::resolve(cli.work_dir.as_deref());
    let workdir = WorkDir::new(root);
    tracing::debug!(work_dir = %workdir.root().display(), %source, "work directory resolved");

    let config = match Config::load(&workdir.config_file()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: could not load configuration: {err}");
            return ExitCode::from(1);
        }
    };
    let ctx = Context { workdir, config };

    let result = match cli.command {
        Commands::Daemon { action } => daemon::run(&ctx, action).await,
        Commands::Job { action } => job::run(&ctx, action),
        Commands::Device { action } => device::run(&ctx, action).await,
        Commands::Config { action } => config_cmd::run(&ctx, action),
        Commands::Path { action } => path::run(&ctx, action),
        Commands::Upgrade { csv, dry_run } => {
            bulk::run(&ctx, &csv, bulk::BulkKind::Upgrade, dry_run)
        }
        Commands::UpgradeHaPairs { csv, dry_run } => {
            bulk::run(&ctx, &csv, bulk::BulkKind::UpgradeHaPairs, dry_run)
        }
        Commands::Download { csv, dry_run } => {
            bulk::run(&ctx, &csv, bulk::BulkKind::Download, dry_run)
        }
        Commands::DownloadHaPairs { csv, dry_run } => {
            bulk::run(&ctx, &csv, bulk::BulkKind::DownloadHaPairs, dry_run)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// Maps failures to the documented exit-code categories: anything the user
/// can fix by correcting the submission exits 2, everything else exits 1.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<GuardRejection>().is_some()
        || err.downcast_ref::<JobShapeError>().is_some()
    {
        return 2;
    }
    match err.downcast_ref::<InventoryError>() {
        // A device the inventory cannot resolve is a bad submission; a
        // broken inventory file is an operational failure.
        Some(InventoryError::NotFound { .. } | InventoryError::MissingMgmtIp { .. }) => 2,
        Some(InventoryError::Store(_)) | None => 1,
    }
}
