//! fleetup-daemon: the long-running upgrade orchestrator.
//!
//! Runs in the foreground (process supervision is the service manager's
//! job), owns the work directory's control plane, and shuts down gracefully
//! on SIGTERM or SIGINT: intake stops, every in-flight workflow is
//! cancelled, and workers get a configured grace period to observe the
//! token before being abandoned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fleetup_core::config::Config;
use fleetup_core::device_api::DeviceConnector;
use fleetup_core::device_api::http::HttpConnector;
use fleetup_core::engine::UpgradeEngine;
use fleetup_core::inventory::Inventory;
use fleetup_core::status::StatusStore;
use fleetup_core::upgrade_paths::UpgradePathTable;
use fleetup_core::validate::Validator;
use fleetup_core::workdir::{self, WorkDir};

use fleetup_daemon::commands::CommandIntake;
use fleetup_daemon::intake::JobIntake;
use fleetup_daemon::pool::WorkerPool;
use fleetup_daemon::runner::UpgradeRunner;
use fleetup_daemon::state::DaemonState;
use fleetup_daemon::status_writer::StatusWriter;

/// fleetup upgrade orchestrator daemon.
#[derive(Parser, Debug)]
#[command(name = "fleetup-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Work directory. Falls back to $FLEETUP_HOME, then ~/.fleetup.json,
    /// then /opt/fleetup.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (root, source) = workdir::resolve(args.work_dir.as_deref());
    let workdir = WorkDir::new(root);
    workdir
        .ensure_layout()
        .context("could not create work directory layout")?;

    // Console plus two daily files: structured JSON for tooling, plain text
    // for humans.
    let json_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_suffix("json")
        .build(workdir.structured_log_dir())
        .context("could not open structured log")?;
    let (json_writer, _json_guard) = tracing_appender::non_blocking(json_appender);

    let text_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_suffix("log")
        .build(workdir.text_log_dir())
        .context("could not open text log")?;
    let (text_writer, _text_guard) = tracing_appender::non_blocking(text_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(json_writer),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(text_writer),
        )
        .init();

    info!(work_dir = %workdir.root().display(), %source, "work directory resolved");

    let config = Arc::new(
        Config::load(&workdir.config_file()).context("could not load configuration")?,
    );
    if !workdir.config_file().exists() {
        config
            .save(&workdir.config_file())
            .context("could not write default configuration")?;
        info!("wrote default configuration");
    }

    let paths = Arc::new(
        UpgradePathTable::load(&workdir.upgrade_paths_file())
            .context("could not load upgrade paths")?,
    );
    if paths.is_empty() {
        warn!("upgrade-path table is empty; every job will be skipped");
    }

    let state = Arc::new(DaemonState::new());
    let engine = Arc::new(UpgradeEngine::new(
        StatusStore::new(workdir.clone()),
        Validator::new(workdir.clone(), config.validation.clone()),
        paths,
        Arc::clone(&config),
    ));
    let connector: Arc<dyn DeviceConnector> = Arc::new(HttpConnector::new(config.device.clone()));

    let runner = Arc::new(UpgradeRunner::new(
        workdir.clone(),
        Inventory::load(&workdir.inventory_file()).context("could not load inventory")?,
        Arc::clone(&engine),
        connector,
        Arc::clone(&state),
    ));

    let pool = Arc::new(WorkerPool::start(
        config.worker_count(),
        config.workers.queue_size,
        runner,
    ));

    let intake = JobIntake::new(
        workdir.clone(),
        Inventory::load(&workdir.inventory_file()).context("could not load inventory")?,
        Arc::clone(&pool),
        Arc::clone(&state),
    );
    let command_intake = CommandIntake::new(workdir.clone(), Arc::clone(&state));
    let status_writer = StatusWriter::new(
        workdir.clone(),
        Arc::clone(&config),
        Arc::clone(&pool),
        Arc::clone(&state),
    );

    let mut sigterm =
        signal(SignalKind::terminate()).context("could not install SIGTERM handler")?;

    // The pid file is the authoritative liveness signal for `fleetup daemon
    // stop|status`. It is written synchronously, before any work is
    // accepted, so there is no startup window where the daemon is invisible
    // to another terminal.
    let pid_path = workdir.pid_file();
    if let Some(pid) = read_live_pid(&pid_path) {
        bail!(
            "daemon already running (pid {pid}); remove {} if this is stale",
            pid_path.display()
        );
    }
    write_pid_file(&pid_path)?;

    // Pick up whatever the previous daemon left mid-flight before the scan
    // loops start racing for it.
    intake.recover().await;

    let shutdown = CancellationToken::new();
    let scan_interval = config.scan_interval();

    let intake_task = {
        let token = shutdown.clone();
        tokio::spawn(async move { intake.run(scan_interval, token).await })
    };
    let command_task = {
        let token = shutdown.clone();
        tokio::spawn(async move { command_intake.run(scan_interval, token).await })
    };
    let status_task = {
        let token = shutdown.clone();
        tokio::spawn(async move { status_writer.run(token).await })
    };

    info!(workers = config.worker_count(), "daemon started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    // Orderly teardown: stop the loops, cancel every workflow, then give
    // workers the configured grace to observe their tokens.
    shutdown.cancel();
    state.cancel_all();
    let _ = intake_task.await;
    let _ = command_task.await;
    let _ = status_task.await;

    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.shutdown(config.shutdown_grace()).await,
        Err(_) => warn!("worker pool still referenced at shutdown"),
    }

    remove_pid_file(&pid_path);
    info!("daemon stopped");
    Ok(())
}

/// Reads the pid file and returns the pid iff that process is still alive.
/// A stale file (dead pid, unparseable content) reads as absent.
fn read_live_pid(pid_path: &Path) -> Option<u32> {
    let pid: u32 = std::fs::read_to_string(pid_path).ok()?.trim().parse().ok()?;
    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok();
    alive.then_some(pid)
}

/// Writes this process's pid, blocking, before any work is accepted.
fn write_pid_file(pid_path: &Path) -> Result<()> {
    std::fs::write(pid_path, std::process::id().to_string())
        .with_context(|| format!("could not write pid file {}", pid_path.display()))?;
    info!(pid = std::process::id(), file = %pid_path.display(), "pid file written");
    Ok(())
}

/// Best-effort removal at shutdown; a leftover file is handled as stale by
/// the next startup's liveness check.
fn remove_pid_file(pid_path: &Path) {
    if pid_path.exists() {
        if let Err(err) = std::fs::remove_file(pid_path) {
            warn!(%err, "could not remove pid file");
        }
    }
}
