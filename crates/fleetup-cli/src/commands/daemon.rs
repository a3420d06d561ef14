//! `fleetup daemon {start|stop|restart|status}`.
//!
//! Liveness comes from `{work_dir}/daemon.pid`, which the daemon writes
//! synchronously before accepting any work and removes at exit. The
//! periodic `status/daemon.json` snapshot is only the detail view; a
//! freshly started daemon is visible here before its first snapshot lands.

use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Subcommand;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use fleetup_core::fsio;
use fleetup_core::status::DaemonStatus;

use crate::Context;

/// Daemon process management.
#[derive(Subcommand, Debug)]
pub enum DaemonAction {
    /// Run the daemon in the foreground.
    Start,
    /// Signal the running daemon to shut down gracefully.
    Stop,
    /// Stop the running daemon, then start a new one in the foreground.
    Restart,
    /// Show the daemon's last status snapshot.
    Status,
}

/// Entry point.
pub async fn run(ctx: &Context, action: DaemonAction) -> Result<()> {
    match action {
        DaemonAction::Start => start(ctx),
        DaemonAction::Stop => stop(ctx).await,
        DaemonAction::Restart => {
            if live_pid(ctx).is_some() {
                stop(ctx).await?;
            }
            start(ctx)
        }
        DaemonAction::Status => status(ctx),
    }
}

fn start(ctx: &Context) -> Result<()> {
    if let Some(pid) = live_pid(ctx) {
        bail!("daemon already running (pid {pid})");
    }

    // The daemon binary ships next to this one.
    let daemon_bin = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("fleetup-daemon")))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| "fleetup-daemon".into());

    println!(
        "Starting fleetup daemon with {} workers (work dir: {})",
        ctx.config.worker_count(),
        ctx.workdir.root().display()
    );

    let status = std::process::Command::new(&daemon_bin)
        .arg("--work-dir")
        .arg(ctx.workdir.root())
        .status()
        .with_context(|| format!("could not launch {}", daemon_bin.display()))?;
    if !status.success() {
        bail!("daemon exited with {status}");
    }
    Ok(())
}

async fn stop(ctx: &Context) -> Result<()> {
    let Some(pid) = read_pid_file(ctx) else {
        println!("Daemon is not running (no pid file)");
        return Ok(());
    };
    if !process_alive(pid) {
        println!("Daemon is not running (stale pid file: {pid})");
        return Ok(());
    }

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .with_context(|| format!("could not signal pid {pid}"))?;
    println!("Sent SIGTERM to daemon (pid {pid})");

    // Graceful shutdown can take up to the configured worker grace; wait
    // for the process to exit.
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if !process_alive(pid) {
            println!("Daemon stopped");
            return Ok(());
        }
    }
    println!("Daemon is taking its time; check `fleetup daemon status`");
    Ok(())
}

fn status(ctx: &Context) -> Result<()> {
    let live = live_pid(ctx);
    let snapshot = read_status(ctx)?;

    let Some(status) = snapshot else {
        match live {
            Some(pid) => {
                println!("Daemon running (pid {pid}); first status snapshot not written yet");
            }
            None => {
                println!("Daemon status: not running (no pid file)");
                println!("  Expected snapshot: {}", ctx.workdir.daemon_status_file().display());
            }
        }
        return Ok(());
    };

    // The snapshot lags by up to one status interval; the pid file is the
    // liveness ground truth.
    println!("Daemon status:");
    println!("  Running:        {}", live.is_some() && status.running);
    println!("  PID:            {}", live.unwrap_or(status.pid));
    println!("  Workers:        {}", status.workers);
    println!("  Active jobs:    {}", status.active_jobs);
    println!("  Pending jobs:   {}", status.pending_jobs);
    println!("  Completed jobs: {}", status.completed_jobs);
    println!("  Failed jobs:    {}", status.failed_jobs);
    println!("  Cancelled jobs: {}", status.cancelled_jobs);
    println!("  Started at:     {}", status.started_at.to_rfc3339());
    println!("  Last updated:   {}", status.last_updated.to_rfc3339());
    Ok(())
}

fn read_status(ctx: &Context) -> Result<Option<DaemonStatus>> {
    fsio::read_json(&ctx.workdir.daemon_status_file()).context("could not read daemon status")
}

/// Pid from `daemon.pid`, whatever its liveness.
fn read_pid_file(ctx: &Context) -> Option<u32> {
    std::fs::read_to_string(ctx.workdir.pid_file())
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Pid from `daemon.pid`, only when that process is still alive.
fn live_pid(ctx: &Context) -> Option<u32> {
    read_pid_file(ctx).filter(|pid| process_alive(*pid))
}

fn process_alive(pid: u32) -> bool {
    pid != 0 && kill(Pid::from_raw(pid as i32), None).is_ok()
}
