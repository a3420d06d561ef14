//! `fleetup job {submit|list|status|cancel}`.

use anyhow::{Context as _, Result, bail};
use clap::Subcommand;
use uuid::Uuid;

use fleetup_core::command::Command;
use fleetup_core::fsio;
use fleetup_core::job::{Job, JobType};
use fleetup_core::status::DeviceStatus;
use fleetup_core::workdir::QueueState;

use crate::Context;
use crate::commands::submit_job;

/// Job management.
#[derive(Subcommand, Debug)]
pub enum JobAction {
    /// Queue a new upgrade or download job.
    Submit {
        /// Target device serial (repeat twice for an HA pair).
        #[arg(long = "device", required = true)]
        devices: Vec<String>,
        /// Display name when submitting an HA pair.
        #[arg(long, default_value = "")]
        ha_pair_name: String,
        /// Download images only; skip install and reboot.
        #[arg(long)]
        download_only: bool,
        /// Perform all bookkeeping but simulate mutating device calls.
        #[arg(long)]
        dry_run: bool,
    },

    /// List jobs across the queue states.
    List {
        /// Only this state (pending, active, completed, cancelled, failed).
        #[arg(long)]
        state: Option<String>,
    },

    /// Show one job's descriptor and its devices' workflow status.
    Status {
        /// Job id.
        job_id: String,
    },

    /// Ask the daemon to cancel a job.
    Cancel {
        /// Job id.
        job_id: String,
        /// Reason recorded with the cancellation.
        #[arg(long, default_value = "operator request")]
        reason: String,
    },
}

/// Entry point.
pub fn run(ctx: &Context, action: JobAction) -> Result<()> {
    match action {
        JobAction::Submit {
            devices,
            ha_pair_name,
            download_only,
            dry_run,
        } => submit(ctx, devices, ha_pair_name, download_only, dry_run),
        JobAction::List { state } => list(ctx, state.as_deref()),
        JobAction::Status { job_id } => status(ctx, &job_id),
        JobAction::Cancel { job_id, reason } => cancel(ctx, &job_id, &reason),
    }
}

fn submit(
    ctx: &Context,
    devices: Vec<String>,
    ha_pair_name: String,
    download_only: bool,
    dry_run: bool,
) -> Result<()> {
    let job_type = match (devices.len(), download_only) {
        (1, false) => JobType::Standalone,
        (1, true) => JobType::DownloadOnly,
        (2, false) => JobType::HaPair,
        (2, true) => JobType::DownloadOnlyHa,
        (n, _) => bail!("expected 1 device or 2 (HA pair), got {n}"),
    };

    let job = submit_job(ctx, job_type, devices, ha_pair_name, dry_run)?;

    println!("Submitted {} job {}", job.job_type, job.job_id);
    for serial in &job.devices {
        println!("  Device: {serial}");
    }
    if job.dry_run {
        println!("  Mode: DRY RUN");
    }
    println!("\nMonitor with: fleetup job status {}", job.job_id);
    Ok(())
}

fn list(ctx: &Context, only: Option<&str>) -> Result<()> {
    let states: Vec<QueueState> = match only {
        None => QueueState::ALL.to_vec(),
        Some(name) => vec![parse_state(name)?],
    };

    let mut total = 0;
    for state in states {
        let files = fsio::list_json_files(&ctx.workdir.queue(state))
            .with_context(|| format!("could not list queue/{state}"))?;
        if files.is_empty() {
            continue;
        }
        println!("{state}:");
        for path in files {
            match fsio::read_json::<Job>(&path) {
                Ok(Some(job)) => {
                    println!(
                        "  {}  {}  [{}]  created {}",
                        job.job_id,
                        job.job_type,
                        job.devices.join(", "),
                        job.created_at.to_rfc3339()
                    );
                    total += 1;
                }
                _ => println!("  {} (unreadable)", path.display()),
            }
        }
    }
    if total == 0 {
        println!("No jobs");
    }
    Ok(())
}

fn status(ctx: &Context, job_id: &str) -> Result<()> {
    let Some((state, job)) = find_job(ctx, job_id)? else {
        bail!("job {job_id} not found in any queue");
    };

    println!("Job {job_id}:");
    println!("  State:   {state}");
    println!("  Type:    {}", job.job_type);
    println!("  Dry run: {}", job.dry_run);
    if let Some(result) = job.result {
        println!("  Result:  {result:?}");
    }
    if let Some(completed_at) = job.completed_at {
        println!("  Completed at: {}", completed_at.to_rfc3339());
    }

    for serial in &job.devices {
        let status: Option<DeviceStatus> =
            fsio::read_json(&ctx.workdir.device_status_file(serial))?;
        match status {
            Some(st) => {
                println!(
                    "  Device {serial}: {} ({}%) {} -> {}  {}",
                    st.upgrade_status,
                    st.progress,
                    if st.starting_version.is_empty() {
                        "?"
                    } else {
                        &st.starting_version
                    },
                    if st.target_version.is_empty() {
                        "?"
                    } else {
                        &st.target_version
                    },
                    st.upgrade_message
                );
            }
            None => println!("  Device {serial}: no workflow status yet"),
        }
    }
    Ok(())
}

fn cancel(ctx: &Context, job_id: &str, reason: &str) -> Result<()> {
    let command = Command::cancel_job(job_id, reason);
    let file = ctx
        .workdir
        .commands_incoming()
        .join(format!("cancel-{}.json", Uuid::new_v4()));
    fsio::atomic_write_json(&file, &command).context("could not write command file")?;
    println!("Cancellation for job {job_id} queued");
    Ok(())
}

fn find_job(ctx: &Context, job_id: &str) -> Result<Option<(QueueState, Job)>> {
    for state in QueueState::ALL {
        let path = ctx.workdir.queue(state).join(format!("{job_id}.json"));
        if let Some(job) = fsio::read_json::<Job>(&path)? {
            return Ok(Some((state, job)));
        }
    }
    Ok(None)
}

fn parse_state(name: &str) -> Result<QueueState> {
    QueueState::ALL
        .into_iter()
        .find(|s| s.dir_name() == name)
        .with_context(|| format!("unknown queue state: {name}"))
}
