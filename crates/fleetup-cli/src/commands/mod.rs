//! CLI subcommand implementations.

pub mod bulk;
pub mod config;
pub mod daemon;
pub mod device;
pub mod job;
pub mod path;

use anyhow::{Context as _, Result};
use uuid::Uuid;

use fleetup_core::fsio;
use fleetup_core::guard;
use fleetup_core::inventory::Inventory;
use fleetup_core::job::{Job, JobType};
use fleetup_core::workdir::QueueState;

use crate::Context;

/// Client-side admission check and descriptor write. The daemon re-runs the
/// same validation; this copy exists to reject a bad submission before it
/// ever hits the queue, with the blocking job named.
pub(crate) fn submit_job(
    ctx: &Context,
    job_type: JobType,
    devices: Vec<String>,
    ha_pair_name: String,
    dry_run: bool,
) -> Result<Job> {
    let mut job = Job::new(format!("cli-{}", Uuid::new_v4()), job_type, devices);
    job.ha_pair_name = ha_pair_name;
    job.dry_run = dry_run;
    job.validate_shape()?;

    let inventory =
        Inventory::load(&ctx.workdir.inventory_file()).context("could not load inventory")?;
    for serial in &job.devices {
        inventory.require(serial)?;
    }

    guard::check_submission(&ctx.workdir, &job.devices, job.job_type, None)
        .context("could not scan job queues")??;

    let dest = ctx.workdir.queue(QueueState::Pending).join(job.file_name());
    fsio::atomic_write_json(&dest, &job).context("could not write job descriptor")?;
    Ok(job)
}
