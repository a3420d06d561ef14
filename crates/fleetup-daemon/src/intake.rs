//! Job intake: `queue/pending/` to the worker pool.
//!
//! Every scan walks the pending directory oldest-first, validates each
//! descriptor (shape, inventory resolution, duplicate-job guard), renames
//! admitted jobs into `queue/active/`, registers their cancellation tokens,
//! and submits them to the pool. A full pool puts the descriptor straight
//! back into `pending/`; a bad descriptor is quarantined into
//! `queue/failed/` with an `.error` sidecar naming the reason.
//!
//! Startup recovery is the same machinery pointed at `queue/active/`:
//! whatever the previous daemon left mid-flight is resubmitted, and the
//! engine's status records make the resumption idempotent.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetup_core::fsio;
use fleetup_core::guard;
use fleetup_core::inventory::Inventory;
use fleetup_core::job::Job;
use fleetup_core::workdir::{QueueState, WorkDir};

use crate::pool::{SubmitError, WorkItem, WorkerPool};
use crate::state::DaemonState;

/// Sidecar written next to a quarantined descriptor.
#[derive(Debug, Serialize)]
struct RejectionSidecar {
    error: String,
    rejected_at: String,
}

/// The intake scanner.
pub struct JobIntake {
    workdir: WorkDir,
    inventory: Mutex<Inventory>,
    pool: Arc<WorkerPool>,
    state: Arc<DaemonState>,
}

impl JobIntake {
    /// Builds the scanner.
    #[must_use]
    pub fn new(
        workdir: WorkDir,
        inventory: Inventory,
        pool: Arc<WorkerPool>,
        state: Arc<DaemonState>,
    ) -> Self {
        Self {
            workdir,
            inventory: Mutex::new(inventory),
            pool,
            state,
        }
    }

    /// Recovers state from a previous daemon: sweeps orphaned temp files
    /// and resubmits everything in `queue/active/`. Jobs that cannot be
    /// resubmitted immediately (full queue) stay in `active/` and block the
    /// loop until a worker frees up, which at startup means never long.
    pub async fn recover(&self) {
        match self.workdir.sweep_temp_files() {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "swept orphaned temp files"),
            Err(err) => warn!(%err, "temp-file sweep failed"),
        }

        let active = self.workdir.queue(QueueState::Active);
        let files = match fsio::list_json_files(&active) {
            Ok(files) => files,
            Err(err) => {
                warn!(%err, "cannot enumerate active queue for recovery");
                return;
            }
        };

        for path in files {
            let job = match fsio::read_json::<Job>(&path) {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(err) => {
                    self.quarantine(&path, &format!("unreadable active descriptor: {err}"));
                    continue;
                }
            };
            info!(job_id = %job.job_id, "resubmitting interrupted job");
            let token = self.state.register(&job.job_id, &job.devices);
            loop {
                let item = WorkItem {
                    job: job.clone(),
                    cancel: token.clone(),
                };
                match self.pool.submit(item) {
                    Ok(()) => break,
                    Err(SubmitError::Full) => {
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                    Err(SubmitError::ShuttingDown) => {
                        self.state.unregister(&job.job_id);
                        return;
                    }
                }
            }
        }
    }

    /// One pass over `queue/pending/`. Returns how many jobs were admitted.
    pub fn scan_once(&self) -> usize {
        let pending = self.workdir.queue(QueueState::Pending);
        let files = match fsio::list_json_files(&pending) {
            Ok(files) => files,
            Err(err) => {
                warn!(%err, "cannot enumerate pending queue");
                return 0;
            }
        };
        if files.is_empty() {
            return 0;
        }

        {
            let mut inventory = self.inventory.lock().expect("inventory lock");
            if let Err(err) = inventory.reload() {
                warn!(%err, "inventory reload failed; using previous view");
            }
        }

        let mut admitted = 0;
        for path in files {
            // Parse. Unreadable files are quarantined, not retried forever.
            let job = match fsio::read_json::<Job>(&path) {
                Ok(Some(job)) => job,
                Ok(None) => continue, // lost a race with another mover
                Err(err) => {
                    self.quarantine(&path, &format!("invalid job descriptor: {err}"));
                    continue;
                }
            };

            // Shape.
            if let Err(err) = job.validate_shape() {
                self.quarantine(&path, &err.to_string());
                continue;
            }

            // Every serial must resolve to a reachable device.
            {
                let inventory = self.inventory.lock().expect("inventory lock");
                if let Some(err) = job
                    .devices
                    .iter()
                    .find_map(|serial| inventory.require(serial).err())
                {
                    self.quarantine(&path, &err.to_string());
                    continue;
                }
            }

            // Duplicate-job guard, with this descriptor excluded from the
            // scan so it does not collide with itself.
            match guard::check_submission(
                &self.workdir,
                &job.devices,
                job.job_type,
                Some(&job.job_id),
            ) {
                Ok(Ok(())) => {}
                Ok(Err(rejection)) => {
                    self.quarantine(&path, &rejection.to_string());
                    continue;
                }
                Err(err) => {
                    warn!(%err, "guard scan failed; leaving descriptor for next pass");
                    continue;
                }
            }

            // Admit: pending -> active, register, submit.
            let active_path = match fsio::move_into(&path, &self.workdir.queue(QueueState::Active))
            {
                Ok(dest) => dest,
                Err(err) => {
                    warn!(job_id = %job.job_id, %err, "could not activate descriptor");
                    continue;
                }
            };

            let token = self.state.register(&job.job_id, &job.devices);
            match self.pool.submit(WorkItem {
                job: job.clone(),
                cancel: token,
            }) {
                Ok(()) => {
                    info!(job_id = %job.job_id, job_type = %job.job_type, "job admitted");
                    admitted += 1;
                }
                Err(err) => {
                    // Back to pending for the next scan; the queue is full
                    // so later files would not fit either.
                    self.state.unregister(&job.job_id);
                    if let Err(move_err) =
                        fsio::move_into(&active_path, &self.workdir.queue(QueueState::Pending))
                    {
                        warn!(job_id = %job.job_id, %move_err, "could not return descriptor to pending");
                    }
                    info!(job_id = %job.job_id, %err, "pool full; job deferred");
                    break;
                }
            }
        }
        admitted
    }

    /// Scan loop; returns when `shutdown` fires.
    pub async fn run(&self, scan_interval: std::time::Duration, shutdown: CancellationToken) {
        info!("job intake started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(scan_interval) => {
                    let _ = self.scan_once();
                }
            }
        }
        info!("job intake stopped");
    }

    fn quarantine(&self, path: &Path, error: &str) {
        warn!(file = %path.display(), error, "quarantining job descriptor");
        let failed_dir = self.workdir.queue(QueueState::Failed);
        match fsio::move_into(path, &failed_dir) {
            Ok(dest) => {
                let sidecar = dest.with_extension("error");
                let record = RejectionSidecar {
                    error: error.to_string(),
                    rejected_at: Utc::now().to_rfc3339(),
                };
                if let Err(err) = fsio::atomic_write_json(&sidecar, &record) {
                    warn!(%err, "could not write rejection sidecar");
                }
            }
            Err(err) => warn!(%err, "could not quarantine descriptor"),
        }
    }
}
