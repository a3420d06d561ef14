//! Periodic daemon and worker status snapshots.
//!
//! `status/daemon.json` and `status/workers.json` are the only files the
//! CLI and the web application need to answer "what is the daemon doing".
//! Queue counts are re-derived from the queue directories on every tick,
//! which keeps the snapshot honest across daemon restarts and out-of-band
//! file moves.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetup_core::config::Config;
use fleetup_core::fsio;
use fleetup_core::status::{DaemonStatus, WorkersSnapshot};
use fleetup_core::workdir::{QueueState, WorkDir};

use crate::pool::WorkerPool;
use crate::state::DaemonState;

/// The snapshot writer.
pub struct StatusWriter {
    workdir: WorkDir,
    config: Arc<Config>,
    pool: Arc<WorkerPool>,
    state: Arc<DaemonState>,
}

impl StatusWriter {
    /// Builds the writer.
    #[must_use]
    pub fn new(
        workdir: WorkDir,
        config: Arc<Config>,
        pool: Arc<WorkerPool>,
        state: Arc<DaemonState>,
    ) -> Self {
        Self {
            workdir,
            config,
            pool,
            state,
        }
    }

    /// Writes both snapshots once.
    pub fn write_once(&self, running: bool) {
        let snapshot = DaemonStatus {
            running,
            workers: self.config.worker_count(),
            active_jobs: self.count(QueueState::Active),
            pending_jobs: self.count(QueueState::Pending),
            completed_jobs: self.count(QueueState::Completed),
            failed_jobs: self.count(QueueState::Failed),
            cancelled_jobs: self.count(QueueState::Cancelled),
            pid: std::process::id(),
            started_at: self.state.started_at(),
            last_updated: Utc::now(),
        };
        if let Err(err) = fsio::atomic_write_json(&self.workdir.daemon_status_file(), &snapshot) {
            warn!(%err, "could not write daemon status");
        }

        let workers = WorkersSnapshot {
            workers: self.pool.worker_statuses(),
        };
        if let Err(err) = fsio::atomic_write_json(&self.workdir.workers_status_file(), &workers) {
            warn!(%err, "could not write worker status");
        }
    }

    /// Snapshot loop; writes a final `running: false` snapshot when
    /// `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("status writer started");
        let interval = self.config.status_interval();
        loop {
            self.write_once(true);
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
        self.write_once(false);
        info!("status writer stopped");
    }

    fn count(&self, state: QueueState) -> usize {
        fsio::list_json_files(&self.workdir.queue(state))
            .map(|files| files.len())
            .unwrap_or(0)
    }
}
