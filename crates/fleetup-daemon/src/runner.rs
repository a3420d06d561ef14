//! Job execution: from an admitted descriptor to a terminal queue state.
//!
//! The runner resolves the job's devices against the inventory, opens one
//! device session per member (dry-run wrapped when the descriptor asks for
//! it), hands standalone jobs to the engine and HA jobs to the coordinator,
//! and finally renames the descriptor into `completed/`, `cancelled/`, or
//! `failed/` with the result stamped in.
//!
//! One transient case never terminates the job: the engine's
//! concurrent-writer guard. The descriptor goes back to `queue/pending/`
//! and is retried on a later scan, by which time the competing writer has
//! finished or its heartbeat has aged out.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fleetup_core::device_api::dry_run::DryRunApi;
use fleetup_core::device_api::{DeviceApi, DeviceConnector};
use fleetup_core::engine::{EngineError, UpgradeEngine, WorkflowOutcome};
use fleetup_core::fsio;
use fleetup_core::ha::{HaCoordinator, HaError, PairOutcome};
use fleetup_core::inventory::{Device, HaRole, Inventory};
use fleetup_core::job::{Job, JobResult, JobType};
use fleetup_core::status::{DeviceStatus, StatusStore, UpgradeStatus};
use fleetup_core::workdir::{QueueState, WorkDir};

use crate::pool::JobRunner;
use crate::state::DaemonState;

/// The production [`JobRunner`].
pub struct UpgradeRunner {
    workdir: WorkDir,
    inventory: Mutex<Inventory>,
    engine: Arc<UpgradeEngine>,
    connector: Arc<dyn DeviceConnector>,
    state: Arc<DaemonState>,
}

impl UpgradeRunner {
    /// Builds the runner over the shared engine and connector.
    #[must_use]
    pub fn new(
        workdir: WorkDir,
        inventory: Inventory,
        engine: Arc<UpgradeEngine>,
        connector: Arc<dyn DeviceConnector>,
        state: Arc<DaemonState>,
    ) -> Self {
        Self {
            workdir,
            inventory: Mutex::new(inventory),
            engine,
            connector,
            state,
        }
    }

    fn resolve_devices(&self, job: &Job) -> Result<Vec<Device>, String> {
        let mut inventory = self.inventory.lock().expect("inventory lock");
        if let Err(err) = inventory.reload() {
            warn!(%err, "inventory reload failed; using previous view");
        }
        job.devices
            .iter()
            .map(|serial| inventory.require(serial).cloned())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())
    }

    fn open_session(
        &self,
        device: &Device,
        dry_run: bool,
    ) -> Result<Arc<dyn DeviceApi>, String> {
        let api = self
            .connector
            .connect(device)
            .map_err(|e| format!("cannot open session to {}: {e}", device.serial))?;
        Ok(if dry_run {
            Arc::new(DryRunApi::new(api))
        } else {
            api
        })
    }

    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> Disposition {
        // Intake validates shape, but recovery can hand us whatever a
        // previous daemon had activated.
        if let Err(err) = job.validate_shape() {
            self.mark_devices_failed(job, &err.to_string());
            return Disposition::Terminal(JobResult::Failed);
        }

        let devices = match self.resolve_devices(job) {
            Ok(devices) => devices,
            Err(detail) => {
                self.mark_devices_failed(job, &detail);
                return Disposition::Terminal(JobResult::Failed);
            }
        };

        match job.job_type {
            JobType::Standalone | JobType::DownloadOnly => {
                let device = &devices[0];
                let api = match self.open_session(device, job.dry_run) {
                    Ok(api) => api,
                    Err(detail) => {
                        self.mark_devices_failed(job, &detail);
                        return Disposition::Terminal(JobResult::Failed);
                    }
                };
                let outcome = self
                    .engine
                    .run(
                        device,
                        HaRole::Standalone,
                        api,
                        job.job_type.is_download_only(),
                        cancel,
                    )
                    .await;
                self.dispose_single(job, outcome)
            }
            JobType::HaPair | JobType::DownloadOnlyHa => {
                let coordinator = HaCoordinator::new(&self.engine, self.connector.as_ref());
                let dry_run = job.dry_run;
                let outcome = coordinator
                    .run(
                        &devices[0],
                        &devices[1],
                        job.job_type.is_download_only(),
                        cancel,
                        |api| {
                            if dry_run {
                                Arc::new(DryRunApi::new(api))
                            } else {
                                api
                            }
                        },
                    )
                    .await;
                self.dispose_pair(job, outcome)
            }
        }
    }

    fn dispose_single(
        &self,
        job: &Job,
        outcome: Result<WorkflowOutcome, EngineError>,
    ) -> Disposition {
        match outcome {
            Ok(o) if o.is_success() => Disposition::Terminal(JobResult::Completed),
            Ok(WorkflowOutcome::Cancelled) => Disposition::Terminal(JobResult::Cancelled),
            Ok(_) => Disposition::Terminal(JobResult::Failed),
            Err(err) if err.is_transient() => {
                info!(job_id = %job.job_id, %err, "requeueing job behind a live workflow");
                Disposition::Requeue
            }
            Err(err) => {
                error!(job_id = %job.job_id, %err, "workflow failed");
                Disposition::Terminal(JobResult::Failed)
            }
        }
    }

    fn dispose_pair(&self, job: &Job, outcome: Result<PairOutcome, HaError>) -> Disposition {
        match outcome {
            Ok(pair) if pair.is_success() => Disposition::Terminal(JobResult::Completed),
            Ok(pair) if pair.was_cancelled() => Disposition::Terminal(JobResult::Cancelled),
            Ok(_) => Disposition::Terminal(JobResult::Failed),
            Err(HaError::MemberFailed { source, .. }) if source.is_transient() => {
                info!(job_id = %job.job_id, "requeueing HA job behind a live workflow");
                Disposition::Requeue
            }
            Err(err) => {
                // An ambiguous pair leaves no per-device record otherwise;
                // note the refusal on both members.
                if matches!(err, HaError::AmbiguousRoles { .. } | HaError::RoleQuery { .. }) {
                    self.mark_devices_failed(job, &err.to_string());
                }
                error!(job_id = %job.job_id, %err, "HA pair workflow failed");
                Disposition::Terminal(JobResult::Failed)
            }
        }
    }

    /// Records a planning-time failure on every member device so the status
    /// files tell the story even though no workflow ran.
    fn mark_devices_failed(&self, job: &Job, detail: &str) {
        let store = StatusStore::new(self.workdir.clone());
        for serial in &job.devices {
            let mut st = match store.load(serial) {
                Ok(Some(st)) if !st.upgrade_status.is_terminal() => st,
                Ok(Some(_)) | Ok(None) => DeviceStatus::new(serial),
                Err(_) => DeviceStatus::new(serial),
            };
            st.upgrade_status = UpgradeStatus::Failed;
            st.upgrade_message = detail.to_string();
            st.add_error("init", detail, String::new());
            if let Err(err) = store.save(&mut st) {
                warn!(%serial, %err, "could not record planning failure");
            }
        }
    }

    /// Renames the active descriptor to its terminal directory and stamps
    /// the result.
    fn file_descriptor(&self, job: &Job, result: JobResult) {
        let active = self.workdir.queue(QueueState::Active).join(job.file_name());
        let dest_state = match result {
            JobResult::Completed => QueueState::Completed,
            JobResult::Cancelled => QueueState::Cancelled,
            JobResult::Failed => QueueState::Failed,
        };

        let mut stamped = job.clone();
        stamped.completed_at = Some(Utc::now());
        stamped.result = Some(result);

        match fsio::move_into(&active, &self.workdir.queue(dest_state)) {
            Ok(dest) => {
                if let Err(err) = fsio::atomic_write_json(&dest, &stamped) {
                    warn!(job_id = %job.job_id, %err, "could not stamp filed descriptor");
                }
                info!(job_id = %job.job_id, state = %dest_state, "job filed");
            }
            Err(err) => {
                warn!(job_id = %job.job_id, %err, "active descriptor missing at completion");
            }
        }
    }

    fn requeue_descriptor(&self, job: &Job) {
        let active = self.workdir.queue(QueueState::Active).join(job.file_name());
        if let Err(err) = fsio::move_into(&active, &self.workdir.queue(QueueState::Pending)) {
            warn!(job_id = %job.job_id, %err, "could not requeue descriptor");
        }
    }
}

enum Disposition {
    Terminal(JobResult),
    Requeue,
}

#[async_trait]
impl JobRunner for UpgradeRunner {
    async fn run(&self, job: Job, cancel: CancellationToken) {
        let disposition = self.execute(&job, &cancel).await;
        match disposition {
            Disposition::Terminal(mut result) => {
                // An operator cancel that landed between phases can leave a
                // failed-looking outcome; the token is the ground truth.
                if result == JobResult::Failed && self.state.was_cancelled(&job.job_id) {
                    result = JobResult::Cancelled;
                }
                self.file_descriptor(&job, result);
            }
            Disposition::Requeue => self.requeue_descriptor(&job),
        }
        self.state.unregister(&job.job_id);
    }

    async fn quarantine_crashed(&self, job: Job, detail: String) {
        self.mark_devices_failed(&job, &format!("workflow crashed: {detail}"));
        self.file_descriptor(&job, JobResult::Failed);
        self.state.unregister(&job.job_id);
    }
}
