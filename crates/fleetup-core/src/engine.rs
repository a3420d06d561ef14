//! The per-device upgrade state machine.
//!
//! One engine instance is shared by every workflow in the daemon. A workflow
//! drives a single device from its starting version to the final element of
//! its upgrade path: validate, download every remaining image (disk-checked
//! before each), install the final version, reboot, validate again, and
//! re-plan until the live version matches the target.
//!
//! Two properties hold across daemon restarts:
//!
//! - `starting_version` is captured exactly once per run and never
//!   overwritten; it anchors path lookup when a resumed device is already
//!   mid-path.
//! - A workflow refuses to start while an existing status record is
//!   in-flight with a fresh `last_updated`, which keeps a second daemon
//!   instance on the same work directory from double-driving a device.
//!
//! Cancellation is cooperative: the token is checked between phases and
//! inside every device-side wait, and a cancelled workflow records where it
//! stopped without attempting to undo in-flight device work.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::device_api::{
    ApiError, DeviceApi, jittered_backoff, sleep_or_cancel,
};
use crate::fsio::FsError;
use crate::inventory::{Device, HaRole};
use crate::status::{DeviceStatus, DiskSpaceInfo, StatusStore, UpgradeStatus};
use crate::upgrade_paths::UpgradePathTable;
use crate::validate::Validator;

/// How fresh an in-flight status record must be to block a second writer.
pub const STALE_WRITER_GRACE: Duration = Duration::from_secs(120);

/// Backoff base between download retry attempts.
const DOWNLOAD_RETRY_BASE: Duration = Duration::from_secs(2);

/// Backoff cap between download retry attempts.
const DOWNLOAD_RETRY_CAP: Duration = Duration::from_secs(60);

/// Phase labels recorded in `DeviceStatus.current_phase`.
mod phase {
    pub const INIT: &str = "init";
    pub const PRE_FLIGHT: &str = "pre_flight_validation";
    pub const SOFTWARE_CHECK: &str = "software_check";
    pub const DOWNLOAD: &str = "download";
    pub const INSTALL: &str = "install";
    pub const REBOOT: &str = "reboot";
    pub const POST_FLIGHT: &str = "post_flight_validation";
}

/// How a workflow ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowOutcome {
    /// Device is on the target version.
    Complete,
    /// Download-only job finished with every image present.
    DownloadComplete,
    /// No upgrade path for the starting version; device untouched.
    Skipped,
    /// Operator cancelled the workflow.
    Cancelled,
}

impl WorkflowOutcome {
    /// Whether the outcome counts as success for job placement.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Complete | Self::DownloadComplete)
    }
}

/// Workflow failures. Every variant has already been recorded into the
/// device's status file by the time the caller sees it.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An in-flight status record with a fresh heartbeat belongs to someone
    /// else; most likely a second daemon on the same work directory.
    #[error(
        "device {serial} appears owned by a live workflow ({status}, updated {age_secs}s ago)"
    )]
    ConcurrentWriter {
        /// Device serial.
        serial: String,
        /// Status found on disk.
        status: UpgradeStatus,
        /// Age of the record's heartbeat.
        age_secs: i64,
    },

    /// The disk gate failed before a download.
    #[error(
        "insufficient disk on {serial}: {available_gb:.2} GB available, {required_gb:.2} GB required"
    )]
    InsufficientDisk {
        /// Device serial.
        serial: String,
        /// Free space reported.
        available_gb: f64,
        /// Configured requirement.
        required_gb: f64,
    },

    /// The post-download inventory check found images missing.
    #[error("download verification failed on {serial}: missing {missing:?}")]
    VerificationFailed {
        /// Device serial.
        serial: String,
        /// Versions the device does not report as downloaded.
        missing: Vec<String>,
    },

    /// A device-API call failed in a named phase.
    #[error("{phase} failed on {serial}: {source}")]
    Phase {
        /// Device serial.
        serial: String,
        /// Phase label.
        phase: &'static str,
        /// Underlying capability error.
        #[source]
        source: ApiError,
    },

    /// The device never reached the target despite exhausting the install
    /// cycle budget.
    #[error("{serial} did not reach {target} after {cycles} install cycles (at {current})")]
    TargetNotReached {
        /// Device serial.
        serial: String,
        /// Planned target.
        target: String,
        /// Version the device ended on.
        current: String,
        /// Cycles attempted.
        cycles: usize,
    },

    /// The status file could not be persisted.
    #[error("status persistence failed for {serial}: {source}")]
    Status {
        /// Device serial.
        serial: String,
        /// Underlying store error.
        #[source]
        source: FsError,
    },
}

impl EngineError {
    /// Whether the error is the cancellation token surfacing through a
    /// phase call.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Phase {
                source: ApiError::Cancelled,
                ..
            }
        )
    }

    /// Whether retrying the workflow later can reasonably succeed without
    /// operator action. Only the concurrent-writer guard qualifies: the
    /// other writer either finishes or its heartbeat ages out.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConcurrentWriter { .. })
    }
}

/// The shared state machine.
pub struct UpgradeEngine {
    store: StatusStore,
    validator: Validator,
    paths: Arc<UpgradePathTable>,
    config: Arc<Config>,
    /// Devices whose software catalog was already refreshed this daemon run.
    software_checked: Mutex<HashSet<String>>,
}

impl UpgradeEngine {
    /// Builds the engine over its collaborators.
    #[must_use]
    pub fn new(
        store: StatusStore,
        validator: Validator,
        paths: Arc<UpgradePathTable>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            validator,
            paths,
            config,
            software_checked: Mutex::new(HashSet::new()),
        }
    }

    /// Read-only access to the status store, for callers that need to
    /// inspect records the engine wrote.
    #[must_use]
    pub fn status_store(&self) -> &StatusStore {
        &self.store
    }

    /// Drives one device to its terminal state.
    ///
    /// `role` is the live HA role the caller determined (standalone for
    /// non-HA jobs). `download_only` stops the workflow after the download
    /// phase with `download_complete`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] after recording the failure into the device's
    /// status file. Cancellation is not an error: it yields
    /// [`WorkflowOutcome::Cancelled`].
    pub async fn run(
        &self,
        device: &Device,
        role: HaRole,
        api: Arc<dyn DeviceApi>,
        download_only: bool,
        cancel: &CancellationToken,
    ) -> Result<WorkflowOutcome, EngineError> {
        let serial = device.serial.clone();
        let mut st = self.load_or_resume(&serial)?;
        st.ha_role = role;
        if st.hostname.is_empty() || st.hostname == serial {
            st.hostname = device.hostname.clone();
        }

        match self
            .drive(&mut st, api.as_ref(), download_only, cancel)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_cancellation() => {
                st.upgrade_status = UpgradeStatus::Cancelled;
                st.upgrade_message = format!("Cancelled during {}", st.current_phase);
                info!(%serial, phase = %st.current_phase, "workflow cancelled");
                self.persist(&mut st)?;
                Ok(WorkflowOutcome::Cancelled)
            }
            Err(err) => {
                let phase = st.current_phase.clone();
                let detail = match &err {
                    EngineError::Phase { source, .. } => source.to_string(),
                    other => other.to_string(),
                };
                st.add_error(&phase, err.to_string(), detail);
                st.upgrade_status = UpgradeStatus::Failed;
                st.upgrade_message = err.to_string();
                if let Err(save_err) = self.store.save(&mut st) {
                    warn!(%serial, %save_err, "could not record workflow failure");
                }
                Err(err)
            }
        }
    }

    fn load_or_resume(&self, serial: &str) -> Result<DeviceStatus, EngineError> {
        let existing = self.store.load(serial).map_err(|source| EngineError::Status {
            serial: serial.to_string(),
            source,
        })?;

        let Some(prev) = existing else {
            return Ok(DeviceStatus::new(serial));
        };

        if prev.upgrade_status.is_in_flight() {
            if let Some(updated) = prev.last_updated {
                let age = Utc::now().signed_duration_since(updated);
                if age
                    < chrono::Duration::from_std(STALE_WRITER_GRACE)
                        .unwrap_or_else(|_| chrono::Duration::seconds(120))
                {
                    return Err(EngineError::ConcurrentWriter {
                        serial: serial.to_string(),
                        status: prev.upgrade_status,
                        age_secs: age.num_seconds(),
                    });
                }
            }
        }

        if prev.is_resumable() {
            info!(
                %serial,
                starting_version = %prev.starting_version,
                status = %prev.upgrade_status,
                "resuming interrupted workflow"
            );
            return Ok(prev);
        }

        // A completed device that is still on its target re-confirms as a
        // fast no-op: keep the record so the anchor-based plan short-circuits
        // at "already at target" without any mutating call.
        if prev.upgrade_status == UpgradeStatus::Complete
            && !prev.target_version.is_empty()
            && prev.current_version == prev.target_version
        {
            return Ok(prev);
        }

        // Any other terminal state starts a fresh run with a fresh anchor.
        Ok(DeviceStatus::new(serial))
    }

    async fn drive(
        &self,
        st: &mut DeviceStatus,
        api: &dyn DeviceApi,
        download_only: bool,
        cancel: &CancellationToken,
    ) -> Result<WorkflowOutcome, EngineError> {
        let serial = st.serial.clone();

        // Init: capture identity and the live version. The anchor is only
        // written on the first run; resumed workflows keep it.
        st.current_phase = phase::INIT.to_string();
        st.upgrade_message = "Reading device identity".to_string();
        self.persist(st)?;

        let info = self.phase(&serial, phase::INIT, api.system_info()).await?;
        if !info.hostname.is_empty() {
            st.hostname = info.hostname.clone();
        }
        let live = info.sw_version.clone();
        st.current_version = live.clone();
        if st.anchor_starting_version(&live) {
            info!(%serial, starting_version = %live, "anchored starting version");
        } else {
            info!(
                %serial,
                starting_version = %st.starting_version,
                live = %live,
                "resuming against existing anchor"
            );
        }

        // Plan from the anchor, not the live version: the path was designed
        // for where the device started.
        let Some(path) = self.paths.plan(&st.starting_version).map(<[String]>::to_vec) else {
            let reason = format!("no upgrade path for version {}", st.starting_version);
            st.upgrade_status = UpgradeStatus::Skipped;
            st.skip_reason = reason.clone();
            st.upgrade_message = format!("Skipped: {reason}");
            warn!(%serial, %reason, "skipping device");
            self.persist(st)?;
            return Ok(WorkflowOutcome::Skipped);
        };

        st.upgrade_path = path.clone();
        st.target_version = path.last().cloned().unwrap_or_default();

        if live == st.target_version {
            st.upgrade_status = UpgradeStatus::Complete;
            st.advance_path_index(path.len());
            st.progress = 100;
            st.upgrade_message = format!("Device already at target version {live}");
            info!(%serial, version = %live, "already at target; nothing to do");
            self.persist(st)?;
            return Ok(WorkflowOutcome::Complete);
        }

        // Where in the path the device already is. A live version outside
        // the path re-plans from the start; downloads of present images are
        // skipped anyway.
        let start_index = path.iter().position(|v| *v == live).unwrap_or(0);
        st.advance_path_index(start_index);
        self.persist(st)?;

        self.ensure_not_cancelled(&serial, phase::PRE_FLIGHT, cancel)?;

        // Pre-flight baseline.
        st.current_phase = phase::PRE_FLIGHT.to_string();
        st.upgrade_status = UpgradeStatus::Validating;
        st.progress = 10;
        st.upgrade_message = "Collecting pre-flight baseline".to_string();
        self.persist(st)?;

        let pre = self
            .phase(&serial, phase::PRE_FLIGHT, self.validator.pre_flight(&serial, api))
            .await?;
        st.disk_space = Some(DiskSpaceInfo {
            available_gb: pre.disk_available_gb,
            required_gb: self.config.validation.min_disk_gb,
            check_passed: pre.disk_available_gb >= self.config.validation.min_disk_gb,
        });
        self.persist(st)?;

        // Refresh the device's software catalog once per daemon run. Slow
        // and frequently flaky on loaded devices; failure is not fatal.
        let needs_check = self
            .software_checked
            .lock()
            .expect("software-check set lock")
            .insert(serial.clone());
        if needs_check {
            st.current_phase = phase::SOFTWARE_CHECK.to_string();
            st.progress = 15;
            st.upgrade_message = "Refreshing available software versions".to_string();
            self.persist(st)?;
            match api.software_check().await {
                Ok(()) => {}
                Err(ApiError::Cancelled) => {
                    return Err(self.phase_err(&serial, phase::SOFTWARE_CHECK, ApiError::Cancelled));
                }
                Err(err) => {
                    warn!(%serial, %err, "software check failed; continuing with cached catalog");
                }
            }
        }

        // Download every remaining image before anything is installed.
        let remaining: Vec<String> = path[start_index..].to_vec();
        self.download_all(st, api, &remaining, cancel).await?;

        if download_only {
            st.upgrade_status = UpgradeStatus::DownloadComplete;
            st.ready_for_install = true;
            st.advance_path_index(path.len());
            st.progress = 100;
            let summary = download_summary(st);
            st.upgrade_message = summary;
            info!(%serial, "download-only workflow finished");
            self.persist(st)?;
            return Ok(WorkflowOutcome::DownloadComplete);
        }

        // Install cycles. The first cycle installs the final version and
        // lets the device's installer chain intermediates; if the device
        // lands short of the target, later cycles walk the next remaining
        // hop explicitly. At most one cycle per path element.
        let target = st.target_version.clone();
        let mut pre_baseline = Some(pre);

        for cycle in 0..path.len() {
            if st.current_version == target {
                break;
            }
            self.ensure_not_cancelled(&serial, phase::INSTALL, cancel)?;

            let install_version = if cycle == 0 {
                target.clone()
            } else {
                path.get(st.current_path_index)
                    .cloned()
                    .unwrap_or_else(|| target.clone())
            };

            st.current_phase = phase::INSTALL.to_string();
            st.upgrade_status = UpgradeStatus::Installing;
            st.progress = 60;
            st.upgrade_message = format!("Installing version {install_version}");
            self.persist(st)?;

            let job = self
                .phase(&serial, phase::INSTALL, api.install(&install_version))
                .await?;
            {
                let store = &self.store;
                let message_version = install_version.clone();
                let mut on_progress = |pct: u8| {
                    st.progress = 60 + (u16::from(pct) * 15 / 100) as u8;
                    st.upgrade_message = format!("Installing {message_version}: {pct}%");
                    if let Err(err) = store.save(st) {
                        warn!(%err, "progress write failed");
                    }
                };
                self.phase(
                    &serial,
                    phase::INSTALL,
                    api.wait_install(&job, cancel, &mut on_progress),
                )
                .await?;
            }

            // Reboot into the new image.
            st.current_phase = phase::REBOOT.to_string();
            st.upgrade_status = UpgradeStatus::Rebooting;
            st.progress = 75;
            st.upgrade_message = format!("Rebooting to activate {install_version}");
            self.persist(st)?;

            self.phase(&serial, phase::REBOOT, api.reboot()).await?;
            st.upgrade_message = "Waiting for device to come back online".to_string();
            self.persist(st)?;
            self.phase(
                &serial,
                phase::REBOOT,
                api.wait_online(self.config.reboot_timeout(), cancel),
            )
            .await?;

            // Re-plan: trust only what the device reports.
            let info = self.phase(&serial, phase::REBOOT, api.system_info()).await?;
            st.current_version = info.sw_version.clone();
            if let Some(i) = path.iter().position(|v| *v == st.current_version) {
                st.advance_path_index(i + 1);
            }
            info!(
                %serial,
                version = %st.current_version,
                path_index = st.current_path_index,
                "device back online"
            );

            // Post-flight comparison. Margin failures and collection
            // failures are recorded for operator review, never fatal.
            st.current_phase = phase::POST_FLIGHT.to_string();
            st.upgrade_status = UpgradeStatus::Validating;
            st.progress = 90;
            st.upgrade_message = "Running post-flight validation".to_string();
            self.persist(st)?;

            let baseline = match pre_baseline.take() {
                Some(b) => Some(b),
                None => self.validator.latest_pre_flight(&serial).unwrap_or_default(),
            };
            if let Some(baseline) = baseline {
                match self.validator.post_flight(&serial, api, &baseline).await {
                    Ok(report) if !report.validation_passed => {
                        st.add_error(
                            phase::POST_FLIGHT,
                            "post-upgrade metrics outside configured margins",
                            String::new(),
                        );
                    }
                    Ok(_) => {}
                    Err(ApiError::Cancelled) => {
                        return Err(self.phase_err(&serial, phase::POST_FLIGHT, ApiError::Cancelled));
                    }
                    Err(err) => {
                        warn!(%serial, %err, "post-flight collection failed; continuing");
                        st.add_error(
                            phase::POST_FLIGHT,
                            "post-flight metric collection failed",
                            err.to_string(),
                        );
                    }
                }
            } else {
                warn!(%serial, "no pre-flight baseline available; skipping comparison");
            }
            self.persist(st)?;
        }

        if st.current_version != target {
            return Err(EngineError::TargetNotReached {
                serial,
                target,
                current: st.current_version.clone(),
                cycles: path.len(),
            });
        }

        st.upgrade_status = UpgradeStatus::Complete;
        st.advance_path_index(path.len());
        st.progress = 100;
        st.upgrade_message = format!("Upgrade completed successfully to version {target}");
        info!(%serial, version = %target, "upgrade complete");
        self.persist(st)?;
        Ok(WorkflowOutcome::Complete)
    }

    /// Downloads every version in `remaining` that the device does not
    /// already hold, disk-checking before each, then hard-verifies the full
    /// set is present.
    async fn download_all(
        &self,
        st: &mut DeviceStatus,
        api: &dyn DeviceApi,
        remaining: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let serial = st.serial.clone();
        let total = remaining.len().max(1);

        st.current_phase = phase::DOWNLOAD.to_string();
        st.upgrade_status = UpgradeStatus::Downloading;
        st.progress = 25;
        st.upgrade_message = format!("Preparing to download {} version(s)", remaining.len());
        self.persist(st)?;

        for (i, version) in remaining.iter().enumerate() {
            self.ensure_not_cancelled(&serial, phase::DOWNLOAD, cancel)?;

            // The disk gate runs before every download, not once per job:
            // each image consumes space the next one needs.
            let disk = self
                .phase(&serial, phase::DOWNLOAD, self.validator.disk_precheck(api))
                .await?;
            st.disk_space = Some(disk);
            if !disk.check_passed {
                self.persist(st)?;
                return Err(EngineError::InsufficientDisk {
                    serial,
                    available_gb: disk.available_gb,
                    required_gb: disk.required_gb,
                });
            }

            let sw = self
                .phase(&serial, phase::DOWNLOAD, api.software_info())
                .await?;
            if sw.has_downloaded(version) {
                if !st.skipped_versions.contains(version) {
                    st.skipped_versions.push(version.clone());
                }
                st.upgrade_message =
                    format!("Version {version} already downloaded, skipping");
                info!(%serial, version = %version, "image already present");
                self.persist(st)?;
                continue;
            }

            self.download_one(st, api, version, i, total, cancel).await?;

            if !st.downloaded_versions.contains(version) {
                st.downloaded_versions.push(version.clone());
            }
            st.upgrade_message = format!("Downloaded {version}");
            self.persist(st)?;
        }

        // Hard gate: everything the install phase needs must be present.
        let sw = self
            .phase(&serial, phase::DOWNLOAD, api.software_info())
            .await?;
        let missing: Vec<String> = remaining
            .iter()
            .filter(|v| !sw.has_downloaded(v))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::VerificationFailed { serial, missing });
        }
        Ok(())
    }

    /// One image download with the configured retry budget. Stalls fail the
    /// phase immediately; transport-level failures retry with backoff.
    async fn download_one(
        &self,
        st: &mut DeviceStatus,
        api: &dyn DeviceApi,
        version: &str,
        index: usize,
        total: usize,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let serial = st.serial.clone();
        let attempts = self.config.device.download_retry_attempts.max(1);
        let slice = 30 / total as u16;
        let base_progress = 25 + index as u16 * slice;

        for attempt in 1..=attempts {
            st.upgrade_message = format!(
                "Downloading version {version} ({}/{total}, attempt {attempt}/{attempts})",
                index + 1
            );
            st.progress = base_progress as u8;
            self.persist(st)?;

            let result = async {
                let job = api.download(version).await?;
                let store = &self.store;
                let mut on_progress = |pct: u8| {
                    st.progress = (base_progress + u16::from(pct) * slice / 100) as u8;
                    st.upgrade_message = format!("Downloading {version}: {pct}%");
                    if let Err(err) = store.save(st) {
                        warn!(%err, "progress write failed");
                    }
                };
                api.wait_download(&job, cancel, &mut on_progress).await
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(ApiError::Cancelled) => {
                    return Err(self.phase_err(&serial, phase::DOWNLOAD, ApiError::Cancelled));
                }
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(
                        %serial,
                        version,
                        attempt,
                        attempts,
                        %err,
                        "download attempt failed; retrying"
                    );
                    sleep_or_cancel(
                        jittered_backoff(attempt - 1, DOWNLOAD_RETRY_BASE, DOWNLOAD_RETRY_CAP),
                        cancel,
                    )
                    .await
                    .map_err(|e| self.phase_err(&serial, phase::DOWNLOAD, e))?;
                }
                Err(err) => return Err(self.phase_err(&serial, phase::DOWNLOAD, err)),
            }
        }
        unreachable!("download retry loop returns on final attempt")
    }

    fn persist(&self, st: &mut DeviceStatus) -> Result<(), EngineError> {
        let serial = st.serial.clone();
        self.store
            .save(st)
            .map_err(|source| EngineError::Status { serial, source })
    }

    async fn phase<T>(
        &self,
        serial: &str,
        phase: &'static str,
        fut: impl std::future::Future<Output = Result<T, ApiError>>,
    ) -> Result<T, EngineError> {
        fut.await.map_err(|source| EngineError::Phase {
            serial: serial.to_string(),
            phase,
            source,
        })
    }

    fn phase_err(&self, serial: &str, phase: &'static str, source: ApiError) -> EngineError {
        EngineError::Phase {
            serial: serial.to_string(),
            phase,
            source,
        }
    }

    fn ensure_not_cancelled(
        &self,
        serial: &str,
        phase: &'static str,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            Err(self.phase_err(serial, phase, ApiError::Cancelled))
        } else {
            Ok(())
        }
    }
}

fn download_summary(st: &DeviceStatus) -> String {
    let downloaded = st.downloaded_versions.len();
    let skipped = st.skipped_versions.len();
    match (downloaded, skipped) {
        (0, _) => format!(
            "All {skipped} version(s) already downloaded: {}",
            st.skipped_versions.join(", ")
        ),
        (_, 0) => format!(
            "Downloaded {downloaded} version(s): {}",
            st.downloaded_versions.join(", ")
        ),
        _ => format!(
            "Downloaded {downloaded} version(s): {}. Skipped {skipped} already present: {}",
            st.downloaded_versions.join(", "),
            st.skipped_versions.join(", ")
        ),
    }
}
