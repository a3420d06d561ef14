//! Workflow and daemon status records.
//!
//! `status/devices/{serial}.json` is the per-device workflow record, written
//! atomically by the one workflow that owns the device and read by any number
//! of observers. `status/daemon.json` and `status/workers.json` are the
//! daemon-level snapshots. All three shapes live here so the CLI and the web
//! application parse exactly what the daemon writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fsio::{self, FsError};
use crate::inventory::HaRole;
use crate::workdir::WorkDir;

/// Workflow progress states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStatus {
    /// Queued, workflow not started.
    #[default]
    Pending,
    /// Pre- or post-flight validation in progress.
    Validating,
    /// Image download in progress.
    Downloading,
    /// Install job running on the device.
    Installing,
    /// Device rebooting into the new version.
    Rebooting,
    /// Terminal: reached the target version.
    Complete,
    /// Terminal for download-only jobs: all images present.
    DownloadComplete,
    /// Terminal: workflow failed; see `errors`.
    Failed,
    /// Terminal: cancelled by operator command.
    Cancelled,
    /// Terminal: no upgrade path for the starting version.
    Skipped,
}

impl UpgradeStatus {
    /// Whether a status describes a workflow that is (or was) mid-run.
    ///
    /// In-flight statuses with a fresh `last_updated` indicate a live writer
    /// and block a second workflow from touching the same device.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Validating | Self::Downloading | Self::Installing | Self::Rebooting
        )
    }

    /// Whether the workflow has ended, one way or another.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::DownloadComplete | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

impl std::fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Downloading => "downloading",
            Self::Installing => "installing",
            Self::Rebooting => "rebooting",
            Self::Complete => "complete",
            Self::DownloadComplete => "download_complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One captured workflow error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
    /// Phase the workflow was in.
    pub phase: String,
    /// Summary message.
    pub message: String,
    /// Underlying detail (API error chain etc.), possibly empty.
    #[serde(default)]
    pub details: String,
}

/// Result of the disk-space gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiskSpaceInfo {
    /// Free space reported by the device, GB.
    pub available_gb: f64,
    /// Configured requirement, GB.
    pub required_gb: f64,
    /// Whether the gate passed.
    pub check_passed: bool,
}

/// Per-device workflow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Device serial.
    pub serial: String,
    /// Host name, refreshed from the device when the workflow connects.
    #[serde(default)]
    pub hostname: String,
    /// Live HA role at workflow start.
    #[serde(default)]
    pub ha_role: HaRole,

    /// The version the device was on when a workflow first touched it.
    /// Written exactly once per run; the anchor for path lookup across
    /// daemon restarts.
    #[serde(default)]
    pub starting_version: String,
    /// Live version, updated after each reboot.
    #[serde(default)]
    pub current_version: String,
    /// Planned sequence from `starting_version`.
    #[serde(default)]
    pub upgrade_path: Vec<String>,
    /// 0-based position within `upgrade_path`; equals its length when the
    /// workflow is complete. Monotonically non-decreasing within a run.
    #[serde(default)]
    pub current_path_index: usize,
    /// Final element of `upgrade_path`.
    #[serde(default)]
    pub target_version: String,

    /// Workflow state.
    #[serde(default)]
    pub upgrade_status: UpgradeStatus,
    /// Fine-grained phase label (`pre_flight_validation`, `download`, ...).
    #[serde(default)]
    pub current_phase: String,
    /// 0-100.
    #[serde(default)]
    pub progress: u8,
    /// Operator-facing one-liner.
    #[serde(default)]
    pub upgrade_message: String,

    /// Versions this run actually downloaded.
    #[serde(default)]
    pub downloaded_versions: Vec<String>,
    /// Versions found already present on the device.
    #[serde(default)]
    pub skipped_versions: Vec<String>,
    /// Set by download-only jobs once every image is present.
    #[serde(default)]
    pub ready_for_install: bool,

    /// Last disk-space gate result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_space: Option<DiskSpaceInfo>,
    /// Why the device was skipped, when `upgrade_status` is `skipped`.
    #[serde(default)]
    pub skip_reason: String,
    /// Captured errors, oldest first.
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    /// Set on every persisted write.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl DeviceStatus {
    /// Fresh record for a device no workflow has touched yet.
    #[must_use]
    pub fn new(serial: impl Into<String>) -> Self {
        let serial = serial.into();
        Self {
            hostname: serial.clone(),
            serial,
            ha_role: HaRole::default(),
            starting_version: String::new(),
            current_version: String::new(),
            upgrade_path: Vec::new(),
            current_path_index: 0,
            target_version: String::new(),
            upgrade_status: UpgradeStatus::Pending,
            current_phase: String::new(),
            progress: 0,
            upgrade_message: String::new(),
            downloaded_versions: Vec::new(),
            skipped_versions: Vec::new(),
            ready_for_install: false,
            disk_space: None,
            skip_reason: String::new(),
            errors: Vec::new(),
            last_updated: None,
        }
    }

    /// Sets the starting-version anchor iff it has never been set. Returns
    /// whether this call wrote it.
    pub fn anchor_starting_version(&mut self, version: &str) -> bool {
        if self.starting_version.is_empty() {
            self.starting_version = version.to_string();
            true
        } else {
            false
        }
    }

    /// Advances `current_path_index`, never regressing it.
    pub fn advance_path_index(&mut self, index: usize) {
        if index > self.current_path_index {
            self.current_path_index = index;
        }
    }

    /// Appends an error record with the current phase stamped in.
    pub fn add_error(&mut self, phase: &str, message: impl Into<String>, details: impl Into<String>) {
        self.errors.push(ErrorRecord {
            timestamp: Utc::now(),
            phase: phase.to_string(),
            message: message.into(),
            details: details.into(),
        });
    }

    /// Whether the record describes a run that should be resumed rather than
    /// restarted: in flight, with the anchor set.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        (self.upgrade_status.is_in_flight() || self.upgrade_status == UpgradeStatus::Pending)
            && !self.starting_version.is_empty()
    }
}

/// Atomic reader/writer for `status/devices/{serial}.json`.
#[derive(Debug, Clone)]
pub struct StatusStore {
    workdir: WorkDir,
}

impl StatusStore {
    /// Store rooted at the given work directory.
    #[must_use]
    pub fn new(workdir: WorkDir) -> Self {
        Self { workdir }
    }

    /// Loads the record for `serial`, `None` when the device has never been
    /// touched.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] on read failure or malformed content.
    pub fn load(&self, serial: &str) -> Result<Option<DeviceStatus>, FsError> {
        fsio::read_json(&self.workdir.device_status_file(serial))
    }

    /// Persists the record atomically, stamping `last_updated`.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] on write failure.
    pub fn save(&self, status: &mut DeviceStatus) -> Result<(), FsError> {
        status.last_updated = Some(Utc::now());
        fsio::atomic_write_json(&self.workdir.device_status_file(&status.serial), status)
    }

    /// All serials with a status record.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] if the directory cannot be enumerated.
    pub fn serials(&self) -> Result<Vec<String>, FsError> {
        let files = fsio::list_json_files(&self.workdir.device_status_dir())?;
        Ok(files
            .into_iter()
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect())
    }
}

/// `status/daemon.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Whether the daemon believes itself to be running. Written `false` in
    /// the final snapshot at shutdown.
    pub running: bool,
    /// Configured worker count.
    pub workers: usize,
    /// Jobs currently in `queue/active/`.
    pub active_jobs: usize,
    /// Jobs currently in `queue/pending/`.
    pub pending_jobs: usize,
    /// Jobs in `queue/completed/`.
    pub completed_jobs: usize,
    /// Jobs in `queue/failed/`.
    pub failed_jobs: usize,
    /// Jobs in `queue/cancelled/`.
    pub cancelled_jobs: usize,
    /// Daemon process id, used by `fleetup daemon stop`.
    #[serde(default)]
    pub pid: u32,
    /// When this daemon instance started.
    pub started_at: DateTime<Utc>,
    /// Snapshot time.
    pub last_updated: DateTime<Utc>,
}

/// One worker's entry in `status/workers.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Stable worker index.
    pub worker_id: usize,
    /// `idle` or `busy`.
    pub status: WorkerState,
    /// Job being executed, empty when idle.
    #[serde(default)]
    pub current_job_id: String,
    /// Device being worked, empty when idle.
    #[serde(default)]
    pub current_device: String,
    /// Last state change.
    pub last_updated: DateTime<Utc>,
}

/// Worker occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for work.
    Idle,
    /// Executing a workflow.
    Busy,
}

/// `status/workers.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersSnapshot {
    /// All workers, by id.
    pub workers: Vec<WorkerStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_is_write_once() {
        let mut st = DeviceStatus::new("001");
        assert!(st.anchor_starting_version("10.5.1"));
        assert!(!st.anchor_starting_version("11.1.0"));
        assert_eq!(st.starting_version, "10.5.1");
    }

    #[test]
    fn path_index_never_regresses() {
        let mut st = DeviceStatus::new("001");
        st.advance_path_index(2);
        st.advance_path_index(1);
        assert_eq!(st.current_path_index, 2);
        st.advance_path_index(3);
        assert_eq!(st.current_path_index, 3);
    }

    #[test]
    fn store_round_trips_and_stamps_last_updated() {
        let dir = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(dir.path());
        let store = StatusStore::new(wd);

        let mut st = DeviceStatus::new("00123");
        st.upgrade_status = UpgradeStatus::Downloading;
        st.progress = 40;
        assert!(st.last_updated.is_none());
        store.save(&mut st).unwrap();
        assert!(st.last_updated.is_some());

        let loaded = store.load("00123").unwrap().unwrap();
        assert_eq!(loaded.upgrade_status, UpgradeStatus::Downloading);
        assert_eq!(loaded.progress, 40);
    }

    #[test]
    fn unknown_serial_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(WorkDir::new(dir.path()));
        assert!(store.load("ghost").unwrap().is_none());
    }

    #[test]
    fn in_flight_and_terminal_are_disjoint() {
        for status in [
            UpgradeStatus::Pending,
            UpgradeStatus::Validating,
            UpgradeStatus::Downloading,
            UpgradeStatus::Installing,
            UpgradeStatus::Rebooting,
            UpgradeStatus::Complete,
            UpgradeStatus::DownloadComplete,
            UpgradeStatus::Failed,
            UpgradeStatus::Cancelled,
            UpgradeStatus::Skipped,
        ] {
            assert!(
                !(status.is_in_flight() && status.is_terminal()),
                "{status} is both in-flight and terminal"
            );
        }
    }

    #[test]
    fn resumable_needs_anchor_and_open_status() {
        let mut st = DeviceStatus::new("001");
        assert!(!st.is_resumable(), "no anchor yet");

        st.starting_version = "10.0.2".to_string();
        st.upgrade_status = UpgradeStatus::Installing;
        assert!(st.is_resumable());

        st.upgrade_status = UpgradeStatus::Complete;
        assert!(!st.is_resumable(), "terminal runs are not resumed");
    }

    #[test]
    fn wire_names_match_the_control_plane_contract() {
        let mut st = DeviceStatus::new("001");
        st.upgrade_status = UpgradeStatus::DownloadComplete;
        let json = serde_json::to_string(&st).unwrap();
        assert!(json.contains("\"upgrade_status\":\"download_complete\""));
        assert!(json.contains("\"ready_for_install\":false"));
    }
}
