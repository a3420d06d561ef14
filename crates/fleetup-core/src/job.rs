//! Job descriptors.
//!
//! A job is created by a client (CLI or web app) as a JSON file in
//! `queue/pending/` and owned by the daemon from the moment it is renamed
//! into `queue/active/`. Its canonical location encodes its status; the
//! fields below travel with it unchanged apart from the completion stamp the
//! daemon adds when it reaches a terminal directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four job variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Full upgrade of one standalone device.
    Standalone,
    /// Full upgrade of an HA pair, passive first.
    HaPair,
    /// Pre-download images on one device, no install or reboot.
    DownloadOnly,
    /// Pre-download images on both members of an HA pair.
    DownloadOnlyHa,
}

impl JobType {
    /// Download-only and full upgrades must never run concurrently on one
    /// device; this is the conflict axis the duplicate-job guard checks.
    #[must_use]
    pub fn family(self) -> JobFamily {
        match self {
            Self::Standalone | Self::HaPair => JobFamily::FullUpgrade,
            Self::DownloadOnly | Self::DownloadOnlyHa => JobFamily::DownloadOnly,
        }
    }

    /// How many device serials a descriptor of this type must carry.
    #[must_use]
    pub fn expected_devices(self) -> usize {
        match self {
            Self::Standalone | Self::DownloadOnly => 1,
            Self::HaPair | Self::DownloadOnlyHa => 2,
        }
    }

    /// Whether the workflow stops after the download phase.
    #[must_use]
    pub fn is_download_only(self) -> bool {
        self.family() == JobFamily::DownloadOnly
    }

    /// Whether the job addresses an HA pair.
    #[must_use]
    pub fn is_ha(self) -> bool {
        matches!(self, Self::HaPair | Self::DownloadOnlyHa)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Standalone => "standalone",
            Self::HaPair => "ha_pair",
            Self::DownloadOnly => "download_only",
            Self::DownloadOnlyHa => "download_only_ha",
        };
        f.write_str(s)
    }
}

/// The two mutually exclusive job families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFamily {
    /// Download, install, reboot, validate.
    FullUpgrade,
    /// Download only.
    DownloadOnly,
}

impl std::fmt::Display for JobFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FullUpgrade => f.write_str("full-upgrade"),
            Self::DownloadOnly => f.write_str("download-only"),
        }
    }
}

/// Terminal result stamped into the descriptor when the daemon files it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    /// At least one member workflow reached its goal state.
    Completed,
    /// Every member workflow was non-successful.
    Failed,
    /// Cancelled by operator command.
    Cancelled,
}

/// One job descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique id; also the file stem of the descriptor.
    pub job_id: String,
    /// Job variant.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// One serial for standalone variants, two for HA variants.
    pub devices: Vec<String>,
    /// Display name of the HA pair, empty for standalone jobs.
    #[serde(default)]
    pub ha_pair_name: String,
    /// Replace mutating device calls with simulated delays.
    #[serde(default)]
    pub dry_run: bool,
    /// Client-side creation time.
    pub created_at: DateTime<Utc>,
    /// Stamped by the daemon when the job leaves `active/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Stamped together with `completed_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl Job {
    /// Builds a fresh descriptor with a generated creation stamp.
    #[must_use]
    pub fn new(job_id: impl Into<String>, job_type: JobType, devices: Vec<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_type,
            devices,
            ha_pair_name: String::new(),
            dry_run: false,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
        }
    }

    /// File name of the descriptor (`{job_id}.json`).
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.json", self.job_id)
    }

    /// Structural validation of a descriptor read from disk.
    ///
    /// # Errors
    ///
    /// Returns [`JobShapeError`] when the id is empty, the device list does
    /// not match the type, or a serial is blank or repeated.
    pub fn validate_shape(&self) -> Result<(), JobShapeError> {
        if self.job_id.is_empty() {
            return Err(JobShapeError::EmptyJobId);
        }
        let expected = self.job_type.expected_devices();
        if self.devices.len() != expected {
            return Err(JobShapeError::DeviceCount {
                job_type: self.job_type,
                expected,
                actual: self.devices.len(),
            });
        }
        if self.devices.iter().any(String::is_empty) {
            return Err(JobShapeError::EmptySerial);
        }
        if expected == 2 && self.devices[0] == self.devices[1] {
            return Err(JobShapeError::RepeatedSerial {
                serial: self.devices[0].clone(),
            });
        }
        Ok(())
    }
}

/// Structural problems with a job descriptor.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobShapeError {
    /// `job_id` was empty.
    #[error("job_id must not be empty")]
    EmptyJobId,

    /// Wrong number of serials for the job type.
    #[error("{job_type} jobs need exactly {expected} device(s), got {actual}")]
    DeviceCount {
        /// Declared type.
        job_type: JobType,
        /// Required count.
        expected: usize,
        /// Supplied count.
        actual: usize,
    },

    /// A serial in the device list was blank.
    #[error("device list contains an empty serial")]
    EmptySerial,

    /// An HA descriptor listed the same serial twice.
    #[error("device {serial} appears twice in an HA pair job")]
    RepeatedSerial {
        /// The repeated serial.
        serial: String,
    },
}
