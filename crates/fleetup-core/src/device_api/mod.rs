//! The device-API capability.
//!
//! [`DeviceApi`] is the one polymorphic seam in the system: everything the
//! upgrade workflow needs from an appliance's management interface, and
//! nothing else. Three implementations live alongside the trait:
//!
//! - [`http::HttpDeviceApi`]: the production XML-over-HTTPS client,
//! - [`mock::MockDevice`]: a scripted in-memory device for tests,
//! - [`dry_run::DryRunApi`]: a decorator that forwards reads and replaces
//!   every mutating call with a cancellable sleep.
//!
//! The `wait_*` operations poll with jittered exponential backoff, declare a
//! stall when a device job reports no progress change for the configured
//! window, and observe the caller's cancellation token at every pause.

pub mod dry_run;
pub mod http;
pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::inventory::{Device, HaRole};

/// Identity and version facts from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    /// Configured host name.
    pub hostname: String,
    /// Device serial.
    pub serial: String,
    /// Hardware model.
    pub model: String,
    /// Running software version.
    pub sw_version: String,
}

/// One routing-table entry, canonicalized by the validator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination prefix.
    pub destination: String,
    /// Next hop.
    pub gateway: String,
    /// Egress interface.
    pub interface: String,
}

/// One ARP-table entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArpEntry {
    /// Protocol address.
    pub ip: String,
    /// Hardware address.
    pub mac: String,
}

/// Health metrics sampled for pre/post-flight comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMetrics {
    /// Active TCP session count.
    pub tcp_sessions: u64,
    /// Routing table.
    pub routes: Vec<RouteEntry>,
    /// ARP table.
    pub arp_entries: Vec<ArpEntry>,
    /// Free space on the upgrade partition, GB.
    pub disk_available_gb: f64,
}

/// Downloaded/available version lists from the device's software catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftwareInfo {
    /// Versions whose images are present on the device.
    pub downloaded: Vec<String>,
    /// Versions the device's catalog offers.
    pub available: Vec<String>,
}

impl SoftwareInfo {
    /// Whether the image for `version` is present on the device.
    #[must_use]
    pub fn has_downloaded(&self, version: &str) -> bool {
        self.downloaded.iter().any(|v| v == version)
    }
}

/// Handle to an asynchronous job running on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceJob {
    /// Device-assigned job id.
    pub id: String,
}

/// Failure modes of the capability, mirroring the workflow error taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Transport-level failure reaching the device. Retryable.
    #[error("device unreachable: {detail}")]
    Unreachable {
        /// Transport detail.
        detail: String,
    },

    /// The device rejected our credentials. Not retryable.
    #[error("authentication rejected: {detail}")]
    Auth {
        /// Device-side detail.
        detail: String,
    },

    /// An operation exceeded its configured deadline.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// Deadline that elapsed.
        seconds: u64,
    },

    /// A device job reported no progress change for the stall window.
    #[error("{operation} stalled: no progress for {seconds}s")]
    Stalled {
        /// What was being waited for.
        operation: &'static str,
        /// Stall window that elapsed.
        seconds: u64,
    },

    /// The device refused to queue another job right now. Retryable.
    #[error("device busy: {detail}")]
    Busy {
        /// Device-side detail.
        detail: String,
    },

    /// Install was asked for a version whose image is not on the device.
    #[error("version {version} not present on device")]
    VersionMissing {
        /// The missing version.
        version: String,
    },

    /// A device job ran and reported failure.
    #[error("{operation} failed on device: {detail}")]
    JobFailed {
        /// What the job was doing.
        operation: &'static str,
        /// Device-side result message.
        detail: String,
    },

    /// The device answered with something we could not interpret.
    #[error("unparseable device response: {detail}")]
    Parse {
        /// Parse detail.
        detail: String,
    },

    /// The caller's cancellation token fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl ApiError {
    /// Whether retrying the same call can reasonably succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::Timeout { .. } | Self::Busy { .. }
        )
    }
}

/// Shorthand result for capability calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// Progress observer for `wait_*` operations. Called with 0-100 whenever the
/// device reports a new figure, so the workflow can surface sub-phase
/// progress to the status file.
pub type ProgressFn<'a> = &'a mut (dyn FnMut(u8) + Send);

/// Everything the upgrade workflow needs from a device.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Identity and running version.
    async fn system_info(&self) -> ApiResult<SystemInfo>;

    /// Live HA role.
    async fn ha_state(&self) -> ApiResult<HaRole>;

    /// Health metrics for validation.
    async fn metrics(&self) -> ApiResult<DeviceMetrics>;

    /// Asks the device to refresh its software catalog from the vendor.
    async fn software_check(&self) -> ApiResult<()>;

    /// Downloaded/available version lists.
    async fn software_info(&self) -> ApiResult<SoftwareInfo>;

    /// Free space on the upgrade partition, GB.
    async fn disk_available(&self) -> ApiResult<f64>;

    /// Starts downloading an image. Returns the device-side job handle.
    async fn download(&self, version: &str) -> ApiResult<DeviceJob>;

    /// Polls a download job to completion.
    async fn wait_download(
        &self,
        job: &DeviceJob,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> ApiResult<()>;

    /// Starts installing a version. Returns the device-side job handle.
    async fn install(&self, version: &str) -> ApiResult<DeviceJob>;

    /// Polls an install job to completion.
    async fn wait_install(
        &self,
        job: &DeviceJob,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> ApiResult<()>;

    /// Requests a reboot. The connection is expected to drop.
    async fn reboot(&self) -> ApiResult<()>;

    /// Waits for the device to answer health probes again after a reboot,
    /// backing off up to the implementation's configured cap.
    async fn wait_online(&self, max_wait: Duration, cancel: &CancellationToken) -> ApiResult<()>;
}

/// Opens a device session for a workflow. The session is scoped to the
/// workflow: created at entry, dropped on every exit path.
pub trait DeviceConnector: Send + Sync {
    /// Builds a capability handle for `device`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when a client cannot be constructed (bad
    /// address, TLS setup failure).
    fn connect(&self, device: &Device) -> ApiResult<Arc<dyn DeviceApi>>;
}

/// Exponential backoff with jitter for poll loops.
///
/// `attempt` is 0-based; the delay doubles each attempt from `base` up to
/// `cap`, then ±20% jitter is applied so a fleet of workflows does not
/// synchronize its polling.
#[must_use]
pub fn jittered_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(cap);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    capped.mul_f64(jitter)
}

/// Sleeps for `duration` unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`ApiError::Cancelled`] when the token fires.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> ApiResult<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(ApiError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}
