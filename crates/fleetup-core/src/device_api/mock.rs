//! Scripted in-memory device for tests.
//!
//! [`MockDevice`] plays the role of one appliance: it tracks which images
//! are present, advances its running version through install-and-reboot
//! cycles, can rotate through a sequence of HA roles to simulate failover,
//! and records every call so tests can assert exactly which mutations a
//! workflow performed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    ApiError, ApiResult, DeviceApi, DeviceConnector, DeviceJob, DeviceMetrics, ProgressFn,
    SoftwareInfo, SystemInfo, sleep_or_cancel,
};
use crate::inventory::{Device, HaRole};

/// Operations a test can inject failures into or assert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `system_info()`.
    SystemInfo,
    /// `ha_state()`.
    HaState,
    /// `metrics()`.
    Metrics,
    /// `software_check()`.
    SoftwareCheck,
    /// `software_info()`.
    SoftwareInfo,
    /// `disk_available()`.
    DiskAvailable,
    /// `download(version)`.
    Download(String),
    /// `wait_download(job)`.
    WaitDownload(String),
    /// `install(version)`.
    Install(String),
    /// `wait_install(job)`.
    WaitInstall(String),
    /// `reboot()`.
    Reboot,
    /// `wait_online()`.
    WaitOnline,
}

#[derive(Debug)]
struct MockState {
    info: SystemInfo,
    ha_roles: VecDeque<HaRole>,
    last_ha_role: HaRole,
    metrics: DeviceMetrics,
    downloaded: Vec<String>,
    available: Vec<String>,
    disk_gb: f64,
    /// Version the device ends on after each install+reboot cycle; when
    /// empty, the installed version lands as-is (a chaining installer).
    install_outcomes: VecDeque<String>,
    pending_install: Option<String>,
    job_seq: u64,
    jobs: HashMap<String, String>,
    step_delay: Duration,
    /// Downloads report success without the image ever appearing in the
    /// software inventory, for exercising the post-download verification.
    phantom_downloads: bool,
    calls: Vec<MockCall>,
    fail_next: HashMap<&'static str, VecDeque<ApiError>>,
}

/// One scripted appliance.
#[derive(Debug)]
pub struct MockDevice {
    state: Mutex<MockState>,
}

impl MockDevice {
    /// Starts a builder with a serial and running version.
    #[must_use]
    pub fn builder(serial: &str, version: &str) -> MockDeviceBuilder {
        MockDeviceBuilder {
            info: SystemInfo {
                hostname: format!("fw-{serial}"),
                serial: serial.to_string(),
                model: "NGFW-3200".to_string(),
                sw_version: version.to_string(),
            },
            ha_roles: VecDeque::new(),
            last_ha_role: HaRole::Standalone,
            metrics: DeviceMetrics {
                tcp_sessions: 1000,
                routes: Vec::new(),
                arp_entries: Vec::new(),
                disk_available_gb: 40.0,
            },
            downloaded: Vec::new(),
            available: Vec::new(),
            disk_gb: 40.0,
            install_outcomes: VecDeque::new(),
            step_delay: Duration::from_millis(1),
            phantom_downloads: false,
        }
    }

    /// Queues an error for the next occurrence of `op` (`"download"`,
    /// `"wait_download"`, `"system_info"`, ...).
    pub fn fail_next(&self, op: &'static str, err: ApiError) {
        self.state
            .lock()
            .expect("mock state lock")
            .fail_next
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Everything the workflow called, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().expect("mock state lock").calls.clone()
    }

    /// Versions passed to `download()`.
    #[must_use]
    pub fn download_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Download(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    /// Versions passed to `install()`.
    #[must_use]
    pub fn install_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Install(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    /// How many times `reboot()` was called.
    #[must_use]
    pub fn reboot_count(&self) -> usize {
        self.calls()
            .into_iter()
            .filter(|c| *c == MockCall::Reboot)
            .count()
    }

    /// The version the device is running now.
    #[must_use]
    pub fn current_version(&self) -> String {
        self.state
            .lock()
            .expect("mock state lock")
            .info
            .sw_version
            .clone()
    }

    /// Changes the reported free disk space mid-test.
    pub fn set_disk_gb(&self, gb: f64) {
        let mut state = self.state.lock().expect("mock state lock");
        state.disk_gb = gb;
        state.metrics.disk_available_gb = gb;
    }

    fn record(&self, call: MockCall) {
        self.state.lock().expect("mock state lock").calls.push(call);
    }

    fn take_failure(&self, op: &'static str) -> Option<ApiError> {
        self.state
            .lock()
            .expect("mock state lock")
            .fail_next
            .get_mut(op)
            .and_then(VecDeque::pop_front)
    }

    fn check(&self, op: &'static str) -> ApiResult<()> {
        match self.take_failure(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn step_delay(&self) -> Duration {
        self.state.lock().expect("mock state lock").step_delay
    }
}

/// Builder for [`MockDevice`].
#[derive(Debug)]
pub struct MockDeviceBuilder {
    info: SystemInfo,
    ha_roles: VecDeque<HaRole>,
    last_ha_role: HaRole,
    metrics: DeviceMetrics,
    downloaded: Vec<String>,
    available: Vec<String>,
    disk_gb: f64,
    install_outcomes: VecDeque<String>,
    step_delay: Duration,
    phantom_downloads: bool,
}

impl MockDeviceBuilder {
    /// Sets the host name.
    #[must_use]
    pub fn hostname(mut self, hostname: &str) -> Self {
        self.info.hostname = hostname.to_string();
        self
    }

    /// Scripts successive `ha_state()` answers; the last one repeats.
    #[must_use]
    pub fn ha_roles(mut self, roles: impl IntoIterator<Item = HaRole>) -> Self {
        self.ha_roles = roles.into_iter().collect();
        if let Some(last) = self.ha_roles.back() {
            self.last_ha_role = *last;
        }
        self
    }

    /// Marks images as already present on the device.
    #[must_use]
    pub fn downloaded(mut self, versions: impl IntoIterator<Item = &'static str>) -> Self {
        self.downloaded = versions.into_iter().map(str::to_string).collect();
        self
    }

    /// Sets reported free disk space.
    #[must_use]
    pub fn disk_gb(mut self, gb: f64) -> Self {
        self.disk_gb = gb;
        self.metrics.disk_available_gb = gb;
        self
    }

    /// Sets the metrics sample returned by `metrics()`.
    #[must_use]
    pub fn metrics(mut self, metrics: DeviceMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Scripts where the device lands after each install+reboot cycle, for
    /// simulating installers that do not chain through intermediates.
    #[must_use]
    pub fn install_outcomes(mut self, versions: impl IntoIterator<Item = &'static str>) -> Self {
        self.install_outcomes = versions.into_iter().map(str::to_string).collect();
        self
    }

    /// Slows the simulated wait steps, for cancellation tests.
    #[must_use]
    pub fn step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Makes downloads succeed without the image ever landing, so the
    /// post-download verification gate has something to catch.
    #[must_use]
    pub fn phantom_downloads(mut self) -> Self {
        self.phantom_downloads = true;
        self
    }

    /// Finishes the script.
    #[must_use]
    pub fn build(self) -> Arc<MockDevice> {
        Arc::new(MockDevice {
            state: Mutex::new(MockState {
                info: self.info,
                ha_roles: self.ha_roles,
                last_ha_role: self.last_ha_role,
                metrics: self.metrics,
                downloaded: self.downloaded,
                available: self.available,
                disk_gb: self.disk_gb,
                install_outcomes: self.install_outcomes,
                pending_install: None,
                job_seq: 0,
                jobs: HashMap::new(),
                step_delay: self.step_delay,
                phantom_downloads: self.phantom_downloads,
                calls: Vec::new(),
                fail_next: HashMap::new(),
            }),
        })
    }
}

#[async_trait]
impl DeviceApi for MockDevice {
    async fn system_info(&self) -> ApiResult<SystemInfo> {
        self.record(MockCall::SystemInfo);
        self.check("system_info")?;
        Ok(self.state.lock().expect("mock state lock").info.clone())
    }

    async fn ha_state(&self) -> ApiResult<HaRole> {
        self.record(MockCall::HaState);
        self.check("ha_state")?;
        let mut state = self.state.lock().expect("mock state lock");
        let role = state.ha_roles.pop_front().unwrap_or(state.last_ha_role);
        Ok(role)
    }

    async fn metrics(&self) -> ApiResult<DeviceMetrics> {
        self.record(MockCall::Metrics);
        self.check("metrics")?;
        Ok(self.state.lock().expect("mock state lock").metrics.clone())
    }

    async fn software_check(&self) -> ApiResult<()> {
        self.record(MockCall::SoftwareCheck);
        self.check("software_check")
    }

    async fn software_info(&self) -> ApiResult<SoftwareInfo> {
        self.record(MockCall::SoftwareInfo);
        self.check("software_info")?;
        let state = self.state.lock().expect("mock state lock");
        Ok(SoftwareInfo {
            downloaded: state.downloaded.clone(),
            available: state.available.clone(),
        })
    }

    async fn disk_available(&self) -> ApiResult<f64> {
        self.record(MockCall::DiskAvailable);
        self.check("disk_available")?;
        Ok(self.state.lock().expect("mock state lock").disk_gb)
    }

    async fn download(&self, version: &str) -> ApiResult<DeviceJob> {
        self.record(MockCall::Download(version.to_string()));
        self.check("download")?;
        let mut state = self.state.lock().expect("mock state lock");
        state.job_seq += 1;
        let id = format!("dl-{}", state.job_seq);
        state.jobs.insert(id.clone(), version.to_string());
        Ok(DeviceJob { id })
    }

    async fn wait_download(
        &self,
        job: &DeviceJob,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> ApiResult<()> {
        let version = self
            .state
            .lock()
            .expect("mock state lock")
            .jobs
            .get(&job.id)
            .cloned()
            .unwrap_or_default();
        self.record(MockCall::WaitDownload(version.clone()));
        self.check("wait_download")?;

        let delay = self.step_delay();
        for pct in [25u8, 60, 100] {
            sleep_or_cancel(delay, cancel).await?;
            progress(pct);
        }

        let mut state = self.state.lock().expect("mock state lock");
        if !state.phantom_downloads && !state.downloaded.iter().any(|v| v == &version) {
            state.downloaded.push(version);
        }
        Ok(())
    }

    async fn install(&self, version: &str) -> ApiResult<DeviceJob> {
        self.record(MockCall::Install(version.to_string()));
        self.check("install")?;
        let mut state = self.state.lock().expect("mock state lock");
        if !state.downloaded.iter().any(|v| v == version) {
            return Err(ApiError::VersionMissing {
                version: version.to_string(),
            });
        }
        state.job_seq += 1;
        let id = format!("in-{}", state.job_seq);
        state.jobs.insert(id.clone(), version.to_string());
        Ok(DeviceJob { id })
    }

    async fn wait_install(
        &self,
        job: &DeviceJob,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> ApiResult<()> {
        let version = self
            .state
            .lock()
            .expect("mock state lock")
            .jobs
            .get(&job.id)
            .cloned()
            .unwrap_or_default();
        self.record(MockCall::WaitInstall(version.clone()));
        self.check("wait_install")?;

        let delay = self.step_delay();
        for pct in [50u8, 100] {
            sleep_or_cancel(delay, cancel).await?;
            progress(pct);
        }

        self.state.lock().expect("mock state lock").pending_install = Some(version);
        Ok(())
    }

    async fn reboot(&self) -> ApiResult<()> {
        self.record(MockCall::Reboot);
        self.check("reboot")?;
        let mut state = self.state.lock().expect("mock state lock");
        if let Some(installed) = state.pending_install.take() {
            let landed = state.install_outcomes.pop_front().unwrap_or(installed);
            state.info.sw_version = landed;
        }
        Ok(())
    }

    async fn wait_online(&self, _max_wait: Duration, cancel: &CancellationToken) -> ApiResult<()> {
        self.record(MockCall::WaitOnline);
        self.check("wait_online")?;
        sleep_or_cancel(self.step_delay(), cancel).await
    }
}

/// Connector handing out pre-registered mocks by serial.
#[derive(Debug, Default)]
pub struct MockConnector {
    devices: Mutex<HashMap<String, Arc<MockDevice>>>,
}

impl MockConnector {
    /// Empty connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mock for a serial.
    pub fn register(&self, serial: &str, device: Arc<MockDevice>) {
        self.devices
            .lock()
            .expect("mock connector lock")
            .insert(serial.to_string(), device);
    }
}

impl DeviceConnector for MockConnector {
    fn connect(&self, device: &Device) -> ApiResult<Arc<dyn DeviceApi>> {
        self.devices
            .lock()
            .expect("mock connector lock")
            .get(&device.serial)
            .cloned()
            .map(|d| d as Arc<dyn DeviceApi>)
            .ok_or_else(|| ApiError::Unreachable {
                detail: format!("no mock registered for {}", device.serial),
            })
    }
}
