//! Dry-run decorator.
//!
//! Wraps any [`DeviceApi`] and turns every mutating call into a cancellable
//! sleep of nominal duration. Reads pass through to the real device, so a
//! dry run exercises the full pipeline: real metrics, real validation
//! artifacts, real status transitions, and zero side effects.
//!
//! The decorator keeps a small simulation of the state its suppressed
//! mutations would have produced: images "downloaded" in the dry run are
//! merged into `software_info()` and a simulated install-plus-reboot
//! advances the version reported by `system_info()`. Without that, the
//! workflow's post-download verification gate and its reach-the-target loop
//! could never converge.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    ApiResult, DeviceApi, DeviceJob, DeviceMetrics, ProgressFn, SoftwareInfo, SystemInfo,
    sleep_or_cancel,
};
use crate::inventory::HaRole;

/// Nominal duration simulated for each suppressed mutation.
const SIMULATED_STEP: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct Simulation {
    downloaded: Vec<String>,
    pending_install: Option<String>,
    landed_version: Option<String>,
}

/// A [`DeviceApi`] whose mutations are simulated.
pub struct DryRunApi {
    inner: Arc<dyn DeviceApi>,
    step: Duration,
    sim: Mutex<Simulation>,
}

impl DryRunApi {
    /// Wraps `inner` with the default simulated step duration.
    #[must_use]
    pub fn new(inner: Arc<dyn DeviceApi>) -> Self {
        Self::with_step(inner, SIMULATED_STEP)
    }

    /// Overrides the simulated step duration, for tests.
    #[must_use]
    pub fn with_step(inner: Arc<dyn DeviceApi>, step: Duration) -> Self {
        Self {
            inner,
            step,
            sim: Mutex::new(Simulation::default()),
        }
    }
}

#[async_trait]
impl DeviceApi for DryRunApi {
    async fn system_info(&self) -> ApiResult<SystemInfo> {
        let mut info = self.inner.system_info().await?;
        if let Some(landed) = &self.sim.lock().expect("dry-run sim lock").landed_version {
            info.sw_version = landed.clone();
        }
        Ok(info)
    }

    async fn ha_state(&self) -> ApiResult<HaRole> {
        self.inner.ha_state().await
    }

    async fn metrics(&self) -> ApiResult<DeviceMetrics> {
        self.inner.metrics().await
    }

    async fn software_check(&self) -> ApiResult<()> {
        // A catalog refresh can take minutes on a loaded device; skip it.
        Ok(())
    }

    async fn software_info(&self) -> ApiResult<SoftwareInfo> {
        let mut info = self.inner.software_info().await?;
        for version in &self.sim.lock().expect("dry-run sim lock").downloaded {
            if !info.downloaded.contains(version) {
                info.downloaded.push(version.clone());
            }
        }
        Ok(info)
    }

    async fn disk_available(&self) -> ApiResult<f64> {
        self.inner.disk_available().await
    }

    async fn download(&self, version: &str) -> ApiResult<DeviceJob> {
        Ok(DeviceJob {
            id: format!("dry-run-download-{version}"),
        })
    }

    async fn wait_download(
        &self,
        job: &DeviceJob,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> ApiResult<()> {
        for pct in [50u8, 100] {
            sleep_or_cancel(self.step / 2, cancel).await?;
            progress(pct);
        }
        if let Some(version) = job.id.strip_prefix("dry-run-download-") {
            let mut sim = self.sim.lock().expect("dry-run sim lock");
            if !sim.downloaded.iter().any(|v| v == version) {
                sim.downloaded.push(version.to_string());
            }
        }
        Ok(())
    }

    async fn install(&self, version: &str) -> ApiResult<DeviceJob> {
        Ok(DeviceJob {
            id: format!("dry-run-install-{version}"),
        })
    }

    async fn wait_install(
        &self,
        job: &DeviceJob,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> ApiResult<()> {
        for pct in [50u8, 100] {
            sleep_or_cancel(self.step / 2, cancel).await?;
            progress(pct);
        }
        if let Some(version) = job.id.strip_prefix("dry-run-install-") {
            self.sim.lock().expect("dry-run sim lock").pending_install = Some(version.to_string());
        }
        Ok(())
    }

    async fn reboot(&self) -> ApiResult<()> {
        let mut sim = self.sim.lock().expect("dry-run sim lock");
        if let Some(pending) = sim.pending_install.take() {
            sim.landed_version = Some(pending);
        }
        Ok(())
    }

    async fn wait_online(&self, _max_wait: Duration, cancel: &CancellationToken) -> ApiResult<()> {
        sleep_or_cancel(self.step, cancel).await
    }
}
