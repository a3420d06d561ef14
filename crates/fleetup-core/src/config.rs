//! Daemon and CLI configuration.
//!
//! Loaded from `{work_dir}/config/config.json`. A missing file yields the
//! defaults (and the CLI writes them out on first `config set`/`show`), so a
//! fresh work directory is usable without any manual editing. Duration-like
//! fields are plain seconds in the document.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fsio::{self, FsError};

/// Hard ceiling on the worker pool size, whatever the document says.
pub const MAX_WORKERS: usize = 50;

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Management-console (discovery) settings.
    pub console: ConsoleConfig,
    /// Direct device-API settings.
    pub device: DeviceConfig,
    /// Worker pool sizing.
    pub workers: WorkersConfig,
    /// Validation margins and disk requirements.
    pub validation: ValidationConfig,
    /// Discovery behavior.
    pub discovery: DiscoveryConfig,
    /// Daemon loop cadence.
    pub daemon: DaemonConfig,
}

/// Management-console connection settings, used only by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Console host name or address.
    pub host: String,
    /// API key for the console. Empty means discovery is unconfigured.
    pub api_key: String,
    /// Token-bucket rate for console calls, requests per minute.
    pub requests_per_minute: u32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            api_key: String::new(),
            requests_per_minute: 10,
            timeout_secs: 300,
        }
    }
}

/// Direct device-API credentials and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// API username on the appliances.
    pub username: String,
    /// API password on the appliances.
    pub password: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Timeout for the software-catalog refresh command, seconds.
    pub software_check_timeout_secs: u64,
    /// Timeout for the software-inventory query, seconds.
    pub software_info_timeout_secs: u64,
    /// A download/install job reporting no progress change for this many
    /// seconds is declared stalled.
    pub job_stall_timeout_secs: u64,
    /// Attempts per image download before the phase fails.
    pub download_retry_attempts: u32,
    /// Backoff cap while polling a rebooting device, seconds.
    pub max_reboot_poll_interval_secs: u64,
    /// Total budget for a device to come back after reboot, seconds.
    pub reboot_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            timeout_secs: 300,
            software_check_timeout_secs: 300,
            software_info_timeout_secs: 120,
            job_stall_timeout_secs: 600,
            download_retry_attempts: 3,
            max_reboot_poll_interval_secs: 60,
            reboot_timeout_secs: 900,
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Concurrent workflow executors. Clamped to `1..=`[`MAX_WORKERS`].
    pub count: usize,
    /// Bounded submit queue depth. A full queue pushes jobs back to pending.
    pub queue_size: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 5,
            queue_size: 1000,
        }
    }
}

/// Validation margins. A comparison outside a margin is reported, never
/// fatal; the disk requirement is the one hard gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Allowed TCP-session drift, percent.
    pub tcp_session_margin: f64,
    /// Allowed route-table churn, absolute entries added or removed.
    pub route_margin: u64,
    /// Allowed ARP-table churn, absolute entries added or removed.
    pub arp_margin: u64,
    /// Minimum free disk before each image download, GB.
    pub min_disk_gb: f64,
    /// Metric-collection attempts before pre/post-flight gives up.
    pub retry_attempts: u32,
    /// Initial delay between metric-collection retries, seconds. Doubles per
    /// attempt.
    pub retry_delay_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            tcp_session_margin: 5.0,
            route_margin: 0,
            arp_margin: 0,
            min_disk_gb: 5.0,
            retry_attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

/// Discovery behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Attempts per console query during discovery.
    pub retry_attempts: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { retry_attempts: 3 }
    }
}

/// Daemon loop cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Interval between daemon/worker status snapshots, seconds.
    pub status_interval_secs: u64,
    /// Interval between pending-queue and command scans, milliseconds.
    pub scan_interval_ms: u64,
    /// Grace period for in-flight workflows at shutdown, seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: 5,
            scan_interval_ms: 500,
            shutdown_grace_secs: 30,
        }
    }
}

impl Config {
    /// Loads the configuration from `path`, or the defaults when the file
    /// does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] when the file exists but is malformed.
    pub fn load(path: &Path) -> Result<Self, FsError> {
        Ok(fsio::read_json(path)?.unwrap_or_default())
    }

    /// Writes the configuration atomically to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] on write failure.
    pub fn save(&self, path: &Path) -> Result<(), FsError> {
        fsio::atomic_write_json(path, self)
    }

    /// Worker count clamped to the supported range.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.count.clamp(1, MAX_WORKERS)
    }

    /// Per-request device timeout.
    #[must_use]
    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device.timeout_secs)
    }

    /// Stall window for download/install job polling.
    #[must_use]
    pub fn job_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.device.job_stall_timeout_secs)
    }

    /// Backoff cap while polling a rebooting device.
    #[must_use]
    pub fn max_reboot_poll_interval(&self) -> Duration {
        Duration::from_secs(self.device.max_reboot_poll_interval_secs)
    }

    /// Total reboot wait budget.
    #[must_use]
    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.device.reboot_timeout_secs)
    }

    /// Status snapshot cadence.
    #[must_use]
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.status_interval_secs)
    }

    /// Queue and command scan cadence.
    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.daemon.scan_interval_ms)
    }

    /// Shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.daemon.shutdown_grace_secs)
    }

    /// Sets a dotted-key value (`workers.count`, `validation.min_disk_gb`,
    /// ...) the way `fleetup config set` exposes it, preserving every other
    /// field.
    ///
    /// The value string is interpreted as JSON when it parses as such
    /// (numbers, booleans), and as a bare string otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigKeyError`] for unknown keys or type mismatches.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<(), ConfigKeyError> {
        let mut doc = serde_json::to_value(&*self).map_err(|_| ConfigKeyError::Internal)?;

        let mut cursor = &mut doc;
        let parts: Vec<&str> = key.split('.').collect();
        let (last, parents) = parts.split_last().ok_or_else(|| ConfigKeyError::Unknown {
            key: key.to_string(),
        })?;
        for part in parents {
            cursor = cursor
                .get_mut(*part)
                .ok_or_else(|| ConfigKeyError::Unknown {
                    key: key.to_string(),
                })?;
        }
        let slot = cursor
            .get_mut(*last)
            .ok_or_else(|| ConfigKeyError::Unknown {
                key: key.to_string(),
            })?;

        let parsed = serde_json::from_str::<serde_json::Value>(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        *slot = parsed;

        *self = serde_json::from_value(doc).map_err(|source| ConfigKeyError::BadValue {
            key: key.to_string(),
            value: value.to_string(),
            detail: source.to_string(),
        })?;
        Ok(())
    }
}

/// Errors from dotted-key configuration edits.
#[derive(Debug, thiserror::Error)]
pub enum ConfigKeyError {
    /// No such key in the document.
    #[error("unknown configuration key: {key}")]
    Unknown {
        /// The key requested.
        key: String,
    },

    /// The value does not fit the field's type.
    #[error("invalid value `{value}` for {key}: {detail}")]
    BadValue {
        /// The key requested.
        key: String,
        /// The raw value supplied.
        value: String,
        /// Deserializer detail.
        detail: String,
    },

    /// Internal serialization failure.
    #[error("configuration could not be re-serialized")]
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.workers.count, 5);
        assert!((config.validation.min_disk_gb - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.daemon.status_interval_secs, 5);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.workers.count = 12;
        config.device.username = "svc-upgrade".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.workers.count, 12);
        assert_eq!(loaded.device.username, "svc-upgrade");
    }

    #[test]
    fn partial_documents_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"workers":{"count":2}}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.workers.count, 2);
        assert_eq!(config.workers.queue_size, 1000);
        assert_eq!(config.device.download_retry_attempts, 3);
    }

    #[test]
    fn worker_count_is_clamped() {
        let mut config = Config::default();
        config.workers.count = 0;
        assert_eq!(config.worker_count(), 1);
        config.workers.count = 500;
        assert_eq!(config.worker_count(), MAX_WORKERS);
    }

    #[test]
    fn set_key_updates_numbers_and_strings() {
        let mut config = Config::default();
        config.set_key("workers.count", "9").unwrap();
        assert_eq!(config.workers.count, 9);

        config.set_key("validation.min_disk_gb", "7.5").unwrap();
        assert!((config.validation.min_disk_gb - 7.5).abs() < f64::EPSILON);

        config.set_key("console.host", "panorama.example.net").unwrap();
        assert_eq!(config.console.host, "panorama.example.net");
    }

    #[test]
    fn set_key_rejects_unknown_keys_and_bad_types() {
        let mut config = Config::default();
        assert!(matches!(
            config.set_key("workers.happiness", "11"),
            Err(ConfigKeyError::Unknown { .. })
        ));
        assert!(matches!(
            config.set_key("workers.count", "\"many\""),
            Err(ConfigKeyError::BadValue { .. })
        ));
    }
}
