//! Pre- and post-flight validation.
//!
//! Before touching a device the workflow samples its health (TCP sessions,
//! routing table, ARP table, free disk) and persists the sample under
//! `validation/pre_flight/`. After the upgrade the sample is taken again and
//! compared against the baseline within configured margins; the comparison
//! report lands under `validation/post_flight/`. A failed margin is reported
//! for operator review, never fatal. The one hard gate is free disk space,
//! checked before every image download.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ValidationConfig;
use crate::device_api::{ApiError, ArpEntry, DeviceApi, DeviceMetrics, RouteEntry};
use crate::fsio::{self, FsError};
use crate::status::DiskSpaceInfo;
use crate::workdir::WorkDir;

/// Canonicalized health sample.
///
/// Routes sort by destination/gateway/interface and ARP entries by ip/mac,
/// so two samples of identical state serialize identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    /// Active TCP sessions.
    pub tcp_sessions: u64,
    /// Routing-table size.
    pub route_count: usize,
    /// Canonicalized routing table.
    pub routes: Vec<RouteEntry>,
    /// ARP-table size.
    pub arp_count: usize,
    /// Canonicalized ARP table.
    pub arp_entries: Vec<ArpEntry>,
    /// Free space on the upgrade partition, GB.
    pub disk_available_gb: f64,
}

impl From<DeviceMetrics> for ValidationMetrics {
    fn from(mut raw: DeviceMetrics) -> Self {
        raw.routes.sort();
        raw.arp_entries.sort();
        Self {
            tcp_sessions: raw.tcp_sessions,
            route_count: raw.routes.len(),
            routes: raw.routes,
            arp_count: raw.arp_entries.len(),
            arp_entries: raw.arp_entries,
            disk_available_gb: raw.disk_available_gb,
        }
    }
}

/// Pre-flight artifact shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreFlightArtifact {
    /// Device serial.
    pub serial: String,
    /// Sample time (RFC 3339).
    pub timestamp: String,
    /// The sample.
    pub metrics: ValidationMetrics,
}

/// TCP-session drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionComparison {
    /// `post - pre`.
    pub difference: i64,
    /// Percent change against `max(pre, 1)`.
    pub percentage: f64,
    /// Whether `|percentage|` is inside the margin.
    pub within_margin: bool,
}

/// Set-difference comparison for routes or ARP entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableComparison<T> {
    /// `post count - pre count`.
    pub count_difference: i64,
    /// Entries present after but not before.
    pub added: Vec<T>,
    /// Entries present before but not after.
    pub removed: Vec<T>,
    /// Whether both churn figures are inside the margin.
    pub validation_passed: bool,
}

/// Full comparison block of the post-flight artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Session drift.
    pub tcp_sessions: SessionComparison,
    /// Routing-table churn.
    pub routes: TableComparison<RouteEntry>,
    /// ARP-table churn.
    pub arp_entries: TableComparison<ArpEntry>,
}

/// Post-flight artifact shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Device serial.
    pub serial: String,
    /// Comparison time (RFC 3339).
    pub timestamp: String,
    /// Baseline sample.
    pub pre_flight: ValidationMetrics,
    /// Fresh sample.
    pub post_flight: ValidationMetrics,
    /// Margin evaluation.
    pub comparison: Comparison,
    /// Conjunction of every `within_margin`/`validation_passed` figure.
    pub validation_passed: bool,
}

/// Collects, compares, and persists validation artifacts.
#[derive(Debug, Clone)]
pub struct Validator {
    workdir: WorkDir,
    config: ValidationConfig,
}

impl Validator {
    /// Validator writing under the given work directory.
    #[must_use]
    pub fn new(workdir: WorkDir, config: ValidationConfig) -> Self {
        Self { workdir, config }
    }

    /// Samples the device and persists the baseline artifact.
    ///
    /// Collection retries transient failures per the configured budget with
    /// doubling delays.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when collection keeps failing. Artifact write
    /// failures are logged and do not fail the sample.
    pub async fn pre_flight(
        &self,
        serial: &str,
        api: &dyn DeviceApi,
    ) -> Result<ValidationMetrics, ApiError> {
        let metrics = self.collect(serial, api).await?;
        let artifact = PreFlightArtifact {
            serial: serial.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            metrics: metrics.clone(),
        };
        let path = self
            .workdir
            .validation_pre_flight_dir()
            .join(artifact_name(serial));
        if let Err(err) = fsio::atomic_write_json(&path, &artifact) {
            warn!(%serial, %err, "failed to persist pre-flight artifact");
        }
        info!(
            serial,
            tcp_sessions = metrics.tcp_sessions,
            routes = metrics.route_count,
            arp_entries = metrics.arp_count,
            disk_gb = metrics.disk_available_gb,
            "pre-flight baseline captured"
        );
        Ok(metrics)
    }

    /// Samples the device again, compares against `pre`, and persists the
    /// report. The report is returned whether or not margins held.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when collection keeps failing.
    pub async fn post_flight(
        &self,
        serial: &str,
        api: &dyn DeviceApi,
        pre: &ValidationMetrics,
    ) -> Result<ValidationReport, ApiError> {
        let post = self.collect(serial, api).await?;
        let (comparison, validation_passed) = self.compare(pre, &post);

        let report = ValidationReport {
            serial: serial.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            pre_flight: pre.clone(),
            post_flight: post,
            comparison,
            validation_passed,
        };
        let path = self
            .workdir
            .validation_post_flight_dir()
            .join(artifact_name(serial));
        if let Err(err) = fsio::atomic_write_json(&path, &report) {
            warn!(%serial, %err, "failed to persist post-flight artifact");
        }

        if validation_passed {
            info!(%serial, "post-flight validation within margins");
        } else {
            warn!(
                serial,
                tcp_within = report.comparison.tcp_sessions.within_margin,
                routes_ok = report.comparison.routes.validation_passed,
                arp_ok = report.comparison.arp_entries.validation_passed,
                "post-flight validation outside margins; continuing for operator review"
            );
        }
        Ok(report)
    }

    /// Compares two samples against the configured margins. Returns the
    /// comparison block and the top-level conjunction.
    #[must_use]
    pub fn compare(
        &self,
        pre: &ValidationMetrics,
        post: &ValidationMetrics,
    ) -> (Comparison, bool) {
        let difference = post.tcp_sessions as i64 - pre.tcp_sessions as i64;
        let percentage = difference as f64 / pre.tcp_sessions.max(1) as f64 * 100.0;
        let tcp = SessionComparison {
            difference,
            percentage,
            within_margin: percentage.abs() <= self.config.tcp_session_margin,
        };

        let routes = table_comparison(&pre.routes, &post.routes, self.config.route_margin);
        let arp = table_comparison(&pre.arp_entries, &post.arp_entries, self.config.arp_margin);

        let passed = tcp.within_margin && routes.validation_passed && arp.validation_passed;
        (
            Comparison {
                tcp_sessions: tcp,
                routes,
                arp_entries: arp,
            },
            passed,
        )
    }

    /// Reads free disk space and evaluates it against `min_disk_gb`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the device cannot report disk space.
    pub async fn disk_precheck(&self, api: &dyn DeviceApi) -> Result<DiskSpaceInfo, ApiError> {
        let available_gb = api.disk_available().await?;
        Ok(DiskSpaceInfo {
            available_gb,
            required_gb: self.config.min_disk_gb,
            check_passed: available_gb >= self.config.min_disk_gb,
        })
    }

    /// The most recent pre-flight baseline for `serial`, if any. Used when a
    /// resumed workflow reaches post-flight without having re-collected.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] if the artifact directory cannot be read.
    pub fn latest_pre_flight(&self, serial: &str) -> Result<Option<ValidationMetrics>, FsError> {
        let prefix = format!("{serial}_");
        let mut files: Vec<_> = fsio::list_json_files(&self.workdir.validation_pre_flight_dir())?
            .into_iter()
            .filter(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s.starts_with(&prefix))
            })
            .collect();
        // Artifact names embed a sortable UTC timestamp.
        files.sort();
        let Some(latest) = files.last() else {
            return Ok(None);
        };
        Ok(fsio::read_json::<PreFlightArtifact>(latest)?.map(|a| a.metrics))
    }

    async fn collect(
        &self,
        serial: &str,
        api: &dyn DeviceApi,
    ) -> Result<ValidationMetrics, ApiError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut delay = std::time::Duration::from_secs(self.config.retry_delay_secs);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match api.metrics().await {
                Ok(raw) => return Ok(ValidationMetrics::from(raw)),
                Err(ApiError::Cancelled) => return Err(ApiError::Cancelled),
                Err(err) => {
                    warn!(
                        serial,
                        attempt,
                        attempts,
                        %err,
                        "metric collection failed"
                    );
                    last_err = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(ApiError::Parse {
            detail: "metric collection produced no result".to_string(),
        }))
    }
}

fn artifact_name(serial: &str) -> String {
    format!("{serial}_{}.json", Utc::now().format("%Y%m%dT%H%M%SZ"))
}

fn table_comparison<T: Clone + Ord>(pre: &[T], post: &[T], margin: u64) -> TableComparison<T> {
    let added: Vec<T> = post.iter().filter(|e| !pre.contains(e)).cloned().collect();
    let removed: Vec<T> = pre.iter().filter(|e| !post.contains(e)).cloned().collect();
    let validation_passed = added.len() as u64 <= margin && removed.len() as u64 <= margin;
    TableComparison {
        count_difference: post.len() as i64 - pre.len() as i64,
        added,
        removed,
        validation_passed,
    }
}
