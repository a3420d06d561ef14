//! Production device client: XML-over-HTTPS against the appliance
//! management port.
//!
//! Appliances expose an operational-command endpoint at `/api/`; every call
//! is a command document in the `cmd` query parameter and every reply is a
//! `<response status="...">` envelope. Authentication is an API key obtained
//! once per session via `type=keygen` with the configured username and
//! password.
//!
//! Appliance management certificates are self-signed in virtually every
//! deployment, so certificate verification is disabled for the management
//! session.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    ApiError, ApiResult, ArpEntry, DeviceApi, DeviceConnector, DeviceJob, DeviceMetrics,
    ProgressFn, RouteEntry, SoftwareInfo, SystemInfo, jittered_backoff, sleep_or_cancel,
};
use crate::config::DeviceConfig;
use crate::inventory::{Device, HaRole};

/// Initial delay between job polls.
const JOB_POLL_BASE: Duration = Duration::from_secs(2);

/// Backoff cap for job polls.
const JOB_POLL_CAP: Duration = Duration::from_secs(30);

/// Initial delay between reboot probes.
const ONLINE_POLL_BASE: Duration = Duration::from_secs(5);

/// Settle time after a rebooted device first answers, before declaring it
/// online. Management planes accept connections well before they finish
/// loading configuration.
const ONLINE_SETTLE: Duration = Duration::from_secs(10);

/// Connector building [`HttpDeviceApi`] sessions from inventory entries.
pub struct HttpConnector {
    config: DeviceConfig,
}

impl HttpConnector {
    /// Connector using the configured device credentials and timeouts.
    #[must_use]
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }
}

impl DeviceConnector for HttpConnector {
    fn connect(&self, device: &Device) -> ApiResult<std::sync::Arc<dyn DeviceApi>> {
        let api = HttpDeviceApi::new(&device.mgmt_ip, self.config.clone())?;
        Ok(std::sync::Arc::new(api))
    }
}

/// One authenticated management session against one appliance.
pub struct HttpDeviceApi {
    endpoint: String,
    config: DeviceConfig,
    http: reqwest::Client,
    api_key: Mutex<Option<String>>,
}

impl HttpDeviceApi {
    /// Builds a session for the device at `mgmt_ip`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Unreachable`] when the HTTP client cannot be
    /// constructed.
    pub fn new(mgmt_ip: &str, config: DeviceConfig) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ApiError::Unreachable {
                detail: format!("http client construction failed: {e}"),
            })?;
        Ok(Self {
            endpoint: format!("https://{mgmt_ip}/api/"),
            config,
            http,
            api_key: Mutex::new(None),
        })
    }

    async fn ensure_key(&self) -> ApiResult<String> {
        let mut key = self.api_key.lock().await;
        if let Some(key) = key.as_ref() {
            return Ok(key.clone());
        }
        let body = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("type", "keygen"),
                ("user", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?
            .text()
            .await
            .map_err(transport_error)?;

        check_response_status(&body)?;
        let fresh = first_text(&body, "key").ok_or_else(|| ApiError::Parse {
            detail: "keygen response carried no <key>".to_string(),
        })?;
        *key = Some(fresh.clone());
        Ok(fresh)
    }

    /// Runs one operational command and returns the raw response body.
    async fn op(&self, cmd: &str) -> ApiResult<String> {
        let key = self.ensure_key().await?;
        let body = self
            .http
            .get(&self.endpoint)
            .query(&[("type", "op"), ("cmd", cmd), ("key", key.as_str())])
            .send()
            .await
            .map_err(transport_error)?
            .text()
            .await
            .map_err(transport_error)?;
        check_response_status(&body)?;
        Ok(body)
    }

    async fn op_with_timeout(&self, cmd: &str, deadline: Duration) -> ApiResult<String> {
        match tokio::time::timeout(deadline, self.op(cmd)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout {
                operation: "operational command",
                seconds: deadline.as_secs(),
            }),
        }
    }

    async fn job_status(&self, job_id: &str) -> ApiResult<JobStatus> {
        let cmd = format!("<show><jobs><id>{job_id}</id></jobs></show>");
        let body = self.op(&cmd).await?;
        parse_job_status(&body)
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceApi {
    async fn system_info(&self) -> ApiResult<SystemInfo> {
        let body = self.op("<show><system><info></info></system></show>").await?;
        parse_system_info(&body)
    }

    async fn ha_state(&self) -> ApiResult<HaRole> {
        let body = self
            .op("<show><high-availability><state></state></high-availability></show>")
            .await?;
        Ok(parse_ha_state(&body))
    }

    async fn metrics(&self) -> ApiResult<DeviceMetrics> {
        let sessions = self.op("<show><session><info></info></session></show>").await?;
        let routes = self
            .op("<show><routing><route></route></routing></show>")
            .await?;
        let arp = self.op("<show><arp><entry name='all'/></arp></show>").await?;
        let disk_available_gb = self.disk_available().await?;

        let tcp_sessions = first_text(&sessions, "num-active")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(DeviceMetrics {
            tcp_sessions,
            routes: parse_routes(&routes),
            arp_entries: parse_arp_entries(&arp),
            disk_available_gb,
        })
    }

    async fn software_check(&self) -> ApiResult<()> {
        let deadline = Duration::from_secs(self.config.software_check_timeout_secs);
        self.op_with_timeout(
            "<request><system><software><check></check></software></system></request>",
            deadline,
        )
        .await
        .map(|_| ())
    }

    async fn software_info(&self) -> ApiResult<SoftwareInfo> {
        let deadline = Duration::from_secs(self.config.software_info_timeout_secs);
        let body = self
            .op_with_timeout(
                "<request><system><software><info></info></software></system></request>",
                deadline,
            )
            .await?;
        Ok(parse_software_info(&body))
    }

    async fn disk_available(&self) -> ApiResult<f64> {
        let body = self
            .op("<show><system><disk-space></disk-space></system></show>")
            .await?;
        parse_disk_available_gb(&body)
    }

    async fn download(&self, version: &str) -> ApiResult<DeviceJob> {
        let cmd = format!(
            "<request><system><software><download><version>{version}</version></download></software></system></request>"
        );
        let body = self.op(&cmd).await?;
        extract_job(&body)
    }

    async fn wait_download(
        &self,
        job: &DeviceJob,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> ApiResult<()> {
        self.wait_job("download", job, cancel, progress).await
    }

    async fn install(&self, version: &str) -> ApiResult<DeviceJob> {
        let cmd = format!(
            "<request><system><software><install><version>{version}</version></install></software></system></request>"
        );
        match self.op(&cmd).await {
            Ok(body) => extract_job(&body),
            Err(ApiError::JobFailed { detail, .. }) if detail.contains("not downloaded") => {
                Err(ApiError::VersionMissing {
                    version: version.to_string(),
                })
            }
            Err(other) => Err(other),
        }
    }

    async fn wait_install(
        &self,
        job: &DeviceJob,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> ApiResult<()> {
        self.wait_job("install", job, cancel, progress).await
    }

    async fn reboot(&self) -> ApiResult<()> {
        // The management plane drops the connection while the reboot request
        // is in flight; a transport error here is the expected outcome.
        match self
            .op("<request><restart><system></system></restart></request>")
            .await
        {
            Ok(_) | Err(ApiError::Unreachable { .. } | ApiError::Timeout { .. }) => Ok(()),
            Err(other) => Err(other),
        }
    }

    async fn wait_online(&self, max_wait: Duration, cancel: &CancellationToken) -> ApiResult<()> {
        let started = Instant::now();
        let cap = Duration::from_secs(self.config.max_reboot_poll_interval_secs);
        let mut attempt: u32 = 0;

        loop {
            sleep_or_cancel(jittered_backoff(attempt, ONLINE_POLL_BASE, cap), cancel).await?;
            attempt += 1;

            if started.elapsed() > max_wait {
                return Err(ApiError::Timeout {
                    operation: "wait for device online",
                    seconds: max_wait.as_secs(),
                });
            }

            match self.system_info().await {
                Ok(_) => {
                    sleep_or_cancel(ONLINE_SETTLE, cancel).await?;
                    return Ok(());
                }
                // Auth failures right after reboot mean the API is up but
                // not ready; anything else keeps probing until the deadline.
                Err(_) => {}
            }
        }
    }
}

impl HttpDeviceApi {
    async fn wait_job(
        &self,
        operation: &'static str,
        job: &DeviceJob,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> ApiResult<()> {
        let stall_window = Duration::from_secs(self.config.job_stall_timeout_secs);
        let mut attempt: u32 = 0;
        let mut last_progress: Option<u8> = None;
        let mut last_change = Instant::now();

        loop {
            sleep_or_cancel(jittered_backoff(attempt, JOB_POLL_BASE, JOB_POLL_CAP), cancel).await?;
            attempt += 1;

            match self.job_status(&job.id).await {
                Ok(status) => {
                    if last_progress != Some(status.progress) {
                        last_progress = Some(status.progress);
                        last_change = Instant::now();
                        progress(status.progress);
                    }
                    if status.finished {
                        return if status.ok {
                            Ok(())
                        } else {
                            Err(ApiError::JobFailed {
                                operation,
                                detail: status.detail,
                            })
                        };
                    }
                }
                // Transient poll failures do not reset the stall clock; a
                // device that stops answering eventually trips it.
                Err(ApiError::Cancelled) => return Err(ApiError::Cancelled),
                Err(_) => {}
            }

            if last_change.elapsed() >= stall_window {
                return Err(ApiError::Stalled {
                    operation,
                    seconds: stall_window.as_secs(),
                });
            }
        }
    }
}

/// Parsed `<show><jobs>` snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
struct JobStatus {
    finished: bool,
    ok: bool,
    progress: u8,
    detail: String,
}

fn transport_error(e: reqwest::Error) -> ApiError {
    ApiError::Unreachable {
        detail: e.to_string(),
    }
}

// ---------------------------------------------------------------------------
// XML extraction
// ---------------------------------------------------------------------------

/// Text of the first `<tag>` element that directly contains non-empty text.
///
/// Container elements whose immediate content is only whitespace (an
/// envelope `<result>` wrapping children, say) are skipped, so asking for a
/// tag name that appears both as an envelope and as a leaf finds the leaf.
pub(crate) fn first_text(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == tag.as_bytes() => {
                if let Ok(Event::Text(t)) = reader.read_event() {
                    let text = t.unescape().ok()?.trim().to_string();
                    if !text.is_empty() {
                        return Some(text);
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// `status` attribute of the `<response>` envelope. An `error` status with
/// an authentication message maps to [`ApiError::Auth`]; any other error
/// becomes a device-side job failure.
pub(crate) fn check_response_status(xml: &str) -> ApiResult<()> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) if e.name().as_ref() == b"response" => {
                let status = e
                    .attributes()
                    .flatten()
                    .find(|a| a.key.as_ref() == b"status")
                    .and_then(|a| String::from_utf8(a.value.to_vec()).ok())
                    .unwrap_or_default();
                if status == "success" {
                    return Ok(());
                }
                let detail = first_text(xml, "msg")
                    .or_else(|| first_text(xml, "line"))
                    .unwrap_or_else(|| "device returned error status".to_string());
                if detail.to_ascii_lowercase().contains("invalid credential")
                    || detail.to_ascii_lowercase().contains("unauth")
                {
                    return Err(ApiError::Auth { detail });
                }
                return Err(ApiError::JobFailed {
                    operation: "operational command",
                    detail,
                });
            }
            Ok(Event::Eof) | Err(_) => {
                return Err(ApiError::Parse {
                    detail: "no <response> envelope in reply".to_string(),
                });
            }
            _ => {}
        }
    }
}

fn parse_system_info(xml: &str) -> ApiResult<SystemInfo> {
    let sw_version = first_text(xml, "sw-version").ok_or_else(|| ApiError::Parse {
        detail: "system info reply carried no <sw-version>".to_string(),
    })?;
    Ok(SystemInfo {
        hostname: first_text(xml, "hostname").unwrap_or_default(),
        serial: first_text(xml, "serial").unwrap_or_default(),
        model: first_text(xml, "model").unwrap_or_default(),
        sw_version,
    })
}

fn parse_ha_state(xml: &str) -> HaRole {
    if first_text(xml, "enabled").is_some_and(|v| v == "no") {
        return HaRole::Standalone;
    }
    match first_text(xml, "state").map(|s| s.to_ascii_lowercase()) {
        Some(state) if state.contains("active") => HaRole::Active,
        Some(state) if state.contains("passive") => HaRole::Passive,
        Some(_) => HaRole::Unknown,
        None => HaRole::Unknown,
    }
}

/// Parses the `<available>` figure of the disk-space report, normalizing
/// `G`/`M` suffixes to GB.
fn parse_disk_available_gb(xml: &str) -> ApiResult<f64> {
    let text = first_text(xml, "available").ok_or_else(|| ApiError::Parse {
        detail: "disk-space reply carried no <available>".to_string(),
    })?;
    let trimmed = text.trim();
    let parsed = if let Some(gb) = trimmed.strip_suffix('G') {
        gb.trim().parse::<f64>().ok()
    } else if let Some(mb) = trimmed.strip_suffix('M') {
        mb.trim().parse::<f64>().ok().map(|m| m / 1024.0)
    } else {
        // Bare figures are kilobytes, the filesystem report's native unit.
        trimmed.parse::<f64>().ok().map(|k| k / (1024.0 * 1024.0))
    };
    parsed.ok_or_else(|| ApiError::Parse {
        detail: format!("unparseable disk figure: {text:?}"),
    })
}

/// Collects the children of repeated `<entry>` elements as (tag, text)
/// pairs, one map per entry.
pub(crate) fn collect_entries(xml: &str) -> Vec<std::collections::HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    let mut entries = Vec::new();
    let mut current: Option<std::collections::HashMap<String, String>> = None;
    let mut field: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "entry" {
                    current = Some(std::collections::HashMap::new());
                } else if current.is_some() {
                    field = Some(name);
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(map), Some(name)) = (current.as_mut(), field.as_ref()) {
                    if let Ok(text) = t.unescape() {
                        map.insert(name.clone(), text.trim().to_string());
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                if name.as_ref() == b"entry" {
                    if let Some(map) = current.take() {
                        entries.push(map);
                    }
                } else {
                    field = None;
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    entries
}

fn parse_routes(xml: &str) -> Vec<RouteEntry> {
    collect_entries(xml)
        .into_iter()
        .map(|mut e| RouteEntry {
            destination: e.remove("destination").unwrap_or_default(),
            gateway: e.remove("nexthop").unwrap_or_default(),
            interface: e.remove("interface").unwrap_or_default(),
        })
        .collect()
}

fn parse_arp_entries(xml: &str) -> Vec<ArpEntry> {
    collect_entries(xml)
        .into_iter()
        .map(|mut e| ArpEntry {
            ip: e.remove("ip").unwrap_or_default(),
            mac: e.remove("mac").unwrap_or_default(),
        })
        .collect()
}

fn parse_software_info(xml: &str) -> SoftwareInfo {
    let mut info = SoftwareInfo::default();
    for entry in collect_entries(xml) {
        let Some(version) = entry.get("version").filter(|v| !v.is_empty()) else {
            continue;
        };
        info.available.push(version.clone());
        if entry.get("downloaded").is_some_and(|d| d != "no") {
            info.downloaded.push(version.clone());
        }
    }
    info
}

fn extract_job(xml: &str) -> ApiResult<DeviceJob> {
    match first_text(xml, "job") {
        Some(id) if !id.is_empty() => Ok(DeviceJob { id }),
        _ => Err(ApiError::Busy {
            detail: "device accepted the request but returned no job id".to_string(),
        }),
    }
}

fn parse_job_status(xml: &str) -> ApiResult<JobStatus> {
    let status = first_text(xml, "status").ok_or_else(|| ApiError::Parse {
        detail: "job reply carried no <status>".to_string(),
    })?;
    let result = first_text(xml, "result").unwrap_or_default();
    let progress = first_text(xml, "progress")
        .and_then(|p| p.trim_end_matches('%').parse::<f64>().ok())
        .map_or(0, |p| p.clamp(0.0, 100.0) as u8);

    let finished = status.eq_ignore_ascii_case("fin");
    let ok = result.eq_ignore_ascii_case("ok");
    let detail = first_text(xml, "details").unwrap_or(result);
    Ok(JobStatus {
        finished,
        ok,
        progress: if finished && ok { 100 } else { progress },
        detail,
    })
}
