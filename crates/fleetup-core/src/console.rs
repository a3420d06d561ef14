//! Management-console client, used only by discovery.
//!
//! The console knows every appliance it manages; `fleetup device discover`
//! asks it for the fleet and writes `devices/inventory.json`. Console calls
//! go through the shared token bucket because discovery fans a whole fleet's
//! worth of queries into a single endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::{ConsoleConfig, DiscoveryConfig};
use crate::device_api::http::{check_response_status, collect_entries, first_text};
use crate::device_api::{ApiError, ApiResult};
use crate::inventory::{Device, DeviceType, HaRole, InventoryDocument};
use crate::ratelimit::RateLimiter;

/// One authenticated console session.
pub struct ConsoleClient {
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    retry_attempts: u32,
}

impl ConsoleClient {
    /// Builds a session from the console and discovery configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Auth`] when no API key is configured, or
    /// [`ApiError::Unreachable`] when the HTTP client cannot be built.
    pub fn new(console: &ConsoleConfig, discovery: &DiscoveryConfig) -> ApiResult<Self> {
        if console.host.is_empty() {
            return Err(ApiError::Unreachable {
                detail: "console.host is not configured".to_string(),
            });
        }
        if console.api_key.is_empty() {
            return Err(ApiError::Auth {
                detail: "console.api_key is not configured".to_string(),
            });
        }
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(console.timeout_secs))
            .build()
            .map_err(|e| ApiError::Unreachable {
                detail: format!("http client construction failed: {e}"),
            })?;
        Ok(Self {
            endpoint: format!("https://{}/api/", console.host),
            api_key: console.api_key.clone(),
            http,
            limiter: Arc::new(RateLimiter::new(console.requests_per_minute)),
            retry_attempts: discovery.retry_attempts.max(1),
        })
    }

    /// Queries the console for every connected device and assembles an
    /// inventory document.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the console stays unreachable past the
    /// retry budget or answers with something unparseable.
    pub async fn discover(&self) -> ApiResult<InventoryDocument> {
        let body = self
            .op_with_retry("<show><devices><all></all></devices></show>")
            .await?;

        let now = Utc::now();
        let mut doc = InventoryDocument {
            last_updated: now.to_rfc3339(),
            ..InventoryDocument::default()
        };

        for entry in collect_entries(&body) {
            let Some(serial) = entry.get("serial").filter(|s| !s.is_empty()) else {
                continue;
            };
            let ha_state = match entry.get("state").map(|s| s.to_ascii_lowercase()) {
                Some(state) if state.contains("active") => HaRole::Active,
                Some(state) if state.contains("passive") => HaRole::Passive,
                Some(_) => HaRole::Unknown,
                None => HaRole::Standalone,
            };
            let device_type = match ha_state {
                HaRole::Active | HaRole::Passive | HaRole::Unknown => DeviceType::HaPair,
                HaRole::Standalone => DeviceType::Standalone,
            };
            let device = Device {
                serial: serial.clone(),
                hostname: entry.get("hostname").cloned().unwrap_or_default(),
                mgmt_ip: entry.get("ip-address").cloned().unwrap_or_default(),
                model: entry.get("model").cloned().unwrap_or_default(),
                current_version: entry.get("sw-version").cloned().unwrap_or_default(),
                device_type,
                peer_serial: entry.get("peer").cloned().unwrap_or_default(),
                ha_state,
                discovered_at: now.to_rfc3339(),
            };
            if device.mgmt_ip.is_empty() {
                warn!(%serial, "discovered device without management IP");
            }
            doc.devices.insert(serial.clone(), device);
        }
        doc.device_count = doc.devices.len();
        info!(devices = doc.device_count, "discovery complete");
        Ok(doc)
    }

    async fn op_with_retry(&self, cmd: &str) -> ApiResult<String> {
        let mut delay = Duration::from_secs(2);
        let mut last_err = None;

        for attempt in 1..=self.retry_attempts {
            self.limiter.acquire().await;
            match self.op(cmd).await {
                Ok(body) => return Ok(body),
                Err(err @ (ApiError::Auth { .. } | ApiError::Parse { .. })) => return Err(err),
                Err(err) => {
                    warn!(attempt, attempts = self.retry_attempts, %err, "console query failed");
                    last_err = Some(err);
                    if attempt < self.retry_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(ApiError::Unreachable {
            detail: "console query produced no result".to_string(),
        }))
    }

    async fn op(&self, cmd: &str) -> ApiResult<String> {
        let body = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("type", "op"),
                ("cmd", cmd),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ApiError::Unreachable {
                detail: e.to_string(),
            })?
            .text()
            .await
            .map_err(|e| ApiError::Unreachable {
                detail: e.to_string(),
            })?;
        check_response_status(&body)?;
        Ok(body)
    }
}

/// Parses a `<show><devices><all>` reply into an inventory document without
/// a live console, for tests.
#[must_use]
pub fn parse_device_listing(body: &str) -> Vec<(String, String, String)> {
    collect_entries(body)
        .into_iter()
        .filter_map(|e| {
            Some((
                e.get("serial")?.clone(),
                e.get("hostname").cloned().unwrap_or_default(),
                e.get("ip-address").cloned().unwrap_or_default(),
            ))
        })
        .collect()
}
