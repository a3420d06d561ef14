//! Out-of-band operator commands.
//!
//! Commands are single-shot JSON files dropped into `commands/incoming/`.
//! The daemon consumes each file exactly once and moves it to
//! `commands/processed/`, annotated with what it did. File naming is opaque
//! to the daemon; the CLI writes `cancel-{uuid}.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTarget {
    /// Every workflow belonging to a job id.
    Job,
    /// A single device's workflow.
    Device,
}

/// The cancel command. The only command verb the daemon understands today;
/// unknown verbs are acknowledged as no-ops so stray files cannot wedge the
/// intake loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Command verb; `cancel_upgrade` is the only recognized value.
    pub command: String,
    /// Whether `job_id` or `device_serial` selects the target.
    pub target: CommandTarget,
    /// Target job, meaningful when `target` is [`CommandTarget::Job`].
    #[serde(default)]
    pub job_id: String,
    /// Target serial, meaningful when `target` is [`CommandTarget::Device`].
    #[serde(default)]
    pub device_serial: String,
    /// Operator-supplied reason, recorded in the processed file.
    #[serde(default)]
    pub reason: String,
    /// Client-side creation time.
    pub timestamp: DateTime<Utc>,
}

/// Verb string for cancellation.
pub const CANCEL_UPGRADE: &str = "cancel_upgrade";

impl Command {
    /// Builds a job-scoped cancellation.
    #[must_use]
    pub fn cancel_job(job_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: CANCEL_UPGRADE.to_string(),
            target: CommandTarget::Job,
            job_id: job_id.into(),
            device_serial: String::new(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Builds a device-scoped cancellation.
    #[must_use]
    pub fn cancel_device(serial: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: CANCEL_UPGRADE.to_string(),
            target: CommandTarget::Device,
            job_id: String::new(),
            device_serial: serial.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Whether this is a recognized cancellation.
    #[must_use]
    pub fn is_cancel(&self) -> bool {
        self.command == CANCEL_UPGRADE
    }
}

/// Sidecar the daemon writes next to a processed command, recording the
/// disposition for operators auditing `commands/processed/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDisposition {
    /// What the daemon did: `cancelled`, `no_op`, or `invalid`.
    pub outcome: String,
    /// Human-readable detail.
    pub detail: String,
    /// When the daemon processed the file.
    pub processed_at: DateTime<Utc>,
}
