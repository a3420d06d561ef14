//! Command intake: `commands/incoming/` to the cancellation registry.
//!
//! Each scan consumes every command file exactly once: parse, act, then
//! move the file to `commands/processed/` with a disposition sidecar
//! recording what happened. Commands for jobs or devices that are not
//! active right now are acknowledged as no-ops rather than errors, since
//! the web application retries liberally.

use std::path::Path;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetup_core::command::{Command, CommandDisposition, CommandTarget};
use fleetup_core::fsio;
use fleetup_core::workdir::WorkDir;

use crate::state::DaemonState;

/// The command scanner.
pub struct CommandIntake {
    workdir: WorkDir,
    state: std::sync::Arc<DaemonState>,
}

impl CommandIntake {
    /// Builds the scanner.
    #[must_use]
    pub fn new(workdir: WorkDir, state: std::sync::Arc<DaemonState>) -> Self {
        Self { workdir, state }
    }

    /// One pass over `commands/incoming/`, oldest first. Returns how many
    /// files were consumed.
    pub fn scan_once(&self) -> usize {
        let incoming = match fsio::list_json_files(&self.workdir.commands_incoming()) {
            Ok(files) => files,
            Err(err) => {
                warn!(%err, "cannot enumerate command queue");
                return 0;
            }
        };

        let mut consumed = 0;
        for path in incoming {
            let disposition = self.dispatch(&path);
            self.archive(&path, disposition);
            consumed += 1;
        }
        consumed
    }

    /// Scan loop; returns when `shutdown` fires.
    pub async fn run(&self, scan_interval: std::time::Duration, shutdown: CancellationToken) {
        info!("command intake started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(scan_interval) => {
                    let _ = self.scan_once();
                }
            }
        }
        info!("command intake stopped");
    }

    fn dispatch(&self, path: &Path) -> CommandDisposition {
        let command = match fsio::read_json::<Command>(path) {
            Ok(Some(command)) => command,
            Ok(None) => {
                return disposition("invalid", "command file vanished before processing");
            }
            Err(err) => {
                return disposition("invalid", &format!("unparseable command: {err}"));
            }
        };

        if !command.is_cancel() {
            return disposition("no_op", &format!("unknown command verb: {}", command.command));
        }

        match command.target {
            CommandTarget::Job => {
                if command.job_id.is_empty() {
                    return disposition("invalid", "cancel_upgrade with target=job needs job_id");
                }
                if self.state.cancel_job(&command.job_id) {
                    info!(job_id = %command.job_id, reason = %command.reason, "job cancellation signalled");
                    disposition("cancelled", &format!("job {} signalled", command.job_id))
                } else {
                    disposition(
                        "no_op",
                        &format!("job {} is not active", command.job_id),
                    )
                }
            }
            CommandTarget::Device => {
                if command.device_serial.is_empty() {
                    return disposition(
                        "invalid",
                        "cancel_upgrade with target=device needs device_serial",
                    );
                }
                if self.state.cancel_device(&command.device_serial) {
                    info!(
                        serial = %command.device_serial,
                        reason = %command.reason,
                        "device cancellation signalled"
                    );
                    disposition(
                        "cancelled",
                        &format!("device {} signalled", command.device_serial),
                    )
                } else {
                    disposition(
                        "no_op",
                        &format!("device {} has no active workflow", command.device_serial),
                    )
                }
            }
        }
    }

    fn archive(&self, path: &Path, record: CommandDisposition) {
        match fsio::move_into(path, &self.workdir.commands_processed()) {
            Ok(dest) => {
                let sidecar = dest.with_extension("disposition.json");
                if let Err(err) = fsio::atomic_write_json(&sidecar, &record) {
                    warn!(%err, "could not write command disposition");
                }
            }
            Err(err) => {
                warn!(file = %path.display(), %err, "could not archive command file");
            }
        }
    }
}

fn disposition(outcome: &str, detail: &str) -> CommandDisposition {
    CommandDisposition {
        outcome: outcome.to_string(),
        detail: detail.to_string(),
        processed_at: Utc::now(),
    }
}
