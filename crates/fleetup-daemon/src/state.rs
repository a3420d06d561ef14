//! Shared daemon state: the cancellation registry.
//!
//! The registry maps in-flight jobs and their device serials to one
//! cancellation token per job. Command intake reads it to deliver operator
//! cancellations; job intake writes it at submit time so a cancel can never
//! race ahead of the workflow it targets. Everything else the daemon
//! reports (queue counts, worker occupancy) is derived from the work
//! directory or the pool, not duplicated here.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Registry of in-flight workflows.
#[derive(Debug)]
pub struct DaemonState {
    started_at: DateTime<Utc>,
    /// Parent of every per-job token; cancelling it cancels all workflows,
    /// which is exactly what graceful shutdown wants.
    all_workflows: CancellationToken,
    registry: Mutex<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    by_job: HashMap<String, JobEntry>,
    by_serial: HashMap<String, String>,
}

#[derive(Debug)]
struct JobEntry {
    token: CancellationToken,
    serials: Vec<String>,
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonState {
    /// Fresh state stamped with the daemon's start time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            all_workflows: CancellationToken::new(),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// When this daemon instance started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Registers a job and its serials, returning the workflow token. The
    /// token is a child of the shutdown token, so daemon shutdown cancels
    /// every registered workflow.
    pub fn register(&self, job_id: &str, serials: &[String]) -> CancellationToken {
        let token = self.all_workflows.child_token();
        let mut registry = self.registry.lock().expect("registry lock");
        registry.by_job.insert(
            job_id.to_string(),
            JobEntry {
                token: token.clone(),
                serials: serials.to_vec(),
            },
        );
        for serial in serials {
            registry.by_serial.insert(serial.clone(), job_id.to_string());
        }
        token
    }

    /// Drops a finished job from the registry.
    pub fn unregister(&self, job_id: &str) {
        let mut registry = self.registry.lock().expect("registry lock");
        if let Some(entry) = registry.by_job.remove(job_id) {
            for serial in entry.serials {
                registry.by_serial.remove(&serial);
            }
        }
    }

    /// Cancels every workflow of `job_id`. Returns whether anything was
    /// signalled.
    #[must_use]
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let registry = self.registry.lock().expect("registry lock");
        match registry.by_job.get(job_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels the workflow that owns `serial`. Returns whether anything
    /// was signalled.
    #[must_use]
    pub fn cancel_device(&self, serial: &str) -> bool {
        let registry = self.registry.lock().expect("registry lock");
        registry
            .by_serial
            .get(serial)
            .and_then(|job_id| registry.by_job.get(job_id))
            .map(|entry| entry.token.cancel())
            .is_some()
    }

    /// Whether `job_id` is registered right now.
    #[must_use]
    pub fn is_registered(&self, job_id: &str) -> bool {
        self.registry
            .lock()
            .expect("registry lock")
            .by_job
            .contains_key(job_id)
    }

    /// Whether the job's token has been cancelled. Used when filing a
    /// finished job to tell an operator cancellation from a failure.
    #[must_use]
    pub fn was_cancelled(&self, job_id: &str) -> bool {
        self.registry
            .lock()
            .expect("registry lock")
            .by_job
            .get(job_id)
            .is_some_and(|entry| entry.token.is_cancelled())
    }

    /// Signals cancellation to every in-flight workflow (graceful
    /// shutdown).
    pub fn cancel_all(&self) {
        self.all_workflows.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_and_device_cancellation_share_one_token() {
        let state = DaemonState::new();
        let token = state.register("j1", &["A".to_string(), "B".to_string()]);

        assert!(!token.is_cancelled());
        assert!(state.cancel_device("B"));
        assert!(token.is_cancelled(), "device cancel stops the whole workflow");
        assert!(state.was_cancelled("j1"));
    }

    #[test]
    fn cancel_misses_are_reported_as_no_ops() {
        let state = DaemonState::new();
        assert!(!state.cancel_job("ghost"));
        assert!(!state.cancel_device("ghost"));
    }

    #[test]
    fn unregister_clears_both_indexes() {
        let state = DaemonState::new();
        let _ = state.register("j1", &["A".to_string()]);
        assert!(state.is_registered("j1"));

        state.unregister("j1");
        assert!(!state.is_registered("j1"));
        assert!(!state.cancel_device("A"));
    }

    #[test]
    fn shutdown_cancels_every_registered_workflow() {
        let state = DaemonState::new();
        let t1 = state.register("j1", &["A".to_string()]);
        let t2 = state.register("j2", &["B".to_string()]);

        state.cancel_all();
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }
}
