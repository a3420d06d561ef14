//! Bounded worker pool.
//!
//! A fixed set of workers drains one bounded queue of job work items.
//! Submission never blocks: a full queue is reported back to job intake,
//! which simply leaves the descriptor in `queue/pending/` for the next
//! scan. A failure (or panic) inside one work item never takes down a
//! worker or the pool.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fleetup_core::job::Job;
use fleetup_core::status::{WorkerState, WorkerStatus};

/// One queued unit of work: a job plus the cancellation token registered
/// for it at admission time.
#[derive(Debug)]
pub struct WorkItem {
    /// The admitted job.
    pub job: Job,
    /// Token command intake uses to cancel this workflow.
    pub cancel: CancellationToken,
}

/// Executes one job to its terminal state. Implementations must not panic
/// for expected failures; a panic is contained but counts as an abnormal
/// worker event.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    /// Drives `job` to completion and files its descriptor.
    async fn run(&self, job: Job, cancel: CancellationToken);

    /// Called when a work item panicked, so the descriptor does not stay in
    /// `queue/active/` forever.
    async fn quarantine_crashed(&self, job: Job, detail: String);
}

/// Submission failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The bounded queue is full; retry on a later scan.
    #[error("worker queue is full")]
    Full,
    /// The pool has begun shutting down.
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// The pool handle.
pub struct WorkerPool {
    tx: mpsc::Sender<WorkItem>,
    workers: Vec<tokio::task::JoinHandle<()>>,
    statuses: Arc<Mutex<Vec<WorkerStatus>>>,
}

impl WorkerPool {
    /// Starts `count` workers over a queue of `queue_size` entries.
    #[must_use]
    pub fn start<R: JobRunner>(count: usize, queue_size: usize, runner: Arc<R>) -> Self {
        let (tx, rx) = mpsc::channel::<WorkItem>(queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let now = Utc::now();
        let statuses = Arc::new(Mutex::new(
            (0..count)
                .map(|worker_id| WorkerStatus {
                    worker_id,
                    status: WorkerState::Idle,
                    current_job_id: String::new(),
                    current_device: String::new(),
                    last_updated: now,
                })
                .collect::<Vec<_>>(),
        ));

        let workers = (0..count)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let runner = Arc::clone(&runner);
                let statuses = Arc::clone(&statuses);
                tokio::spawn(async move {
                    worker_loop(worker_id, rx, runner, statuses).await;
                })
            })
            .collect();

        info!(workers = count, queue = queue_size, "worker pool started");
        Self {
            tx,
            workers,
            statuses,
        }
    }

    /// Non-blocking submit.
    ///
    /// # Errors
    ///
    /// [`SubmitError::Full`] when the queue is at capacity,
    /// [`SubmitError::ShuttingDown`] once the pool has been shut down.
    pub fn submit(&self, item: WorkItem) -> Result<(), SubmitError> {
        self.tx.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::ShuttingDown,
        })
    }

    /// Snapshot of every worker's occupancy.
    #[must_use]
    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.statuses.lock().expect("worker status lock").clone()
    }

    /// Graceful shutdown: stop accepting work, let in-flight items observe
    /// their (already cancelled) tokens, and join workers within `grace`.
    /// Items that do not finish in time are abandoned; their device status
    /// files keep whatever was last written.
    pub async fn shutdown(self, grace: Duration) {
        drop(self.tx);
        let join_all = async {
            for handle in self.workers {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, join_all).await.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                "workers did not finish within the shutdown grace; abandoning"
            );
        } else {
            info!("worker pool drained");
        }
    }
}

async fn worker_loop<R: JobRunner>(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    runner: Arc<R>,
    statuses: Arc<Mutex<Vec<WorkerStatus>>>,
) {
    loop {
        // Hold the receiver lock only for the dequeue; workers otherwise
        // run independently.
        let item = rx.lock().await.recv().await;
        let Some(item) = item else {
            break;
        };

        let job_id = item.job.job_id.clone();
        let first_device = item.job.devices.first().cloned().unwrap_or_default();
        set_status(&statuses, worker_id, WorkerState::Busy, &job_id, &first_device);
        info!(worker_id, job_id = %job_id, device = %first_device, "worker picked up job");

        // An inner task contains panics: the worker survives and the
        // descriptor still reaches a terminal directory.
        let job = item.job.clone();
        let cancel = item.cancel.clone();
        let run = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run(job, cancel).await })
        };
        if let Err(join_err) = run.await {
            error!(worker_id, job_id = %job_id, %join_err, "work item crashed");
            runner
                .quarantine_crashed(item.job, join_err.to_string())
                .await;
        }

        set_status(&statuses, worker_id, WorkerState::Idle, "", "");
    }
    info!(worker_id, "worker stopped");
}

fn set_status(
    statuses: &Mutex<Vec<WorkerStatus>>,
    worker_id: usize,
    state: WorkerState,
    job_id: &str,
    device: &str,
) {
    let mut statuses = statuses.lock().expect("worker status lock");
    if let Some(slot) = statuses.get_mut(worker_id) {
        slot.status = state;
        slot.current_job_id = job_id.to_string();
        slot.current_device = device.to_string();
        slot.last_updated = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fleetup_core::job::JobType;

    use super::*;

    struct CountingRunner {
        ran: AtomicUsize,
        crashed: AtomicUsize,
        delay: Duration,
        panic_on: Option<&'static str>,
    }

    impl CountingRunner {
        fn new(delay: Duration, panic_on: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                ran: AtomicUsize::new(0),
                crashed: AtomicUsize::new(0),
                delay,
                panic_on,
            })
        }
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run(&self, job: Job, _cancel: CancellationToken) {
            if self.panic_on == Some(job.job_id.as_str()) {
                panic!("scripted crash");
            }
            tokio::time::sleep(self.delay).await;
            self.ran.fetch_add(1, Ordering::SeqCst);
        }

        async fn quarantine_crashed(&self, _job: Job, _detail: String) {
            self.crashed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn item(job_id: &str) -> WorkItem {
        WorkItem {
            job: Job::new(job_id, JobType::Standalone, vec!["001".to_string()]),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn items_run_and_the_pool_drains_on_shutdown() {
        let runner = CountingRunner::new(Duration::from_millis(5), None);
        let pool = WorkerPool::start(2, 10, Arc::clone(&runner));

        for i in 0..6 {
            pool.submit(item(&format!("j{i}"))).unwrap();
        }
        pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(runner.ran.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn full_queue_is_reported_not_blocked() {
        // One worker held busy, queue depth 1: the third submit must fail.
        let runner = CountingRunner::new(Duration::from_millis(200), None);
        let pool = WorkerPool::start(1, 1, Arc::clone(&runner));

        pool.submit(item("running")).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.submit(item("queued")).unwrap();
        assert_eq!(pool.submit(item("rejected")), Err(SubmitError::Full));

        pool.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn a_panicking_item_does_not_kill_the_worker() {
        let runner = CountingRunner::new(Duration::from_millis(1), Some("boom"));
        let pool = WorkerPool::start(1, 10, Arc::clone(&runner));

        pool.submit(item("boom")).unwrap();
        pool.submit(item("after")).unwrap();
        pool.shutdown(Duration::from_secs(5)).await;

        assert_eq!(runner.crashed.load(Ordering::SeqCst), 1);
        assert_eq!(runner.ran.load(Ordering::SeqCst), 1, "the worker kept going");
    }

    #[tokio::test]
    async fn busy_workers_publish_their_job() {
        let runner = CountingRunner::new(Duration::from_millis(100), None);
        let pool = WorkerPool::start(1, 10, Arc::clone(&runner));

        pool.submit(item("visible")).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let statuses = pool.worker_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, WorkerState::Busy);
        assert_eq!(statuses[0].current_job_id, "visible");

        pool.shutdown(Duration::from_secs(5)).await;
    }
}
