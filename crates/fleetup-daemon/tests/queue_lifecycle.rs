//! Queue lifecycle tests: pending through terminal, driven by the real
//! intake, pool, runner, and command components against mock devices.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleetup_core::command::Command;
use fleetup_core::config::Config;
use fleetup_core::device_api::DeviceConnector;
use fleetup_core::device_api::mock::{MockConnector, MockDevice};
use fleetup_core::engine::UpgradeEngine;
use fleetup_core::fsio;
use fleetup_core::inventory::{Device, DeviceType, HaRole, Inventory, InventoryDocument};
use fleetup_core::job::{Job, JobResult, JobType};
use fleetup_core::status::{StatusStore, UpgradeStatus};
use fleetup_core::upgrade_paths::UpgradePathTable;
use fleetup_core::validate::Validator;
use fleetup_core::workdir::{QueueState, WorkDir};

use fleetup_daemon::commands::CommandIntake;
use fleetup_daemon::intake::JobIntake;
use fleetup_daemon::pool::WorkerPool;
use fleetup_daemon::runner::UpgradeRunner;
use fleetup_daemon::state::DaemonState;
use fleetup_daemon::status_writer::StatusWriter;

struct Daemon {
    _tmp: tempfile::TempDir,
    workdir: WorkDir,
    intake: JobIntake,
    commands: CommandIntake,
    status_writer: StatusWriter,
    state: Arc<DaemonState>,
    pool: Arc<WorkerPool>,
}

fn inventory_entry(serial: &str) -> Device {
    Device {
        serial: serial.to_string(),
        hostname: format!("fw-{serial}"),
        mgmt_ip: format!("10.1.1.{}", serial.len()),
        model: "NGFW-3200".to_string(),
        current_version: "10.5.1".to_string(),
        device_type: DeviceType::Standalone,
        peer_serial: String::new(),
        ha_state: HaRole::Standalone,
        discovered_at: "2025-11-02T09:00:00Z".to_string(),
    }
}

/// Builds the full daemon component set over a scratch work directory, with
/// the given serials in inventory and `10.5.1 -> 11.1.0` as the only path.
fn daemon(serials: &[&str], connector: MockConnector, workers: usize, queue: usize) -> Daemon {
    let tmp = tempfile::tempdir().unwrap();
    let workdir = WorkDir::new(tmp.path());
    workdir.ensure_layout().unwrap();

    let doc = InventoryDocument {
        devices: serials
            .iter()
            .map(|s| ((*s).to_string(), inventory_entry(s)))
            .collect(),
        device_count: serials.len(),
        last_updated: "2025-11-02T09:00:00Z".to_string(),
    };
    fsio::atomic_write_json(&workdir.inventory_file(), &doc).unwrap();

    let mut table = std::collections::BTreeMap::new();
    table.insert("10.5.1".to_string(), vec!["11.1.0".to_string()]);
    fsio::atomic_write_json(&workdir.upgrade_paths_file(), &table).unwrap();

    let config = Arc::new(Config::default());
    let paths = Arc::new(UpgradePathTable::load(&workdir.upgrade_paths_file()).unwrap());
    let state = Arc::new(DaemonState::new());
    let engine = Arc::new(UpgradeEngine::new(
        StatusStore::new(workdir.clone()),
        Validator::new(workdir.clone(), config.validation.clone()),
        paths,
        Arc::clone(&config),
    ));
    let connector: Arc<dyn DeviceConnector> = Arc::new(connector);
    let runner = Arc::new(UpgradeRunner::new(
        workdir.clone(),
        Inventory::load(&workdir.inventory_file()).unwrap(),
        engine,
        connector,
        Arc::clone(&state),
    ));
    let pool = Arc::new(WorkerPool::start(workers, queue, runner));
    let intake = JobIntake::new(
        workdir.clone(),
        Inventory::load(&workdir.inventory_file()).unwrap(),
        Arc::clone(&pool),
        Arc::clone(&state),
    );
    let commands = CommandIntake::new(workdir.clone(), Arc::clone(&state));
    let status_writer = StatusWriter::new(
        workdir.clone(),
        config,
        Arc::clone(&pool),
        Arc::clone(&state),
    );

    Daemon {
        _tmp: tmp,
        workdir,
        intake,
        commands,
        status_writer,
        state,
        pool,
    }
}

fn submit_pending(workdir: &WorkDir, job: &Job) {
    fsio::atomic_write_json(&workdir.queue(QueueState::Pending).join(job.file_name()), job)
        .unwrap();
}

fn queue_names(workdir: &WorkDir, state: QueueState) -> Vec<String> {
    fsio::list_json_files(&workdir.queue(state))
        .unwrap()
        .into_iter()
        .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
        .collect()
}

/// Polls until `queue/{state}` contains `name` or the deadline passes.
async fn wait_for_queue(workdir: &WorkDir, state: QueueState, name: &str) {
    for _ in 0..200 {
        if queue_names(workdir, state).iter().any(|n| n == name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{name} never reached queue/{state}; pending={:?} active={:?} failed={:?}",
        queue_names(workdir, QueueState::Pending),
        queue_names(workdir, QueueState::Active),
        queue_names(workdir, QueueState::Failed),
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_job_runs_to_completed_with_result_stamped() {
    let connector = MockConnector::new();
    let dev = MockDevice::builder("001", "10.5.1").build();
    connector.register("001", dev.clone());
    let d = daemon(&["001"], connector, 2, 10);

    let job = Job::new("cli-1", JobType::Standalone, vec!["001".to_string()]);
    submit_pending(&d.workdir, &job);

    assert_eq!(d.intake.scan_once(), 1);
    assert!(queue_names(&d.workdir, QueueState::Pending).is_empty());

    wait_for_queue(&d.workdir, QueueState::Completed, "cli-1.json").await;

    let filed: Job = fsio::read_json(
        &d.workdir.queue(QueueState::Completed).join("cli-1.json"),
    )
    .unwrap()
    .unwrap();
    assert_eq!(filed.result, Some(JobResult::Completed));
    assert!(filed.completed_at.is_some());

    let st = StatusStore::new(d.workdir.clone()).load("001").unwrap().unwrap();
    assert_eq!(st.upgrade_status, UpgradeStatus::Complete);
    assert_eq!(dev.current_version(), "11.1.0");
    assert!(!d.state.is_registered("cli-1"), "registry cleaned up");
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_descriptor_is_quarantined_with_sidecar() {
    let d = daemon(&["001"], MockConnector::new(), 1, 10);

    std::fs::write(
        d.workdir.queue(QueueState::Pending).join("broken.json"),
        b"{this is not json",
    )
    .unwrap();

    assert_eq!(d.intake.scan_once(), 0);
    assert_eq!(queue_names(&d.workdir, QueueState::Failed), vec!["broken.json"]);
    assert!(
        d.workdir.queue(QueueState::Failed).join("broken.error").exists(),
        "rejection sidecar missing"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_device_is_rejected_at_admission() {
    let d = daemon(&["001"], MockConnector::new(), 1, 10);

    let job = Job::new("ghost-job", JobType::Standalone, vec!["ghost".to_string()]);
    submit_pending(&d.workdir, &job);

    d.intake.scan_once();
    assert_eq!(
        queue_names(&d.workdir, QueueState::Failed),
        vec!["ghost-job.json"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_and_conflicting_submissions_are_rejected() {
    let connector = MockConnector::new();
    // Slow device keeps the first job active while the others are judged.
    let dev = MockDevice::builder("001", "10.5.1")
        .step_delay(Duration::from_millis(150))
        .build();
    connector.register("001", dev);
    let d = daemon(&["001"], connector, 1, 10);

    submit_pending(
        &d.workdir,
        &Job::new("first", JobType::Standalone, vec!["001".to_string()]),
    );
    assert_eq!(d.intake.scan_once(), 1);

    // Same family: duplicate. Opposite family: conflicting type. Both land
    // in failed/ while the first job is still active.
    submit_pending(
        &d.workdir,
        &Job::new("dup", JobType::Standalone, vec!["001".to_string()]),
    );
    submit_pending(
        &d.workdir,
        &Job::new("conflict", JobType::DownloadOnly, vec!["001".to_string()]),
    );
    d.intake.scan_once();

    let mut failed = queue_names(&d.workdir, QueueState::Failed);
    failed.sort();
    assert_eq!(failed, vec!["conflict.json", "dup.json"]);

    let sidecar =
        std::fs::read_to_string(d.workdir.queue(QueueState::Failed).join("dup.error")).unwrap();
    assert!(sidecar.contains("first"), "sidecar names the blocking job: {sidecar}");

    wait_for_queue(&d.workdir, QueueState::Completed, "first.json").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn full_pool_defers_jobs_to_the_next_scan() {
    let connector = MockConnector::new();
    for serial in ["001", "0002", "00003"] {
        connector.register(
            serial,
            MockDevice::builder(serial, "10.5.1")
                .step_delay(Duration::from_millis(100))
                .build(),
        );
    }
    // One worker, queue depth one: the third job cannot be admitted.
    let d = daemon(&["001", "0002", "00003"], connector, 1, 1);

    for (id, serial) in [("j1", "001"), ("j2", "0002"), ("j3", "00003")] {
        submit_pending(
            &d.workdir,
            &Job::new(id, JobType::Standalone, vec![serial.to_string()]),
        );
        // Spread mtimes so intake order is deterministic.
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    let admitted = d.intake.scan_once();
    assert!(admitted < 3, "queue depth one cannot take all three");
    assert!(
        !queue_names(&d.workdir, QueueState::Pending).is_empty(),
        "deferred job stays pending"
    );

    // Later scans drain the backlog as workers free up.
    for _ in 0..300 {
        d.intake.scan_once();
        if queue_names(&d.workdir, QueueState::Completed).len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(queue_names(&d.workdir, QueueState::Completed).len(), 3);
}

// S7: cancelling an active job through the command plane.
#[tokio::test(flavor = "multi_thread")]
async fn cancel_command_moves_active_job_to_cancelled() {
    let connector = MockConnector::new();
    let dev = MockDevice::builder("001", "10.5.1")
        .step_delay(Duration::from_millis(120))
        .build();
    connector.register("001", dev);
    let d = daemon(&["001"], connector, 1, 10);

    submit_pending(
        &d.workdir,
        &Job::new("cli-7", JobType::Standalone, vec!["001".to_string()]),
    );
    d.intake.scan_once();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Drop the cancel command and process it.
    let command = Command::cancel_job("cli-7", "maintenance window closed");
    fsio::atomic_write_json(
        &d.workdir.commands_incoming().join("cancel-test.json"),
        &command,
    )
    .unwrap();
    assert_eq!(d.commands.scan_once(), 1);

    // Consumed exactly once, with a disposition.
    assert!(fsio::list_json_files(&d.workdir.commands_incoming())
        .unwrap()
        .is_empty());
    assert!(d
        .workdir
        .commands_processed()
        .join("cancel-test.disposition.json")
        .exists());

    wait_for_queue(&d.workdir, QueueState::Cancelled, "cli-7.json").await;

    let st = StatusStore::new(d.workdir.clone()).load("001").unwrap().unwrap();
    assert_eq!(st.upgrade_status, UpgradeStatus::Cancelled);
    assert!(!st.current_phase.is_empty(), "phase records where it stopped");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_for_inactive_target_is_a_recorded_no_op() {
    let d = daemon(&["001"], MockConnector::new(), 1, 10);

    let command = Command::cancel_device("001", "");
    fsio::atomic_write_json(&d.workdir.commands_incoming().join("cancel-x.json"), &command)
        .unwrap();
    d.commands.scan_once();

    let record: serde_json::Value = fsio::read_json(
        &d.workdir
            .commands_processed()
            .join("cancel-x.disposition.json"),
    )
    .unwrap()
    .unwrap();
    assert_eq!(record["outcome"], "no_op");
}

// Property 8: a descriptor stranded in active/ by a crash is resubmitted
// and the device resumes from its status record.
#[tokio::test(flavor = "multi_thread")]
async fn recovery_resubmits_active_jobs() {
    let connector = MockConnector::new();
    let dev = MockDevice::builder("001", "10.5.1").build();
    connector.register("001", dev.clone());
    let d = daemon(&["001"], connector, 1, 10);

    // Simulate the crashed daemon: descriptor already in active/, plus an
    // orphaned temp file from a torn write.
    let job = Job::new("crashed", JobType::Standalone, vec!["001".to_string()]);
    fsio::atomic_write_json(
        &d.workdir.queue(QueueState::Active).join(job.file_name()),
        &job,
    )
    .unwrap();
    std::fs::write(
        d.workdir.queue(QueueState::Pending).join(".x.json.17.tmp"),
        b"torn",
    )
    .unwrap();

    d.intake.recover().await;

    wait_for_queue(&d.workdir, QueueState::Completed, "crashed.json").await;
    assert_eq!(dev.current_version(), "11.1.0");
    assert!(!d
        .workdir
        .queue(QueueState::Pending)
        .join(".x.json.17.tmp")
        .exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn status_writer_reports_queue_counts_and_workers() {
    let connector = MockConnector::new();
    let d = daemon(&["001"], connector, 3, 10);

    submit_pending(
        &d.workdir,
        &Job::new("waiting", JobType::Standalone, vec!["001".to_string()]),
    );
    d.status_writer.write_once(true);

    let daemon_status: serde_json::Value =
        fsio::read_json(&d.workdir.daemon_status_file()).unwrap().unwrap();
    assert_eq!(daemon_status["running"], true);
    assert_eq!(daemon_status["pending_jobs"], 1);
    assert_eq!(daemon_status["active_jobs"], 0);

    let workers: serde_json::Value =
        fsio::read_json(&d.workdir.workers_status_file()).unwrap().unwrap();
    assert_eq!(workers["workers"].as_array().unwrap().len(), 3);

    d.status_writer.write_once(false);
    let final_status: serde_json::Value =
        fsio::read_json(&d.workdir.daemon_status_file()).unwrap().unwrap();
    assert_eq!(final_status["running"], false);

    // Keep the pool alive until the end of the test.
    let _ = &d.pool;
}
