//! CLI integration: drives the `fleetup` binary against a scratch work
//! directory and checks the control-plane files it writes.

use std::path::Path;
use std::process::{Command, Output};

use fleetup_core::fsio;
use fleetup_core::inventory::{Device, DeviceType, HaRole, InventoryDocument};
use fleetup_core::job::Job;
use fleetup_core::workdir::{QueueState, WorkDir};

fn fleetup(work_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fleetup"))
        .arg("--work-dir")
        .arg(work_dir)
        .args(args)
        .env_remove("FLEETUP_HOME")
        .output()
        .expect("could not run fleetup binary")
}

fn seed_workdir(root: &Path) -> WorkDir {
    let wd = WorkDir::new(root);
    wd.ensure_layout().unwrap();

    let device = Device {
        serial: "001234567890".to_string(),
        hostname: "fw-edge-01".to_string(),
        mgmt_ip: "10.1.1.1".to_string(),
        model: "NGFW-3200".to_string(),
        current_version: "10.5.1".to_string(),
        device_type: DeviceType::Standalone,
        peer_serial: String::new(),
        ha_state: HaRole::Standalone,
        discovered_at: "2025-11-02T09:00:00Z".to_string(),
    };
    let doc = InventoryDocument {
        devices: [(device.serial.clone(), device)].into_iter().collect(),
        device_count: 1,
        last_updated: "2025-11-02T09:00:00Z".to_string(),
    };
    fsio::atomic_write_json(&wd.inventory_file(), &doc).unwrap();

    let mut table = std::collections::BTreeMap::new();
    table.insert("10.5.1".to_string(), vec!["11.1.0".to_string()]);
    fsio::atomic_write_json(&wd.upgrade_paths_file(), &table).unwrap();
    wd
}

#[test]
fn submit_writes_a_pending_descriptor() {
    let tmp = tempfile::tempdir().unwrap();
    let wd = seed_workdir(tmp.path());

    let out = fleetup(tmp.path(), &["job", "submit", "--device", "001234567890"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let pending = fsio::list_json_files(&wd.queue(QueueState::Pending)).unwrap();
    assert_eq!(pending.len(), 1);
    let job: Job = fsio::read_json(&pending[0]).unwrap().unwrap();
    assert_eq!(job.devices, vec!["001234567890"]);
    assert!(!job.dry_run);
}

#[test]
fn duplicate_submission_is_refused_with_exit_code_two() {
    let tmp = tempfile::tempdir().unwrap();
    let _wd = seed_workdir(tmp.path());

    let first = fleetup(tmp.path(), &["job", "submit", "--device", "001234567890"]);
    assert!(first.status.success());

    let second = fleetup(tmp.path(), &["job", "submit", "--device", "001234567890"]);
    assert_eq!(second.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&second.stderr);
    assert!(stderr.contains("already has a pending job"), "stderr: {stderr}");

    // Opposite family is refused too, with the conflict spelled out.
    let conflict = fleetup(
        tmp.path(),
        &["job", "submit", "--device", "001234567890", "--download-only"],
    );
    assert_eq!(conflict.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&conflict.stderr);
    assert!(stderr.contains("cannot run concurrently"), "stderr: {stderr}");
}

#[test]
fn cancel_drops_a_command_file() {
    let tmp = tempfile::tempdir().unwrap();
    let wd = seed_workdir(tmp.path());

    let out = fleetup(tmp.path(), &["job", "cancel", "cli-42", "--reason", "window closed"]);
    assert!(out.status.success());

    let commands = fsio::list_json_files(&wd.commands_incoming()).unwrap();
    assert_eq!(commands.len(), 1);
    let content = std::fs::read_to_string(&commands[0]).unwrap();
    assert!(content.contains("cancel_upgrade"));
    assert!(content.contains("cli-42"));
    assert!(content.contains("window closed"));
}

#[test]
fn job_list_and_status_read_the_queues() {
    let tmp = tempfile::tempdir().unwrap();
    let _wd = seed_workdir(tmp.path());

    fleetup(tmp.path(), &["job", "submit", "--device", "001234567890", "--dry-run"]);

    let list = fleetup(tmp.path(), &["job", "list"]);
    let stdout = String::from_utf8_lossy(&list.stdout);
    assert!(stdout.contains("pending:"), "stdout: {stdout}");
    assert!(stdout.contains("001234567890"));

    // Take the id off the listing and ask for its status.
    let job_id = stdout
        .lines()
        .find_map(|l| {
            l.split_whitespace()
                .next()
                .filter(|id| id.starts_with("cli-"))
        })
        .expect("job id in listing")
        .to_string();

    let status = fleetup(tmp.path(), &["job", "status", &job_id]);
    let stdout = String::from_utf8_lossy(&status.stdout);
    assert!(status.status.success());
    assert!(stdout.contains("pending"), "stdout: {stdout}");
    assert!(stdout.contains("no workflow status yet"));
}

#[test]
fn path_show_and_validate_read_the_table() {
    let tmp = tempfile::tempdir().unwrap();
    let _wd = seed_workdir(tmp.path());

    let show = fleetup(tmp.path(), &["path", "show"]);
    let stdout = String::from_utf8_lossy(&show.stdout);
    assert!(stdout.contains("10.5.1 -> 11.1.0"), "stdout: {stdout}");

    let validate = fleetup(tmp.path(), &["path", "validate"]);
    assert!(validate.status.success());

    let miss = fleetup(tmp.path(), &["path", "show", "--version", "9.1.0"]);
    let stdout = String::from_utf8_lossy(&miss.stdout);
    assert!(stdout.contains("no upgrade path"));
}

#[test]
fn unknown_device_submission_is_a_validation_error() {
    let tmp = tempfile::tempdir().unwrap();
    let _wd = seed_workdir(tmp.path());

    let out = fleetup(tmp.path(), &["job", "submit", "--device", "ghost"]);
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("not found in inventory"), "stderr: {stderr}");
}
