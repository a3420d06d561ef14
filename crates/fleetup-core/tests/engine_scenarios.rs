//! End-to-end workflow scenarios against the scripted mock device.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use fleetup_core::config::Config;
use fleetup_core::device_api::dry_run::DryRunApi;
use fleetup_core::device_api::mock::{MockDevice, MockConnector};
use fleetup_core::device_api::{DeviceApi, DeviceConnector};
use fleetup_core::engine::{EngineError, UpgradeEngine, WorkflowOutcome};
use fleetup_core::fsio;
use fleetup_core::ha::{HaCoordinator, HaError};
use fleetup_core::inventory::{Device, DeviceType, HaRole};
use fleetup_core::status::{DeviceStatus, StatusStore, UpgradeStatus};
use fleetup_core::upgrade_paths::UpgradePathTable;
use fleetup_core::validate::Validator;
use fleetup_core::workdir::WorkDir;

struct Harness {
    _tmp: tempfile::TempDir,
    workdir: WorkDir,
    engine: Arc<UpgradeEngine>,
}

fn harness(table: &[(&str, &[&str])]) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let workdir = WorkDir::new(tmp.path());
    workdir.ensure_layout().unwrap();

    let mut map = BTreeMap::new();
    for (from, path) in table {
        map.insert(
            (*from).to_string(),
            path.iter().map(|s| (*s).to_string()).collect(),
        );
    }
    let paths = Arc::new(UpgradePathTable::from_map(map));
    let config = Arc::new(Config::default());
    let engine = Arc::new(UpgradeEngine::new(
        StatusStore::new(workdir.clone()),
        Validator::new(workdir.clone(), config.validation.clone()),
        paths,
        config,
    ));
    Harness {
        _tmp: tmp,
        workdir,
        engine,
    }
}

fn device(serial: &str) -> Device {
    Device {
        serial: serial.to_string(),
        hostname: format!("fw-{serial}"),
        mgmt_ip: "10.1.1.1".to_string(),
        model: "NGFW-3200".to_string(),
        current_version: String::new(),
        device_type: DeviceType::Standalone,
        peer_serial: String::new(),
        ha_state: HaRole::Standalone,
        discovered_at: String::new(),
    }
}

fn status_of(h: &Harness, serial: &str) -> DeviceStatus {
    StatusStore::new(h.workdir.clone())
        .load(serial)
        .unwrap()
        .expect("status file must exist")
}

// S1: single-step upgrade.
#[tokio::test]
async fn single_step_upgrade_runs_one_download_one_install_one_reboot() {
    let h = harness(&[("10.5.1", &["11.1.0"])]);
    let dev = MockDevice::builder("001234567890", "10.5.1").build();

    let outcome = h
        .engine
        .run(
            &device("001234567890"),
            HaRole::Standalone,
            dev.clone(),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, WorkflowOutcome::Complete);
    assert_eq!(dev.download_calls(), vec!["11.1.0"]);
    assert_eq!(dev.install_calls(), vec!["11.1.0"]);
    assert_eq!(dev.reboot_count(), 1);

    let st = status_of(&h, "001234567890");
    assert_eq!(st.starting_version, "10.5.1");
    assert_eq!(st.upgrade_path, vec!["11.1.0"]);
    assert_eq!(st.current_version, "11.1.0");
    assert_eq!(st.upgrade_status, UpgradeStatus::Complete);
    assert_eq!(st.progress, 100);

    // Post-flight artifact landed.
    let post = fsio::list_json_files(&h.workdir.validation_post_flight_dir()).unwrap();
    assert_eq!(post.len(), 1);
}

// S2: multi-step path downloads everything, installs only the final version.
#[tokio::test]
async fn multi_step_path_downloads_all_installs_final_only() {
    let h = harness(&[("10.0.2", &["10.1.0", "10.5.1", "11.1.0"])]);
    let dev = MockDevice::builder("001", "10.0.2").build();

    let outcome = h
        .engine
        .run(
            &device("001"),
            HaRole::Standalone,
            dev.clone(),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, WorkflowOutcome::Complete);
    assert_eq!(dev.download_calls(), vec!["10.1.0", "10.5.1", "11.1.0"]);
    assert_eq!(dev.install_calls(), vec!["11.1.0"]);
    assert_eq!(dev.reboot_count(), 1);

    // Disk was checked before each of the three downloads.
    let disk_checks = dev
        .calls()
        .iter()
        .filter(|c| matches!(c, fleetup_core::device_api::mock::MockCall::DiskAvailable))
        .count();
    assert!(disk_checks >= 3, "expected a disk gate per download, saw {disk_checks}");

    let st = status_of(&h, "001");
    assert_eq!(st.current_path_index, 3);
    assert_eq!(st.target_version, "11.1.0");
}

// S3: images already on the device are skipped, not re-downloaded.
#[tokio::test]
async fn present_images_are_skipped() {
    let h = harness(&[("10.0.2", &["10.1.0", "10.5.1", "11.1.0"])]);
    let dev = MockDevice::builder("001", "10.0.2")
        .downloaded(["10.1.0", "10.5.1"])
        .build();

    let outcome = h
        .engine
        .run(
            &device("001"),
            HaRole::Standalone,
            dev.clone(),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, WorkflowOutcome::Complete);
    assert_eq!(dev.download_calls(), vec!["11.1.0"]);

    let st = status_of(&h, "001");
    assert_eq!(st.skipped_versions, vec!["10.1.0", "10.5.1"]);
    assert_eq!(st.downloaded_versions, vec!["11.1.0"]);
}

// S4: unknown source version is skipped with no mutating calls.
#[tokio::test]
async fn unknown_source_version_is_skipped_untouched() {
    let h = harness(&[("10.5.1", &["11.1.0"])]);
    let dev = MockDevice::builder("001", "9.1.0").build();

    let outcome = h
        .engine
        .run(
            &device("001"),
            HaRole::Standalone,
            dev.clone(),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, WorkflowOutcome::Skipped);
    assert!(dev.download_calls().is_empty());
    assert!(dev.install_calls().is_empty());
    assert_eq!(dev.reboot_count(), 0);

    let st = status_of(&h, "001");
    assert_eq!(st.upgrade_status, UpgradeStatus::Skipped);
    assert!(st.skip_reason.contains("9.1.0"));
}

// Property 7: re-submitting a completed device is a fast no-op.
#[tokio::test]
async fn resubmitting_a_completed_device_is_a_fast_no_op() {
    let h = harness(&[("10.5.1", &["11.1.0"])]);
    let dev = MockDevice::builder("001", "10.5.1").build();
    let cancel = CancellationToken::new();

    let first = h
        .engine
        .run(&device("001"), HaRole::Standalone, dev.clone(), false, &cancel)
        .await
        .unwrap();
    assert_eq!(first, WorkflowOutcome::Complete);
    let installs_after_first = dev.install_calls().len();
    let reboots_after_first = dev.reboot_count();

    let second = h
        .engine
        .run(&device("001"), HaRole::Standalone, dev.clone(), false, &cancel)
        .await
        .unwrap();
    assert_eq!(second, WorkflowOutcome::Complete);
    assert_eq!(dev.install_calls().len(), installs_after_first);
    assert_eq!(dev.reboot_count(), reboots_after_first);
}

// S6: daemon crash mid-run resumes against the existing anchor.
#[tokio::test]
async fn resumed_workflow_keeps_anchor_and_does_not_redownload() {
    let h = harness(&[("10.0.2", &["10.1.0", "10.5.1", "11.1.0"])]);
    // The device already walked half the path before the crash.
    let dev = MockDevice::builder("001", "10.5.1")
        .downloaded(["10.1.0", "10.5.1", "11.1.0"])
        .build();

    // Seed the status record a crashed daemon would have left: in flight,
    // anchored, heartbeat well past the stale-writer grace.
    let store = StatusStore::new(h.workdir.clone());
    let mut seeded = DeviceStatus::new("001");
    seeded.starting_version = "10.0.2".to_string();
    seeded.current_version = "10.5.1".to_string();
    seeded.upgrade_path = vec!["10.1.0".into(), "10.5.1".into(), "11.1.0".into()];
    seeded.current_path_index = 2;
    seeded.upgrade_status = UpgradeStatus::Installing;
    store.save(&mut seeded).unwrap();
    age_status_file(&h.workdir, "001", 600);

    let outcome = h
        .engine
        .run(
            &device("001"),
            HaRole::Standalone,
            dev.clone(),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, WorkflowOutcome::Complete);
    assert!(dev.download_calls().is_empty(), "images were already present");
    assert_eq!(dev.install_calls(), vec!["11.1.0"]);

    let st = status_of(&h, "001");
    assert_eq!(st.starting_version, "10.0.2", "anchor must never be rewritten");
    assert_eq!(st.current_path_index, 3);
}

// The stale-writer guard refuses a fresh in-flight record.
#[tokio::test]
async fn fresh_in_flight_record_blocks_a_second_workflow() {
    let h = harness(&[("10.5.1", &["11.1.0"])]);
    let dev = MockDevice::builder("001", "10.5.1").build();

    let store = StatusStore::new(h.workdir.clone());
    let mut seeded = DeviceStatus::new("001");
    seeded.starting_version = "10.5.1".to_string();
    seeded.upgrade_status = UpgradeStatus::Downloading;
    store.save(&mut seeded).unwrap();

    let err = h
        .engine
        .run(
            &device("001"),
            HaRole::Standalone,
            dev,
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConcurrentWriter { .. }));
    assert!(err.is_transient());
}

// Property 9: rerunning a download-only job with everything present.
#[tokio::test]
async fn download_only_rerun_with_all_images_present_skips_everything() {
    let h = harness(&[("10.0.2", &["10.1.0", "11.1.0"])]);
    let dev = MockDevice::builder("001", "10.0.2")
        .downloaded(["10.1.0", "11.1.0"])
        .build();

    let outcome = h
        .engine
        .run(
            &device("001"),
            HaRole::Standalone,
            dev.clone(),
            true,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, WorkflowOutcome::DownloadComplete);
    assert!(dev.download_calls().is_empty());

    let st = status_of(&h, "001");
    assert_eq!(st.upgrade_status, UpgradeStatus::DownloadComplete);
    assert!(st.ready_for_install);
    assert!(st.downloaded_versions.is_empty());
    assert_eq!(st.skipped_versions, vec!["10.1.0", "11.1.0"]);
    assert_eq!(st.current_path_index, 2);
    assert!(dev.install_calls().is_empty());
    assert_eq!(dev.reboot_count(), 0);
}

// Property 11: disk gate failure stops the workflow before any download.
#[tokio::test]
async fn insufficient_disk_fails_before_any_download() {
    let h = harness(&[("10.5.1", &["11.1.0"])]);
    let dev = MockDevice::builder("001", "10.5.1").disk_gb(2.5).build();

    let err = h
        .engine
        .run(
            &device("001"),
            HaRole::Standalone,
            dev.clone(),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::InsufficientDisk { .. }));
    assert!(dev.download_calls().is_empty());

    let st = status_of(&h, "001");
    assert_eq!(st.upgrade_status, UpgradeStatus::Failed);
    assert_eq!(st.current_phase, "download");
    assert!(!st.errors.is_empty());
    assert!(!st.disk_space.unwrap().check_passed);
}

// Property 13: cancellation during a download wait lands in `cancelled`.
#[tokio::test]
async fn cancellation_during_download_wait_is_terminal_cancelled() {
    let h = harness(&[("10.5.1", &["11.1.0"])]);
    let dev = MockDevice::builder("001", "10.5.1")
        .step_delay(Duration::from_millis(80))
        .build();
    let cancel = CancellationToken::new();

    let engine = h.engine.clone();
    let target = device("001");
    let run_dev = dev.clone();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        engine
            .run(&target, HaRole::Standalone, run_dev, false, &run_cancel)
            .await
    });

    tokio::time::sleep(Duration::from_millis(40)).await;
    cancel.cancel();

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome, WorkflowOutcome::Cancelled);

    let st = status_of(&h, "001");
    assert_eq!(st.upgrade_status, UpgradeStatus::Cancelled);
    assert_eq!(st.current_phase, "download");
    assert!(dev.install_calls().is_empty());
}

// The post-download inventory check is a hard gate.
#[tokio::test]
async fn phantom_downloads_fail_verification() {
    let h = harness(&[("10.5.1", &["11.1.0"])]);
    let dev = MockDevice::builder("001", "10.5.1")
        .phantom_downloads()
        .build();

    let err = h
        .engine
        .run(
            &device("001"),
            HaRole::Standalone,
            dev.clone(),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        EngineError::VerificationFailed { missing, .. } => {
            assert_eq!(missing, vec!["11.1.0"]);
        }
        other => panic!("expected VerificationFailed, got {other}"),
    }
    assert!(dev.install_calls().is_empty());
}

// A non-chaining installer is walked hop by hop by the re-plan loop.
#[tokio::test]
async fn replan_loop_walks_a_non_chaining_installer_to_target() {
    let h = harness(&[("10.0.2", &["10.1.0", "10.5.1", "11.1.0"])]);
    let dev = MockDevice::builder("001", "10.0.2")
        .install_outcomes(["10.1.0", "10.5.1", "11.1.0"])
        .build();

    let outcome = h
        .engine
        .run(
            &device("001"),
            HaRole::Standalone,
            dev.clone(),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, WorkflowOutcome::Complete);
    // First cycle aims at the target; the device lands short, and the loop
    // walks the remaining hops explicitly.
    assert_eq!(dev.install_calls(), vec!["11.1.0", "10.5.1", "11.1.0"]);
    assert_eq!(dev.reboot_count(), 3);
    assert_eq!(dev.current_version(), "11.1.0");

    let st = status_of(&h, "001");
    assert_eq!(st.current_path_index, 3);
}

// Dry run: full bookkeeping, zero mutations.
#[tokio::test]
async fn dry_run_writes_artifacts_without_touching_the_device() {
    let h = harness(&[("10.5.1", &["11.1.0"])]);
    let real = MockDevice::builder("001", "10.5.1").build();
    let api: Arc<dyn DeviceApi> = Arc::new(DryRunApi::with_step(
        real.clone(),
        Duration::from_millis(2),
    ));

    let outcome = h
        .engine
        .run(
            &device("001"),
            HaRole::Standalone,
            api,
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, WorkflowOutcome::Complete);
    assert!(real.download_calls().is_empty());
    assert!(real.install_calls().is_empty());
    assert_eq!(real.reboot_count(), 0);
    assert_eq!(real.current_version(), "10.5.1");

    // Bookkeeping still happened: status and both validation artifacts.
    let st = status_of(&h, "001");
    assert_eq!(st.upgrade_status, UpgradeStatus::Complete);
    let pre = fsio::list_json_files(&h.workdir.validation_pre_flight_dir()).unwrap();
    let post = fsio::list_json_files(&h.workdir.validation_post_flight_dir()).unwrap();
    assert!(!pre.is_empty());
    assert!(!post.is_empty());
}

// S5: HA pair upgrades passive first and re-reads roles in between.
#[tokio::test]
async fn ha_pair_upgrades_passive_first_and_rereads_roles() {
    let h = harness(&[("10.5.1", &["11.1.0"])]);
    // A starts active; by the time it is re-queried it reports passive
    // because the pair failed over while B rebooted.
    let dev_a = MockDevice::builder("A", "10.5.1")
        .ha_roles([HaRole::Active, HaRole::Passive])
        .build();
    let dev_b = MockDevice::builder("B", "10.5.1")
        .ha_roles([HaRole::Passive])
        .build();

    let connector = MockConnector::new();
    connector.register("A", dev_a.clone());
    connector.register("B", dev_b.clone());

    let coordinator = HaCoordinator::new(&h.engine, &connector);
    let outcome = coordinator
        .run(
            &device("A"),
            &device("B"),
            false,
            &CancellationToken::new(),
            |api| api,
        )
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.first_serial, "B", "passive member goes first");
    assert_eq!(outcome.second_serial, "A");
    assert_eq!(dev_a.current_version(), "11.1.0");
    assert_eq!(dev_b.current_version(), "11.1.0");

    // The second member's recorded role is the re-read one.
    let st_a = status_of(&h, "A");
    assert_eq!(st_a.ha_role, HaRole::Passive);
}

// Property 12: ambiguous HA roles fail the pair before any upgrade.
#[tokio::test]
async fn ambiguous_ha_roles_fail_without_touching_either_device() {
    let h = harness(&[("10.5.1", &["11.1.0"])]);

    for (role_a, role_b) in [
        (HaRole::Active, HaRole::Active),
        (HaRole::Passive, HaRole::Passive),
        (HaRole::Unknown, HaRole::Passive),
        (HaRole::Active, HaRole::Unknown),
    ] {
        let dev_a = MockDevice::builder("A", "10.5.1").ha_roles([role_a]).build();
        let dev_b = MockDevice::builder("B", "10.5.1").ha_roles([role_b]).build();
        let connector = MockConnector::new();
        connector.register("A", dev_a.clone());
        connector.register("B", dev_b.clone());

        let coordinator = HaCoordinator::new(&h.engine, &connector);
        let err = coordinator
            .run(
                &device("A"),
                &device("B"),
                false,
                &CancellationToken::new(),
                |api| api,
            )
            .await
            .unwrap_err();

        assert!(
            matches!(err, HaError::AmbiguousRoles { .. }),
            "roles {role_a}/{role_b} must be refused"
        );
        assert!(dev_a.download_calls().is_empty());
        assert!(dev_b.download_calls().is_empty());
        assert_eq!(dev_a.reboot_count() + dev_b.reboot_count(), 0);
    }
}

// HA download-only variant stops both members after the download phase.
#[tokio::test]
async fn ha_download_only_downloads_on_both_members_without_install() {
    let h = harness(&[("10.5.1", &["11.1.0"])]);
    let dev_a = MockDevice::builder("A", "10.5.1").ha_roles([HaRole::Active]).build();
    let dev_b = MockDevice::builder("B", "10.5.1").ha_roles([HaRole::Passive]).build();
    let connector = MockConnector::new();
    connector.register("A", dev_a.clone());
    connector.register("B", dev_b.clone());

    let coordinator = HaCoordinator::new(&h.engine, &connector);
    let outcome = coordinator
        .run(
            &device("A"),
            &device("B"),
            true,
            &CancellationToken::new(),
            |api| api,
        )
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(dev_a.download_calls(), vec!["11.1.0"]);
    assert_eq!(dev_b.download_calls(), vec!["11.1.0"]);
    assert!(dev_a.install_calls().is_empty());
    assert!(dev_b.install_calls().is_empty());
    assert_eq!(status_of(&h, "A").upgrade_status, UpgradeStatus::DownloadComplete);
    assert_eq!(status_of(&h, "B").upgrade_status, UpgradeStatus::DownloadComplete);
}

// Retry budget: a transient download failure is retried and succeeds.
#[tokio::test]
async fn transient_download_failure_is_retried_within_budget() {
    let h = harness(&[("10.5.1", &["11.1.0"])]);
    let dev = MockDevice::builder("001", "10.5.1").build();
    dev.fail_next(
        "download",
        fleetup_core::device_api::ApiError::Busy {
            detail: "job queue full".to_string(),
        },
    );

    let outcome = h
        .engine
        .run(
            &device("001"),
            HaRole::Standalone,
            dev.clone(),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, WorkflowOutcome::Complete);
    assert_eq!(dev.download_calls().len(), 2, "one failed attempt, one retry");
}

/// Rewrites the stored status record's heartbeat to `secs` seconds ago.
fn age_status_file(workdir: &WorkDir, serial: &str, secs: i64) {
    let store = StatusStore::new(workdir.clone());
    let mut st = store.load(serial).unwrap().unwrap();
    st.last_updated = Some(Utc::now() - ChronoDuration::seconds(secs));
    fsio::atomic_write_json(&workdir.device_status_file(serial), &st).unwrap();
}
