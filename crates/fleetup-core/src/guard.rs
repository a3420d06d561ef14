//! Duplicate-job guard.
//!
//! A device serial may appear in at most one job across `queue/pending/` and
//! `queue/active/`, and download-only jobs may never coexist with full
//! upgrades on the same device. The guard scans both directories at
//! admission time; the CLI runs the same check client-side for a friendlier
//! rejection, but the daemon's check is the one that counts.

use crate::fsio::{self, FsError};
use crate::job::{Job, JobFamily, JobType};
use crate::workdir::{QueueState, WorkDir};

/// Why a submission was refused.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GuardRejection {
    /// A serial already belongs to a queued or running job.
    #[error(
        "device {serial} already has a {blocking_state} job (job id: {blocking_job_id})"
    )]
    Duplicate {
        /// The overlapping serial.
        serial: String,
        /// The job that owns the device.
        blocking_job_id: String,
        /// `pending` or `active`.
        blocking_state: &'static str,
    },

    /// A serial belongs to a job of the opposite family.
    #[error(
        "device {serial} has a {blocking_state} {existing} job (job id: {blocking_job_id}); \
         {requested} jobs cannot run concurrently with it"
    )]
    ConflictingType {
        /// The overlapping serial.
        serial: String,
        /// The job that owns the device.
        blocking_job_id: String,
        /// `pending` or `active`.
        blocking_state: &'static str,
        /// Family of the existing job.
        existing: JobFamily,
        /// Family of the attempted submission.
        requested: JobFamily,
    },
}

/// Checks whether `devices` of a prospective job of type `job_type` collide
/// with any other job in `pending/` or `active/`.
///
/// `exclude_job_id` skips the submission's own descriptor so the daemon can
/// re-validate a file that already sits in `pending/`.
///
/// Malformed descriptors are skipped: intake quarantines them separately and
/// a broken file must not block unrelated submissions.
///
/// # Errors
///
/// Returns [`FsError`] when a queue directory cannot be enumerated. A guard
/// rejection is the `Ok(Err(..))` inner value so callers can distinguish
/// infrastructure failures from refusals.
pub fn check_submission(
    workdir: &WorkDir,
    devices: &[String],
    job_type: JobType,
    exclude_job_id: Option<&str>,
) -> Result<Result<(), GuardRejection>, FsError> {
    for (state, label) in [
        (QueueState::Pending, "pending"),
        (QueueState::Active, "active"),
    ] {
        for path in fsio::list_json_files(&workdir.queue(state))? {
            let Some(other) = fsio::read_json::<Job>(&path).ok().flatten() else {
                continue;
            };
            if exclude_job_id == Some(other.job_id.as_str()) {
                continue;
            }
            let Some(serial) = devices.iter().find(|s| other.devices.contains(s)) else {
                continue;
            };

            let rejection = if other.job_type.family() == job_type.family() {
                GuardRejection::Duplicate {
                    serial: serial.clone(),
                    blocking_job_id: other.job_id,
                    blocking_state: label,
                }
            } else {
                GuardRejection::ConflictingType {
                    serial: serial.clone(),
                    blocking_job_id: other.job_id,
                    blocking_state: label,
                    existing: other.job_type.family(),
                    requested: job_type.family(),
                }
            };
            return Ok(Err(rejection));
        }
    }
    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsio::atomic_write_json;

    fn workdir() -> (tempfile::TempDir, WorkDir) {
        let tmp = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(tmp.path());
        wd.ensure_layout().unwrap();
        (tmp, wd)
    }

    fn put_job(wd: &WorkDir, state: QueueState, job: &Job) {
        atomic_write_json(&wd.queue(state).join(job.file_name()), job).unwrap();
    }

    #[test]
    fn clean_queues_admit_anything() {
        let (_tmp, wd) = workdir();
        let verdict =
            check_submission(&wd, &["001".to_string()], JobType::Standalone, None).unwrap();
        assert!(verdict.is_ok());
    }

    #[test]
    fn overlap_with_pending_job_is_rejected_with_the_blocker_named() {
        let (_tmp, wd) = workdir();
        let existing = Job::new("cli-1", JobType::Standalone, vec!["001".to_string()]);
        put_job(&wd, QueueState::Pending, &existing);

        let verdict =
            check_submission(&wd, &["001".to_string()], JobType::Standalone, None).unwrap();
        assert_eq!(
            verdict.unwrap_err(),
            GuardRejection::Duplicate {
                serial: "001".to_string(),
                blocking_job_id: "cli-1".to_string(),
                blocking_state: "pending",
            }
        );
    }

    #[test]
    fn overlap_with_active_job_reports_active_state() {
        let (_tmp, wd) = workdir();
        let existing = Job::new(
            "web-9",
            JobType::HaPair,
            vec!["A".to_string(), "B".to_string()],
        );
        put_job(&wd, QueueState::Active, &existing);

        // Overlap through either member of the pair blocks.
        let verdict = check_submission(&wd, &["B".to_string()], JobType::Standalone, None).unwrap();
        match verdict.unwrap_err() {
            GuardRejection::Duplicate {
                serial,
                blocking_state,
                ..
            } => {
                assert_eq!(serial, "B");
                assert_eq!(blocking_state, "active");
            }
            other => panic!("expected Duplicate, got {other:?}"),
        }
    }

    #[test]
    fn opposite_family_is_a_conflicting_type() {
        let (_tmp, wd) = workdir();
        let existing = Job::new("dl-1", JobType::DownloadOnly, vec!["001".to_string()]);
        put_job(&wd, QueueState::Active, &existing);

        let verdict =
            check_submission(&wd, &["001".to_string()], JobType::Standalone, None).unwrap();
        match verdict.unwrap_err() {
            GuardRejection::ConflictingType {
                existing,
                requested,
                ..
            } => {
                assert_eq!(existing, JobFamily::DownloadOnly);
                assert_eq!(requested, JobFamily::FullUpgrade);
            }
            other => panic!("expected ConflictingType, got {other:?}"),
        }
    }

    #[test]
    fn a_job_does_not_collide_with_itself() {
        let (_tmp, wd) = workdir();
        let own = Job::new("self-1", JobType::Standalone, vec!["001".to_string()]);
        put_job(&wd, QueueState::Pending, &own);

        let verdict =
            check_submission(&wd, &own.devices, own.job_type, Some("self-1")).unwrap();
        assert!(verdict.is_ok());
    }

    #[test]
    fn malformed_descriptors_do_not_block_admission() {
        let (_tmp, wd) = workdir();
        std::fs::write(wd.queue(QueueState::Pending).join("junk.json"), b"{oops").unwrap();

        let verdict =
            check_submission(&wd, &["001".to_string()], JobType::Standalone, None).unwrap();
        assert!(verdict.is_ok());
    }

    #[test]
    fn terminal_jobs_do_not_block_resubmission() {
        let (_tmp, wd) = workdir();
        let done = Job::new("old-1", JobType::Standalone, vec!["001".to_string()]);
        put_job(&wd, QueueState::Completed, &done);
        put_job(&wd, QueueState::Failed, &done);

        let verdict =
            check_submission(&wd, &["001".to_string()], JobType::Standalone, None).unwrap();
        assert!(verdict.is_ok());
    }
}
