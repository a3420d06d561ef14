//! Work-directory layout and resolution.
//!
//! All coordination between the CLI, the daemon, and external tooling happens
//! under a single work directory. This module owns the map of that directory
//! and the precedence rules for locating it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fsio::{self, FsError};

/// Environment variable naming the work directory.
pub const ENV_WORK_DIR: &str = "FLEETUP_HOME";

/// Per-user pointer file consulted when neither flag nor env var is set.
pub const USER_POINTER_FILE: &str = ".fleetup.json";

/// Fallback work directory.
pub const DEFAULT_WORK_DIR: &str = "/opt/fleetup";

/// Where the resolved work directory came from, for startup logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkDirSource {
    /// `--work-dir` flag.
    CliFlag,
    /// [`ENV_WORK_DIR`] environment variable.
    EnvVar,
    /// `~/.fleetup.json` pointer file.
    UserPointer,
    /// Built-in default.
    Default,
}

impl std::fmt::Display for WorkDirSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CliFlag => "from --work-dir flag",
            Self::EnvVar => "from FLEETUP_HOME environment variable",
            Self::UserPointer => "from ~/.fleetup.json",
            Self::Default => "default",
        };
        f.write_str(s)
    }
}

/// Shape of the `~/.fleetup.json` pointer file.
#[derive(Debug, Serialize, Deserialize)]
struct UserPointer {
    work_dir: PathBuf,
    #[serde(default)]
    created_at: String,
}

/// Resolves the work directory: flag > env var > user pointer > default.
#[must_use]
pub fn resolve(cli_flag: Option<&Path>) -> (PathBuf, WorkDirSource) {
    if let Some(path) = cli_flag {
        return (path.to_path_buf(), WorkDirSource::CliFlag);
    }
    if let Some(path) = std::env::var_os(ENV_WORK_DIR).filter(|v| !v.is_empty()) {
        return (PathBuf::from(path), WorkDirSource::EnvVar);
    }
    if let Some(home) = std::env::var_os("HOME") {
        let pointer = Path::new(&home).join(USER_POINTER_FILE);
        if let Ok(Some(pointer)) = fsio::read_json::<UserPointer>(&pointer) {
            return (pointer.work_dir, WorkDirSource::UserPointer);
        }
    }
    (PathBuf::from(DEFAULT_WORK_DIR), WorkDirSource::Default)
}

/// The control-plane directory map.
///
/// Cheap to clone; every component holds one and derives its paths from it
/// rather than concatenating strings ad hoc.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Wraps an already-resolved root path.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The work-directory root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `daemon.pid`: written synchronously at daemon startup, removed at
    /// exit. The authoritative liveness signal for `fleetup daemon
    /// stop|status`, independent of the periodic status snapshots.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    /// `config/config.json`.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config").join("config.json")
    }

    /// `config/upgrade_paths.json`.
    #[must_use]
    pub fn upgrade_paths_file(&self) -> PathBuf {
        self.root.join("config").join("upgrade_paths.json")
    }

    /// `devices/inventory.json`.
    #[must_use]
    pub fn inventory_file(&self) -> PathBuf {
        self.root.join("devices").join("inventory.json")
    }

    /// One of the five job-queue states. The canonical location of a job file
    /// encodes its status.
    #[must_use]
    pub fn queue(&self, state: QueueState) -> PathBuf {
        self.root.join("queue").join(state.dir_name())
    }

    /// `commands/incoming`.
    #[must_use]
    pub fn commands_incoming(&self) -> PathBuf {
        self.root.join("commands").join("incoming")
    }

    /// `commands/processed`.
    #[must_use]
    pub fn commands_processed(&self) -> PathBuf {
        self.root.join("commands").join("processed")
    }

    /// `status/daemon.json`.
    #[must_use]
    pub fn daemon_status_file(&self) -> PathBuf {
        self.root.join("status").join("daemon.json")
    }

    /// `status/workers.json`.
    #[must_use]
    pub fn workers_status_file(&self) -> PathBuf {
        self.root.join("status").join("workers.json")
    }

    /// `status/devices/{serial}.json`.
    #[must_use]
    pub fn device_status_file(&self, serial: &str) -> PathBuf {
        self.device_status_dir().join(format!("{serial}.json"))
    }

    /// `status/devices`.
    #[must_use]
    pub fn device_status_dir(&self) -> PathBuf {
        self.root.join("status").join("devices")
    }

    /// `validation/pre_flight`.
    #[must_use]
    pub fn validation_pre_flight_dir(&self) -> PathBuf {
        self.root.join("validation").join("pre_flight")
    }

    /// `validation/post_flight`.
    #[must_use]
    pub fn validation_post_flight_dir(&self) -> PathBuf {
        self.root.join("validation").join("post_flight")
    }

    /// `logs/structured`.
    #[must_use]
    pub fn structured_log_dir(&self) -> PathBuf {
        self.root.join("logs").join("structured")
    }

    /// `logs/text`.
    #[must_use]
    pub fn text_log_dir(&self) -> PathBuf {
        self.root.join("logs").join("text")
    }

    /// Creates every control-plane directory that does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] if a directory cannot be created.
    pub fn ensure_layout(&self) -> Result<(), FsError> {
        let dirs = [
            self.root.join("config"),
            self.root.join("devices"),
            self.queue(QueueState::Pending),
            self.queue(QueueState::Active),
            self.queue(QueueState::Completed),
            self.queue(QueueState::Cancelled),
            self.queue(QueueState::Failed),
            self.commands_incoming(),
            self.commands_processed(),
            self.device_status_dir(),
            self.validation_pre_flight_dir(),
            self.validation_post_flight_dir(),
            self.structured_log_dir(),
            self.text_log_dir(),
        ];
        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|e| FsError::Io {
                context: "create control-plane directory",
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Sweeps orphaned temp files from the directories the daemon writes to.
    /// Returns the total number removed.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] if a directory cannot be enumerated.
    pub fn sweep_temp_files(&self) -> Result<usize, FsError> {
        let dirs = [
            self.queue(QueueState::Pending),
            self.queue(QueueState::Active),
            self.queue(QueueState::Completed),
            self.queue(QueueState::Cancelled),
            self.queue(QueueState::Failed),
            self.commands_processed(),
            self.root.join("status"),
            self.device_status_dir(),
        ];
        let mut removed = 0;
        for dir in dirs {
            removed += fsio::sweep_temp_files(&dir)?;
        }
        Ok(removed)
    }
}

/// The five canonical queue states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Written by clients, awaiting intake.
    Pending,
    /// Owned by the daemon, workflow in flight.
    Active,
    /// Terminal: at least one member workflow succeeded.
    Completed,
    /// Terminal: cancelled by operator command.
    Cancelled,
    /// Terminal: rejected at admission or every member workflow failed.
    Failed,
}

impl QueueState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Active,
        Self::Completed,
        Self::Cancelled,
        Self::Failed,
    ];

    /// Directory name under `queue/`.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}
