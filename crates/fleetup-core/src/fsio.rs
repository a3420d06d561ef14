//! Atomic file-store primitives for the control plane.
//!
//! Every persistent write in fleetup goes through [`atomic_write_json`]: the
//! payload lands in a dotted `.{name}.…​.tmp` file in the target's directory,
//! is flushed and fsynced, and is then renamed over the final name. A reader
//! that observes a fully-named file observes either the previous complete
//! version or the new complete version, never a torn write. Directory scans
//! skip dotted names, so half-written files are invisible to every consumer.
//!
//! Reads are bounded ([`MAX_DOCUMENT_SIZE`]) before deserialization, and a
//! missing file is a documented sentinel (`Ok(None)`), not an error: a device
//! that has not produced status yet looks exactly like an empty slot.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Upper bound for any single control-plane document read.
///
/// Inventory files for a ~230-device fleet are well under 1 MiB; 16 MiB keeps
/// a corrupted or adversarial file from exhausting memory.
pub const MAX_DOCUMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Suffix carried by in-flight temp files so sweeps can identify them.
const TMP_SUFFIX: &str = ".tmp";

/// Errors from control-plane file operations.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// File exceeds [`MAX_DOCUMENT_SIZE`].
    #[error("file too large: {} is {size} bytes (max {max})", path.display())]
    FileTooLarge {
        /// Offending path.
        path: PathBuf,
        /// Actual size in bytes.
        size: u64,
        /// Allowed maximum in bytes.
        max: u64,
    },

    /// The target path has no parent directory to host the temp file.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Path with no parent.
        path: PathBuf,
    },

    /// The target path has no final file name component.
    #[error("path has no file name: {}", path.display())]
    NoFileName {
        /// Path with no file name.
        path: PathBuf,
    },

    /// JSON serialization failed.
    #[error("json serialization failed for {}: {source}", path.display())]
    Serialize {
        /// Path being written.
        path: PathBuf,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// JSON deserialization failed. The file exists but is not well-formed.
    #[error("malformed json in {}: {source}", path.display())]
    Malformed {
        /// Path being read.
        path: PathBuf,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// An I/O error occurred.
    #[error("i/o error during {context} on {}: {source}", path.display())]
    Io {
        /// What the operation was doing.
        context: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Writes `data` to `path` using the write-temp-then-rename protocol.
///
/// The temp file is named `.{final_name}.{pid}.{seq}.tmp` in the same
/// directory as `path`, which guarantees the final rename stays on one
/// filesystem and is atomic. The temp file is fsynced before the rename and
/// the parent directory is fsynced after it, so a crash at any point leaves
/// either the old complete file or the new complete file.
///
/// # Errors
///
/// Returns [`FsError`] if the parent directory cannot be created or any
/// filesystem step fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| FsError::NoParentDirectory {
            path: path.to_path_buf(),
        })?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FsError::NoFileName {
            path: path.to_path_buf(),
        })?;

    fs::create_dir_all(parent).map_err(|e| FsError::io("create parent directory", parent, e))?;

    let mut builder = tempfile::Builder::new();
    let prefix = format!(".{name}.");
    builder.prefix(&prefix).suffix(TMP_SUFFIX);
    let mut tmp = builder
        .tempfile_in(parent)
        .map_err(|e| FsError::io("create temp file", parent, e))?;

    tmp.write_all(data)
        .map_err(|e| FsError::io("write temp file", path, e))?;
    tmp.flush()
        .map_err(|e| FsError::io("flush temp file", path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsError::io("fsync temp file", path, e))?;

    // NamedTempFile::persist is rename(2) under the hood.
    tmp.persist(path)
        .map_err(|e| FsError::io("rename temp file into place", path, e.error))?;

    fsync_dir(parent)
}

/// Serializes `value` as pretty JSON and writes it atomically to `path`.
///
/// Serialization happens in memory first, so a serde failure never leaves a
/// partial file behind.
///
/// # Errors
///
/// Returns [`FsError::Serialize`] on serde failure, or any [`atomic_write`]
/// error.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FsError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| FsError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    atomic_write(path, &json)
}

/// Reads and deserializes a JSON document, treating absence as `Ok(None)`.
///
/// Readers of the control plane must tolerate files that have not been
/// produced yet; only a present-but-malformed or oversized file is an error.
///
/// # Errors
///
/// Returns [`FsError::FileTooLarge`] past [`MAX_DOCUMENT_SIZE`],
/// [`FsError::Malformed`] on bad JSON, or [`FsError::Io`] on other failures.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, FsError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FsError::io("stat file", path, e)),
    };
    if meta.len() > MAX_DOCUMENT_SIZE {
        return Err(FsError::FileTooLarge {
            path: path.to_path_buf(),
            size: meta.len(),
            max: MAX_DOCUMENT_SIZE,
        });
    }

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        // Lost a race with a concurrent rename/unlink; same as never there.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FsError::io("read file", path, e)),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| FsError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}

/// Lists the `*.json` files in `dir`, oldest first.
///
/// Names starting with `.` are skipped so in-flight temp files are never
/// visible. Order is mtime ascending with the file name as a tie-break,
/// which is how job and command intake approximate submission order.
///
/// A missing directory yields an empty list.
///
/// # Errors
///
/// Returns [`FsError::Io`] if the directory cannot be enumerated.
pub fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>, FsError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FsError::io("read directory", dir, e)),
    };

    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| FsError::io("read directory entry", dir, e))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((mtime, path));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Moves `src` into `dir`, keeping its file name. Single rename, atomic on
/// one filesystem.
///
/// # Errors
///
/// Returns [`FsError`] if `src` has no file name or the rename fails.
pub fn move_into(src: &Path, dir: &Path) -> Result<PathBuf, FsError> {
    let name = src.file_name().ok_or_else(|| FsError::NoFileName {
        path: src.to_path_buf(),
    })?;
    fs::create_dir_all(dir).map_err(|e| FsError::io("create destination directory", dir, e))?;
    let dest = dir.join(name);
    fs::rename(src, &dest).map_err(|e| FsError::io("rename across directories", src, e))?;
    Ok(dest)
}

/// Removes orphaned `.{name}.….tmp` files left by a crash mid-write.
///
/// Returns the number of files removed. Run once at daemon startup per
/// control-plane directory; a live writer's temp file only exists for the
/// duration of one write, so anything found here is garbage.
///
/// # Errors
///
/// Returns [`FsError::Io`] if the directory cannot be enumerated; individual
/// unlink failures are skipped (another sweep may have won the race).
pub fn sweep_temp_files(dir: &Path) -> Result<usize, FsError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(FsError::io("read directory", dir, e)),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|e| FsError::io("read directory entry", dir, e))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') && name.ends_with(TMP_SUFFIX) && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn fsync_dir(dir: &Path) -> Result<(), FsError> {
    let handle = File::open(dir).map_err(|e| FsError::io("open directory for fsync", dir, e))?;
    handle
        .sync_all()
        .map_err(|e| FsError::io("fsync directory", dir, e))
}
