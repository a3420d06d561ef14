//! Read-only device inventory.
//!
//! The inventory document at `devices/inventory.json` is produced by the
//! discovery tool and never written by the daemon. Lookups resolve a serial
//! to the management address, model, and HA shape of a device; a device
//! without a management IP cannot be upgraded and fails any job that names
//! it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fsio::{self, FsError};

/// Whether a device serves alone or as half of an HA pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Single appliance.
    Standalone,
    /// Member of a high-availability pair.
    HaPair,
    /// Discovery could not classify the device.
    #[default]
    Unknown,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Standalone => "standalone",
            Self::HaPair => "ha_pair",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Live HA role of a device. Advisory in the inventory; the engine re-reads
/// the role from the device because failover may have occurred since
/// discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HaRole {
    /// Actively serving traffic.
    Active,
    /// Hot standby.
    Passive,
    /// Not in an HA pair.
    Standalone,
    /// Role could not be determined.
    #[default]
    Unknown,
}

impl std::fmt::Display for HaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Passive => "passive",
            Self::Standalone => "standalone",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One inventory entry. Immutable for the lifetime of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Unique opaque serial.
    pub serial: String,
    /// Configured host name.
    #[serde(default)]
    pub hostname: String,
    /// Management address used for direct API calls.
    #[serde(default)]
    pub mgmt_ip: String,
    /// Hardware model.
    #[serde(default)]
    pub model: String,
    /// Version at discovery time. Advisory; the live version is re-read.
    #[serde(default)]
    pub current_version: String,
    /// Standalone or HA member.
    #[serde(default)]
    pub device_type: DeviceType,
    /// Serial of the HA peer, present iff `device_type` is [`DeviceType::HaPair`].
    #[serde(default)]
    pub peer_serial: String,
    /// HA role at discovery time.
    #[serde(default)]
    pub ha_state: HaRole,
    /// When discovery recorded this entry (RFC 3339).
    #[serde(default)]
    pub discovered_at: String,
}

/// The inventory document shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InventoryDocument {
    /// All known devices, keyed by serial.
    pub devices: BTreeMap<String, Device>,
    /// Count at write time, for quick display.
    #[serde(default)]
    pub device_count: usize,
    /// When discovery last ran (RFC 3339).
    #[serde(default)]
    pub last_updated: String,
}

/// Inventory lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    /// The serial is not in the inventory at all.
    #[error("device {serial} not found in inventory; run `fleetup device discover` first")]
    NotFound {
        /// Serial looked up.
        serial: String,
    },

    /// The device exists but has no management address, so it cannot be
    /// reached directly.
    #[error("device {serial} has no management IP in inventory")]
    MissingMgmtIp {
        /// Serial looked up.
        serial: String,
    },

    /// The document could not be read.
    #[error(transparent)]
    Store(#[from] FsError),
}

/// In-memory view over the inventory file.
#[derive(Debug)]
pub struct Inventory {
    path: PathBuf,
    doc: InventoryDocument,
}

impl Inventory {
    /// Loads the inventory from `path`. A missing file is an empty
    /// inventory, which makes every lookup a [`InventoryError::NotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Store`] when the file is present but
    /// malformed.
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let doc = fsio::read_json(path)?.unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    /// Re-reads the file, picking up a fresh discovery run.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Store`] on read failure; the previous view
    /// is kept in that case.
    pub fn reload(&mut self) -> Result<(), InventoryError> {
        if let Some(doc) = fsio::read_json(&self.path)? {
            self.doc = doc;
        }
        Ok(())
    }

    /// Looks up a serial.
    #[must_use]
    pub fn get(&self, serial: &str) -> Option<&Device> {
        self.doc.devices.get(serial)
    }

    /// Looks up a serial and requires it to be upgradeable: present, with a
    /// management IP.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::NotFound`] or
    /// [`InventoryError::MissingMgmtIp`].
    pub fn require(&self, serial: &str) -> Result<&Device, InventoryError> {
        let device = self.get(serial).ok_or_else(|| InventoryError::NotFound {
            serial: serial.to_string(),
        })?;
        if device.mgmt_ip.is_empty() {
            return Err(InventoryError::MissingMgmtIp {
                serial: serial.to_string(),
            });
        }
        Ok(device)
    }

    /// All devices, in serial order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.doc.devices.values()
    }

    /// Number of devices known.
    #[must_use]
    pub fn len(&self) -> usize {
        self.doc.devices.len()
    }

    /// Whether the inventory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.doc.devices.is_empty()
    }
}
