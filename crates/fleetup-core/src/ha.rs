//! HA-pair sequencing.
//!
//! An HA pair upgrades passive-first: take the standby out, upgrade it, let
//! it come back, then upgrade the member still carrying traffic. Roles are
//! re-read from the devices at every decision point rather than remembered,
//! because failover can happen at any moment during the passive member's
//! upgrade. An ambiguous pair (both members claiming the same role, or
//! either reporting unknown) fails the job before any device is touched.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::device_api::{ApiError, DeviceApi, DeviceConnector};
use crate::engine::{EngineError, UpgradeEngine, WorkflowOutcome};
use crate::inventory::{Device, HaRole};

/// Result of a pair workflow: the outcome of each member, in upgrade order.
#[derive(Debug)]
pub struct PairOutcome {
    /// Serial upgraded first (the passive member at planning time).
    pub first_serial: String,
    /// Outcome of the first member.
    pub first: WorkflowOutcome,
    /// Serial upgraded second, when the workflow got that far.
    pub second_serial: String,
    /// Outcome of the second member; `None` when the first member's result
    /// stopped the pair.
    pub second: Option<WorkflowOutcome>,
}

impl PairOutcome {
    /// Whether every member workflow that ran succeeded, and both ran.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.first.is_success() && self.second.is_some_and(WorkflowOutcome::is_success)
    }

    /// Whether either member ended cancelled.
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.first == WorkflowOutcome::Cancelled
            || self.second == Some(WorkflowOutcome::Cancelled)
    }
}

/// Pair-level failures.
#[derive(Debug, thiserror::Error)]
pub enum HaError {
    /// The pair's roles do not form one active and one passive member.
    #[error(
        "HA roles ambiguous for pair ({serial_a}={role_a}, {serial_b}={role_b}); refusing to guess"
    )]
    AmbiguousRoles {
        /// First member serial.
        serial_a: String,
        /// First member role as reported.
        role_a: HaRole,
        /// Second member serial.
        serial_b: String,
        /// Second member role as reported.
        role_b: HaRole,
    },

    /// A member could not be queried for its role.
    #[error("could not read HA state of {serial}: {source}")]
    RoleQuery {
        /// Member serial.
        serial: String,
        /// Underlying capability error.
        #[source]
        source: ApiError,
    },

    /// A member workflow failed; the other member keeps whatever state it
    /// reached (no rollback).
    #[error("member {serial} failed: {source}")]
    MemberFailed {
        /// Member serial.
        serial: String,
        /// Underlying workflow error.
        #[source]
        source: EngineError,
    },
}

/// Sequences the two members of an HA pair through the engine.
pub struct HaCoordinator<'a> {
    engine: &'a UpgradeEngine,
    connector: &'a dyn DeviceConnector,
}

impl<'a> HaCoordinator<'a> {
    /// Coordinator borrowing the shared engine and connector.
    #[must_use]
    pub fn new(engine: &'a UpgradeEngine, connector: &'a dyn DeviceConnector) -> Self {
        Self { engine, connector }
    }

    /// Upgrades (or pre-downloads, with `download_only`) both members,
    /// passive first.
    ///
    /// `open_session` builds the per-member capability; the runner injects
    /// dry-run wrapping there so this module never needs to know about it.
    ///
    /// # Errors
    ///
    /// Returns [`HaError`] for ambiguous roles, unreadable roles, or a
    /// failed member workflow.
    pub async fn run(
        &self,
        device_a: &Device,
        device_b: &Device,
        download_only: bool,
        cancel: &CancellationToken,
        open_session: impl Fn(Arc<dyn DeviceApi>) -> Arc<dyn DeviceApi>,
    ) -> Result<PairOutcome, HaError> {
        let api_a = self.connect(device_a, &open_session)?;
        let api_b = self.connect(device_b, &open_session)?;

        let role_a = self.role_of(device_a, api_a.as_ref()).await?;
        let role_b = self.role_of(device_b, api_b.as_ref()).await?;

        // One active, one passive, or we refuse to touch either device.
        let ((passive, passive_api), (active, active_api)) = match (role_a, role_b) {
            (HaRole::Passive, HaRole::Active) => ((device_a, api_a), (device_b, api_b)),
            (HaRole::Active, HaRole::Passive) => ((device_b, api_b), (device_a, api_a)),
            _ => {
                return Err(HaError::AmbiguousRoles {
                    serial_a: device_a.serial.clone(),
                    role_a,
                    serial_b: device_b.serial.clone(),
                    role_b,
                });
            }
        };

        info!(
            pair = %format!("{}/{}", passive.serial, active.serial),
            passive = %passive.serial,
            "upgrading passive member first"
        );

        let first = self
            .engine
            .run(passive, HaRole::Passive, passive_api, download_only, cancel)
            .await
            .map_err(|source| HaError::MemberFailed {
                serial: passive.serial.clone(),
                source,
            })?;

        let mut outcome = PairOutcome {
            first_serial: passive.serial.clone(),
            first,
            second_serial: active.serial.clone(),
            second: None,
        };
        if !first.is_success() {
            // Skipped or cancelled: the pair stops here, the active member
            // stays untouched.
            return Ok(outcome);
        }

        // Failover may have happened while the passive member was down;
        // re-read the remaining member's role for the record rather than
        // trusting the planning-time answer.
        let second_role = match self.role_of(active, active_api.as_ref()).await {
            Ok(role) => {
                if role != HaRole::Active {
                    info!(
                        serial = %active.serial,
                        role = %role,
                        "roles flipped during first member upgrade"
                    );
                }
                role
            }
            Err(err) => {
                warn!(serial = %active.serial, %err, "re-query of HA role failed; proceeding");
                HaRole::Unknown
            }
        };

        info!(serial = %active.serial, role = %second_role, "upgrading remaining member");
        let second = self
            .engine
            .run(active, second_role, active_api, download_only, cancel)
            .await
            .map_err(|source| HaError::MemberFailed {
                serial: active.serial.clone(),
                source,
            })?;
        outcome.second = Some(second);
        Ok(outcome)
    }

    fn connect(
        &self,
        device: &Device,
        open_session: &impl Fn(Arc<dyn DeviceApi>) -> Arc<dyn DeviceApi>,
    ) -> Result<Arc<dyn DeviceApi>, HaError> {
        self.connector
            .connect(device)
            .map(open_session)
            .map_err(|source| HaError::RoleQuery {
                serial: device.serial.clone(),
                source,
            })
    }

    async fn role_of(&self, device: &Device, api: &dyn DeviceApi) -> Result<HaRole, HaError> {
        api.ha_state().await.map_err(|source| HaError::RoleQuery {
            serial: device.serial.clone(),
            source,
        })
    }
}
