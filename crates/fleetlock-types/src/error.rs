//! The error taxonomy shared by every layer.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::Capability;
use crate::action::{ActionStatus, ActionType};
use crate::{ActionId, DeviceId};

/// Kind of entity named in [`FleetError::NotFound`] and
/// [`FleetError::ReferencedByAssignments`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Device,
    Group,
    Policy,
    Assignment,
    Action,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Device => "Device",
            EntityKind::Group => "Device group",
            EntityKind::Policy => "Policy",
            EntityKind::Assignment => "Policy assignment",
            EntityKind::Action => "Action",
        })
    }
}

/// Every failure the control plane can report.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FleetError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Action {action_id} cannot move from {from} to {to}")]
    InvalidTransition {
        action_id: ActionId,
        from: ActionStatus,
        to: ActionStatus,
    },

    #[error("A {action_type} action is already in flight for device {device_id}")]
    ActionAlreadyInFlight {
        device_id: DeviceId,
        action_type: ActionType,
    },

    #[error("Assignment must target exactly one of a device or a device group")]
    ExactlyOneTargetViolation,

    #[error("Policy already has an active assignment to {0}")]
    DuplicateAssignment(String),

    #[error("{kind} {id} is referenced by {count} active assignment(s)")]
    ReferencedByAssignments {
        kind: EntityKind,
        id: String,
        count: usize,
    },

    #[error("Device {device_id} is locked out for another {remaining_seconds}s")]
    LockedOut {
        device_id: DeviceId,
        remaining_seconds: i64,
    },

    #[error("Device identity already registered: {0}")]
    DuplicateIdentity(String),

    #[error("{field} = {value} is outside [{min}, {max}]")]
    ValidationRange {
        field: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Device {0} is inactive")]
    DeviceInactive(DeviceId),

    #[error("Device {0} is offline")]
    DeviceOffline(DeviceId),

    #[error("Capability denied for {actor}: {capability:?}")]
    Forbidden {
        actor: String,
        capability: Capability,
    },

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl FleetError {
    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        FleetError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
