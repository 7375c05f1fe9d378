//! Structured events emitted to audit and notification collaborators.
//!
//! On the wire an event is flat:
//! `{id, timestamp, device_id?, actor_id?, severity, type, details}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::Actor;
use crate::action::{ActionStatus, ActionType};
use crate::device::Presence;
use crate::{ActionId, DeviceId, PolicyId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyChange {
    Created,
    Updated,
    Deleted,
    Assigned,
    Unassigned,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "details")]
pub enum EventPayload {
    DeviceRegistered {
        hostname: String,
    },
    DeviceDeactivated,
    PresenceChanged {
        from: Presence,
        to: Presence,
    },
    ActionStateChanged {
        action_id: ActionId,
        action_type: ActionType,
        /// `None` when the action was just created.
        from: Option<ActionStatus>,
        to: ActionStatus,
    },
    UnlockAttemptFailed {
        consecutive_failures: u32,
        max_attempts: u32,
    },
    UnlockBlocked {
        remaining_seconds: i64,
    },
    LockoutTripped {
        until: DateTime<Utc>,
        max_attempts: u32,
    },
    PolicyChanged {
        policy_id: PolicyId,
        change: PolicyChange,
    },
}

impl EventPayload {
    /// Severity used when the emitter does not pick one explicitly.
    pub fn default_severity(&self) -> Severity {
        match self {
            EventPayload::DeviceRegistered { .. }
            | EventPayload::DeviceDeactivated
            | EventPayload::PolicyChanged { .. } => Severity::Info,
            EventPayload::PresenceChanged { to, .. } => match to {
                Presence::Online => Severity::Info,
                Presence::Offline => Severity::Warning,
            },
            EventPayload::ActionStateChanged { to, .. } => match to {
                ActionStatus::Failed | ActionStatus::Timeout => Severity::Warning,
                _ => Severity::Info,
            },
            EventPayload::UnlockAttemptFailed { .. } => Severity::Warning,
            EventPayload::UnlockBlocked { .. } => Severity::Error,
            EventPayload::LockoutTripped { .. } => Severity::Critical,
        }
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::DeviceRegistered { .. } => "device_registered",
            EventPayload::DeviceDeactivated => "device_deactivated",
            EventPayload::PresenceChanged { .. } => "presence_changed",
            EventPayload::ActionStateChanged { .. } => "action_state_changed",
            EventPayload::UnlockAttemptFailed { .. } => "unlock_attempt_failed",
            EventPayload::UnlockBlocked { .. } => "unlock_blocked",
            EventPayload::LockoutTripped { .. } => "lockout_tripped",
            EventPayload::PolicyChanged { .. } => "policy_changed",
        }
    }
}

/// An audit-grade event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub device_id: Option<DeviceId>,
    pub actor_id: Option<String>,
    pub severity: Severity,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            device_id: None,
            actor_id: None,
            severity: payload.default_severity(),
            payload,
        }
    }

    pub fn for_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn by(mut self, actor: &Actor) -> Self {
        self.actor_id = actor.id();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}
