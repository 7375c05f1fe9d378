//! JSON frames exchanged over the gateway WebSocket.
//!
//! # Requests
//!
//! Every client frame is a JSON object with an `op` tag, an optional `id`
//! echoed back in the reply, and an optional `actor` (the operator identity
//! established by the upstream authentication layer):
//!
//! ```json
//! {"id": 7, "op": "action", "actor": {"kind": "user", "id": "alice", "role": "it_admin"},
//!  "device_id": "…", "action_type": "lock", "reason": "stolen laptop"}
//! ```
//!
//! # Replies and pushes
//!
//! The server sends three frame types, tagged by `type`:
//!
//! - `reply` – `{id, status, body}` or `{id, status, error, message}`, with an
//!   HTTP-like status (see [`status_code`]);
//! - `command` – a [`DeviceAction`] pushed to the agent it targets;
//! - `event` – an [`Event`] for sessions that subscribed.

use fleetlock_kernel::AttemptOutcome;
use fleetlock_types::{
    ActionDetails, ActionId, ActionStatus, ActionType, Actor, AssignmentId, DeviceAction,
    DeviceId, DeviceIdentity, DeviceProfile, Event, FleetError, GroupId, Heartbeat, PolicyDraft,
    PolicyId, PolicyTemplate,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// One client frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestFrame {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub actor: Option<Actor>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    // ── Agent ────────────────────────────────────────────────────────────────
    Register {
        identity: DeviceIdentity,
        #[serde(default)]
        profile: DeviceProfile,
    },
    /// Bind this connection to an already registered device.
    Hello {
        device_id: DeviceId,
    },
    Heartbeat(Heartbeat),
    Ack {
        action_id: ActionId,
    },
    Complete {
        action_id: ActionId,
        #[serde(default)]
        result: Option<Value>,
    },
    Fail {
        action_id: ActionId,
        error: String,
    },
    UnlockAttempt {
        action_id: ActionId,
        success: bool,
    },
    /// A password typed at the device's own lock screen.  `device_id`
    /// defaults to the device the session is bound to.
    LockScreenAttempt {
        #[serde(default)]
        device_id: Option<DeviceId>,
        success: bool,
    },

    // ── Actions ──────────────────────────────────────────────────────────────
    Action {
        device_id: DeviceId,
        action_type: ActionType,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        force: bool,
        /// Type-specific details; defaults for `action_type` when absent.
        #[serde(default)]
        details: Option<ActionDetails>,
    },
    GetAction {
        action_id: ActionId,
    },
    Actions {
        #[serde(default)]
        device_id: Option<DeviceId>,
        #[serde(default)]
        status: Option<ActionStatus>,
        #[serde(default)]
        action_type: Option<ActionType>,
    },

    // ── Devices ──────────────────────────────────────────────────────────────
    Device {
        device_id: DeviceId,
    },
    Devices {
        #[serde(default)]
        include_inactive: bool,
    },
    Deactivate {
        device_id: DeviceId,
    },
    Stats,

    // ── Groups ───────────────────────────────────────────────────────────────
    Groups,
    CreateGroup {
        name: String,
        #[serde(default)]
        description: String,
    },
    RenameGroup {
        group_id: GroupId,
        name: String,
        #[serde(default)]
        description: Option<String>,
    },
    DeleteGroup {
        group_id: GroupId,
    },
    AddMember {
        group_id: GroupId,
        device_id: DeviceId,
    },
    RemoveMember {
        group_id: GroupId,
        device_id: DeviceId,
    },

    // ── Policies ─────────────────────────────────────────────────────────────
    Policies,
    GetPolicy {
        policy_id: PolicyId,
    },
    CreatePolicy {
        policy: PolicyDraft,
    },
    CreatePolicyFromTemplate {
        name: String,
        template: PolicyTemplate,
    },
    UpdatePolicy {
        policy_id: PolicyId,
        policy: PolicyDraft,
    },
    DeletePolicy {
        policy_id: PolicyId,
    },
    /// Exactly one of `device_id` / `group_id` must be set.
    Assign {
        policy_id: PolicyId,
        #[serde(default)]
        device_id: Option<DeviceId>,
        #[serde(default)]
        group_id: Option<GroupId>,
    },
    SetAssignmentActive {
        assignment_id: AssignmentId,
        active: bool,
    },
    DeleteAssignment {
        assignment_id: AssignmentId,
    },
    Resolve {
        device_id: DeviceId,
    },

    // ── Streaming ────────────────────────────────────────────────────────────
    /// Stream events on the named topics (all topics when empty).
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply {
        id: Option<Value>,
        status: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<FleetError>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Command {
        action: DeviceAction,
    },
    Event {
        event: Event,
    },
}

impl ServerFrame {
    pub fn ok(id: Option<Value>, body: Value) -> Self {
        ServerFrame::Reply {
            id,
            status: 200,
            body: Some(body),
            error: None,
            message: None,
        }
    }

    pub fn error(id: Option<Value>, err: FleetError) -> Self {
        ServerFrame::Reply {
            id,
            status: status_code(&err),
            body: None,
            message: Some(err.to_string()),
            error: Some(err),
        }
    }

    /// Reply to a frame that could not be parsed at all.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::error(None, FleetError::InvalidRequest(reason.into()))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ServerFrame::Reply { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// HTTP-like status for an error.
pub fn status_code(err: &FleetError) -> u16 {
    match err {
        FleetError::NotFound { .. } => 404,
        FleetError::Forbidden { .. } => 403,
        FleetError::InvalidTransition { .. }
        | FleetError::ActionAlreadyInFlight { .. }
        | FleetError::DuplicateIdentity(_)
        | FleetError::DuplicateAssignment(_)
        | FleetError::ReferencedByAssignments { .. }
        | FleetError::DeviceInactive(_)
        | FleetError::DeviceOffline(_) => 409,
        FleetError::ValidationRange { .. }
        | FleetError::ExactlyOneTargetViolation
        | FleetError::PolicyViolation(_)
        | FleetError::InvalidRequest(_) => 422,
        FleetError::LockedOut { .. } => 423,
        FleetError::Storage(_) | FleetError::Transport(_) => 500,
    }
}

/// Body describing what an unlock attempt did.
pub fn outcome_body(outcome: &AttemptOutcome) -> Value {
    match outcome {
        AttemptOutcome::Unlocked => json!({ "result": "unlocked" }),
        AttemptOutcome::Failed {
            consecutive_failures,
            remaining_attempts,
        } => json!({
            "result": "failed",
            "consecutive_failures": consecutive_failures,
            "remaining_attempts": remaining_attempts,
        }),
        AttemptOutcome::LockoutTripped { until } => json!({
            "result": "locked_out",
            "locked_until": until,
        }),
    }
}
