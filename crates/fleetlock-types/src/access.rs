//! Roles, capabilities and the actor context passed into every operation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DeviceId;
use crate::action::ActionType;

/// Operator roles.  What each may do is decided by the capability table in
/// `fleetlock-kernel`, never by the role itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Superadmin,
    Security,
    ItAdmin,
    Auditor,
    UnlockUser,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Superadmin,
        Role::Security,
        Role::ItAdmin,
        Role::Auditor,
        Role::UnlockUser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Superadmin => "superadmin",
            Role::Security => "security",
            Role::ItAdmin => "it_admin",
            Role::Auditor => "auditor",
            Role::UnlockUser => "unlock_user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A permitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    LockDevice,
    UnlockDevice,
    CaptureScreenshot,
    RestartDevice,
    ManageDevices,
    ManagePolicies,
    ViewPolicies,
}

impl Capability {
    /// Capability required to issue an action of `action_type`.
    pub fn for_action(action_type: ActionType) -> Self {
        match action_type {
            ActionType::Lock => Capability::LockDevice,
            ActionType::Unlock => Capability::UnlockDevice,
            ActionType::Screenshot => Capability::CaptureScreenshot,
            ActionType::Restart => Capability::RestartDevice,
        }
    }
}

/// Who is making a request.  Authentication happens upstream; the core only
/// sees the resulting identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Actor {
    /// An authenticated operator.
    User { id: String, role: Role },
    /// A managed device acting on its own behalf (e.g. idle auto-lock).
    Device { device_id: DeviceId },
    /// Internal background work.
    System,
}

impl Actor {
    pub fn user(id: impl Into<String>, role: Role) -> Self {
        Actor::User {
            id: id.into(),
            role,
        }
    }

    /// Identity recorded as an action initiator or event actor.
    pub fn id(&self) -> Option<String> {
        match self {
            Actor::User { id, .. } => Some(id.clone()),
            Actor::Device { device_id } => Some(format!("device:{device_id}")),
            Actor::System => None,
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            Actor::User { role, .. } => Some(*role),
            _ => None,
        }
    }

    /// True for requests that did not come from an operator.
    pub fn is_system_originated(&self) -> bool {
        !matches!(self, Actor::User { .. })
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User { id, role } => write!(f, "{id} ({role})"),
            Actor::Device { device_id } => write!(f, "device {device_id}"),
            Actor::System => f.write_str("system"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_roundtrip() {
        let actor = Actor::user("alice", Role::ItAdmin);
        let json = serde_json::to_string(&actor).unwrap();
        assert!(json.contains(r#""kind":"user""#));
        assert!(json.contains(r#""role":"it_admin""#));
        let back: Actor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, actor);
    }

    #[test]
    fn only_users_are_operator_originated() {
        assert!(!Actor::user("bob", Role::Security).is_system_originated());
        assert!(Actor::System.is_system_originated());
        assert!(
            Actor::Device {
                device_id: DeviceId::new()
            }
            .is_system_originated()
        );
    }

    #[test]
    fn system_actor_has_no_id() {
        assert_eq!(Actor::System.id(), None);
        assert_eq!(Actor::user("carol", Role::Auditor).id().as_deref(), Some("carol"));
    }
}
