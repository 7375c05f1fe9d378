//! Device actions (commands) and their lifecycle.
//!
//! ```text
//! pending ──► sent ──► acknowledged ──► completed
//!    │          │            │
//!    └──────────┴────────────┴──► failed | timeout
//! ```
//!
//! `completed`, `failed` and `timeout` are terminal.  Re-marking a `sent`
//! action as `sent` is an idempotent re-delivery, not a transition.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ActionId, DeviceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Lock,
    Unlock,
    Screenshot,
    Restart,
}

impl ActionType {
    pub const ALL: [ActionType; 4] = [
        ActionType::Lock,
        ActionType::Unlock,
        ActionType::Screenshot,
        ActionType::Restart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Lock => "lock",
            ActionType::Unlock => "unlock",
            ActionType::Screenshot => "screenshot",
            ActionType::Restart => "restart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lock" => Some(ActionType::Lock),
            "unlock" => Some(ActionType::Unlock),
            "screenshot" => Some(ActionType::Screenshot),
            "restart" => Some(ActionType::Restart),
            _ => None,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Sent,
    Acknowledged,
    Completed,
    Failed,
    Timeout,
}

impl ActionStatus {
    /// States the timeout sweep may act on.
    pub const IN_FLIGHT: [ActionStatus; 3] = [
        ActionStatus::Pending,
        ActionStatus::Sent,
        ActionStatus::Acknowledged,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Timeout
        )
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Pending, Timeout)
                | (Sent, Acknowledged)
                | (Sent, Failed)
                | (Sent, Timeout)
                | (Acknowledged, Completed)
                | (Acknowledged, Failed)
                | (Acknowledged, Timeout)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Sent => "sent",
            ActionStatus::Acknowledged => "acknowledged",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ActionStatus::Pending),
            "sent" => Some(ActionStatus::Sent),
            "acknowledged" => Some(ActionStatus::Acknowledged),
            "completed" => Some(ActionStatus::Completed),
            "failed" => Some(ActionStatus::Failed),
            "timeout" => Some(ActionStatus::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a lock was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "trigger")]
pub enum LockTrigger {
    /// Operator-issued lock.
    #[default]
    Admin,
    /// Agent-originated lock after the user was idle for `idle_seconds`.
    IdleTimeout { idle_seconds: u32 },
    /// Agent-originated lock from the user pressing the lock hotkey.
    Hotkey,
}

/// Known metadata shape for each action type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ActionDetails {
    Lock {
        #[serde(flatten)]
        trigger: LockTrigger,
    },
    Unlock {
        /// Attempts reported against this action so far.
        #[serde(default)]
        attempts: u32,
    },
    Screenshot {
        /// Reference to the stored capture, once the agent has uploaded it.
        #[serde(default)]
        capture_ref: Option<String>,
    },
    Restart {
        #[serde(default)]
        force: bool,
    },
}

impl ActionDetails {
    /// Default details for an action type.
    pub fn for_type(action_type: ActionType) -> Self {
        match action_type {
            ActionType::Lock => ActionDetails::Lock {
                trigger: LockTrigger::Admin,
            },
            ActionType::Unlock => ActionDetails::Unlock { attempts: 0 },
            ActionType::Screenshot => ActionDetails::Screenshot { capture_ref: None },
            ActionType::Restart => ActionDetails::Restart { force: false },
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            ActionDetails::Lock { .. } => ActionType::Lock,
            ActionDetails::Unlock { .. } => ActionType::Unlock,
            ActionDetails::Screenshot { .. } => ActionType::Screenshot,
            ActionDetails::Restart { .. } => ActionType::Restart,
        }
    }
}

/// Typed per-action metadata with an opaque map for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub details: ActionDetails,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ActionMetadata {
    pub fn new(details: ActionDetails) -> Self {
        Self {
            details,
            extra: BTreeMap::new(),
        }
    }

    pub fn for_type(action_type: ActionType) -> Self {
        Self::new(ActionDetails::for_type(action_type))
    }
}

/// A command issued to one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAction {
    pub id: ActionId,
    pub device_id: DeviceId,
    pub action_type: ActionType,
    pub status: ActionStatus,
    /// Actor that requested the action; `None` when system-originated.
    pub initiator: Option<String>,
    pub reason: String,
    pub metadata: ActionMetadata,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// How many times the command was handed to a transport.
    pub delivery_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl DeviceAction {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
