//! Policy definitions and scoped assignments.
//!
//! A [`Policy`] bundles five facets of settings ([`LockSettings`],
//! [`UnlockSettings`], [`PresentationSettings`], [`MonitoringSettings`],
//! [`AgentSettings`]).  It only
//! governs a device once linked to it, directly or through a group, by a
//! [`PolicyAssignment`], or when it is an active global-scope policy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};
use crate::{AssignmentId, DeviceId, GroupId, PolicyId};

/// Descriptive tag of a policy's intended use.  Only `Global` has resolution
/// semantics: active global policies form the lowest precedence tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
    #[default]
    Global,
    Group,
    Device,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSettings {
    /// Idle time before the agent auto-locks. Bounded to 30 s – 24 h.
    pub idle_timeout_seconds: u32,
    pub manual_lock_enabled: bool,
    pub lock_hotkey: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockSettings {
    pub require_password: bool,
    pub allow_alternate_auth: bool,
    /// Consecutive failures before lockout. Bounded to 1 – 10.
    pub max_unlock_attempts: u32,
    /// Bounded to 1 – 1440 minutes.
    pub lockout_duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationSettings {
    pub lock_message: String,
    pub show_clock: bool,
    pub show_company_logo: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringSettings {
    /// Screenshot commands are refused while this is off.
    pub enable_screenshot: bool,
    pub enable_activity_logging: bool,
    /// Bounded to 1 – 365 days.
    pub log_retention_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Bounded to 30 s – 1 h.
    pub heartbeat_interval_seconds: u32,
    pub offline_mode_enabled: bool,
    pub auto_update_enabled: bool,
}

/// All tunable settings of a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PolicySettings {
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub unlock: UnlockSettings,
    #[serde(default)]
    pub presentation: PresentationSettings,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
    #[serde(default)]
    pub agent: AgentSettings,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 300,
            manual_lock_enabled: true,
            lock_hotkey: "Win+Alt+S".to_string(),
        }
    }
}

impl Default for UnlockSettings {
    fn default() -> Self {
        Self {
            require_password: true,
            allow_alternate_auth: false,
            max_unlock_attempts: 3,
            lockout_duration_minutes: 15,
        }
    }
}

impl Default for PresentationSettings {
    fn default() -> Self {
        Self {
            lock_message:
                "This computer is locked. Please contact IT support if you need assistance."
                    .to_string(),
            show_clock: true,
            show_company_logo: true,
        }
    }
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            enable_screenshot: true,
            enable_activity_logging: true,
            log_retention_days: 90,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 60,
            offline_mode_enabled: true,
            auto_update_enabled: true,
        }
    }
}

/// Built-in presets for common deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTemplate {
    Basic,
    HighSecurity,
    Developer,
    Kiosk,
}

impl PolicyTemplate {
    pub const ALL: [PolicyTemplate; 4] = [
        PolicyTemplate::Basic,
        PolicyTemplate::HighSecurity,
        PolicyTemplate::Developer,
        PolicyTemplate::Kiosk,
    ];

    pub fn settings(&self) -> PolicySettings {
        let mut s = PolicySettings::default();
        match self {
            PolicyTemplate::Basic => {}
            PolicyTemplate::HighSecurity => {
                s.lock.idle_timeout_seconds = 120;
                s.unlock.max_unlock_attempts = 3;
                s.unlock.lockout_duration_minutes = 60;
                s.agent.heartbeat_interval_seconds = 30;
                s.agent.offline_mode_enabled = false;
            }
            PolicyTemplate::Developer => {
                s.lock.idle_timeout_seconds = 1800;
                s.unlock.allow_alternate_auth = true;
                s.unlock.max_unlock_attempts = 5;
                s.unlock.lockout_duration_minutes = 5;
                s.agent.heartbeat_interval_seconds = 120;
            }
            PolicyTemplate::Kiosk => {
                s.lock.idle_timeout_seconds = 60;
                s.lock.manual_lock_enabled = false;
                s.unlock.max_unlock_attempts = 2;
                s.unlock.lockout_duration_minutes = 30;
                s.presentation.lock_message = "Kiosk locked. Please ask staff for help.".into();
            }
        }
        s
    }
}

/// A named policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    pub description: String,
    pub scope: PolicyScope,
    pub settings: PolicySettings,
    /// Higher wins within a tier.
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

/// Caller-supplied fields for creating or replacing a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scope: PolicyScope,
    #[serde(default)]
    pub settings: PolicySettings,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl PolicyDraft {
    pub fn new(name: impl Into<String>, scope: PolicyScope, priority: i32) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            scope,
            settings: PolicySettings::default(),
            priority,
            is_active: true,
        }
    }

    pub fn from_template(name: impl Into<String>, template: PolicyTemplate) -> Self {
        Self {
            settings: template.settings(),
            ..Self::new(name, PolicyScope::Global, 0)
        }
    }

    pub fn with_settings(mut self, settings: PolicySettings) -> Self {
        self.settings = settings;
        self
    }
}

/// The single target of an assignment.  Having exactly one target is
/// guaranteed by construction; wire input goes through [`AssignmentTarget::from_parts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum AssignmentTarget {
    Device(DeviceId),
    Group(GroupId),
}

impl AssignmentTarget {
    /// Build a target from the optional device/group pair of a request.
    ///
    /// Returns [`FleetError::ExactlyOneTargetViolation`] when both or neither
    /// are set.
    pub fn from_parts(device: Option<DeviceId>, group: Option<GroupId>) -> FleetResult<Self> {
        match (device, group) {
            (Some(d), None) => Ok(AssignmentTarget::Device(d)),
            (None, Some(g)) => Ok(AssignmentTarget::Group(g)),
            _ => Err(FleetError::ExactlyOneTargetViolation),
        }
    }
}

impl fmt::Display for AssignmentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignmentTarget::Device(id) => write!(f, "device {id}"),
            AssignmentTarget::Group(id) => write!(f, "group {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAssignment {
    pub id: AssignmentId,
    pub policy_id: PolicyId,
    pub target: AssignmentTarget,
    pub assigned_at: DateTime<Utc>,
    pub assigned_by: Option<String>,
    pub is_active: bool,
}
