//! `fleetlock-types` – the shared vocabulary of the fleet control plane.
//!
//! Every other crate speaks in these types: device and group records, policy
//! definitions and their scoped assignments, device actions (commands) and
//! their lifecycle states, the role/capability model, the structured events
//! emitted to audit collaborators, and the [`FleetError`] taxonomy.
//!
//! # Modules
//!
//! - [`device`] – [`Device`], [`DeviceGroup`], [`Heartbeat`] and presence.
//! - [`policy`] – [`Policy`], the four setting facets, [`PolicyAssignment`].
//! - [`action`] – [`DeviceAction`], [`ActionType`], [`ActionStatus`] and the
//!   per-type [`ActionDetails`] union.
//! - [`access`] – [`Role`], [`Capability`] and the request [`Actor`].
//! - [`event`] – [`Event`] records for presence, action and lockout changes.
//! - [`error`] – [`FleetError`].
//! - [`clock`] – injectable time source.

pub mod access;
pub mod action;
pub mod clock;
pub mod device;
pub mod error;
pub mod event;
pub mod policy;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use access::{Actor, Capability, Role};
pub use action::{ActionDetails, ActionMetadata, ActionStatus, ActionType, DeviceAction, LockTrigger};
pub use clock::{Clock, ManualClock, SystemClock};
pub use device::{
    Device, DeviceGroup, DeviceIdentity, DeviceMetrics, DeviceProfile, DeviceStatus, Heartbeat,
    Presence,
};
pub use error::{EntityKind, FleetError, FleetResult};
pub use event::{Event, EventPayload, PolicyChange, Severity};
pub use policy::{
    AgentSettings, AssignmentTarget, LockSettings, MonitoringSettings, Policy, PolicyAssignment,
    PolicyDraft, PolicyScope, PolicySettings, PolicyTemplate, PresentationSettings,
    UnlockSettings,
};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_type!(
    /// Stable opaque identifier of a managed device.
    DeviceId
);
id_type!(
    /// Identifier of a [`DeviceGroup`].
    GroupId
);
id_type!(
    /// Identifier of a [`Policy`].
    PolicyId
);
id_type!(
    /// Identifier of a [`PolicyAssignment`].
    AssignmentId
);
id_type!(
    /// Identifier of a [`DeviceAction`].
    ActionId
);
