//! `fleetlock-kernel` – Rules & Enforcement
//!
//! Everything in here is pure decision logic: no I/O, no storage, and every
//! time-dependent call takes `now` explicitly.
//!
//! # Modules
//!
//! - [`capability_manager`] – [`CapabilityManager`][capability_manager::CapabilityManager]:
//!   the role → capability table consulted before any action or policy edit.
//! - [`presence`] – the fixed five-minute online rule, status derivation, and
//!   [`PresenceTracker`][presence::PresenceTracker], which turns heartbeat
//!   recency into online/offline transitions.
//! - [`policy_validator`] – [`PolicyValidator`][policy_validator::PolicyValidator]:
//!   a rule engine enforcing the numeric bounds of policy settings.
//! - [`lockout_guard`] – [`LockoutGuard`][lockout_guard::LockoutGuard]:
//!   per-device consecutive unlock-failure counting and temporary lockout.
//! - [`action_gate`] – [`ActionGate`][action_gate::ActionGate]:
//!   the single check every action request passes through, combining
//!   capability authorization with policy-derived lock legitimacy.

pub mod action_gate;
pub mod capability_manager;
pub mod lockout_guard;
pub mod policy_validator;
pub mod presence;

pub use action_gate::ActionGate;
pub use capability_manager::CapabilityManager;
pub use lockout_guard::{AttemptOutcome, LockoutGuard, LockoutLimits, LockoutState};
pub use policy_validator::{HotkeyRule, PolicyValidator, RangeRule, Rule};
pub use presence::{ONLINE_THRESHOLD_SECONDS, PresenceTracker, PresenceTransition};
