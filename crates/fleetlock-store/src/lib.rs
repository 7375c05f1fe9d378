//! `fleetlock-store` – State.
//!
//! Holds everything the control plane knows about the fleet.  Devices,
//! groups and policies live in memory behind reader/writer locks; device
//! actions are persisted to a local SQLite substrate so the command history
//! survives restarts.
//!
//! # Modules
//!
//! - [`device_registry`] – [`DeviceRegistry`][device_registry::DeviceRegistry]:
//!   device identity, heartbeat ingestion, groups and the explicit membership
//!   index.
//! - [`policy_store`] – [`PolicyStore`][policy_store::PolicyStore]: policy and
//!   assignment CRUD with bounds validation and assignment invariants.
//! - [`policy_resolver`] – [`resolve`][policy_resolver::resolve]: the pure
//!   device → effective policy computation over a
//!   [`PolicySnapshot`][policy_store::PolicySnapshot].
//! - [`action_ledger`] – [`ActionLedger`][action_ledger::ActionLedger]:
//!   SQLite-backed [`DeviceAction`][fleetlock_types::DeviceAction] rows with
//!   compare-and-swap status updates.

pub mod action_ledger;
pub mod device_registry;
pub mod policy_resolver;
pub mod policy_store;

pub use action_ledger::{ActionLedger, LedgerError};
pub use device_registry::{DeviceRegistry, FleetStats, HeartbeatReceipt};
pub use policy_resolver::{AppliedPolicy, Resolution, Tier, resolve};
pub use policy_store::{PolicySnapshot, PolicyStore};
