//! `fleetlock-runtime` – the control plane in motion.
//!
//! Ties the stores and rules together into the services `fleetlockd` runs.
//!
//! # Modules
//!
//! - [`dispatcher`] – [`ActionDispatcher`]: creates commands, moves them
//!   through `pending → sent → acknowledged → completed | failed | timeout`,
//!   applies lockout rules to unlocks and times out stale commands.
//! - [`control_plane`] – [`ControlPlane`]: the facade agents and operators
//!   talk to (registration, heartbeats, policy and group administration,
//!   policy resolution, action requests and outcome reports).
//! - [`courier`] – [`Courier`]: pushes new commands through a
//!   [`CommandTransport`][fleetlock_middleware::CommandTransport].
//! - [`sweeper`] – [`Sweeper`]: the recurring timeout and presence pass.
//! - [`telemetry`] – [`init_tracing`]: `tracing` subscriber with optional
//!   OTLP span export.

pub mod control_plane;
pub mod courier;
pub mod dispatcher;
pub mod sweeper;
pub mod telemetry;

pub use control_plane::{ControlPlane, DeviceView, HeartbeatAck, SweepReport};
pub use courier::Courier;
pub use dispatcher::{
    ActionDispatcher, ActionRequest, ActionTimeouts, DispatchConfig, UnlockAttempt,
};
pub use sweeper::{Sweeper, SweeperHandle};
pub use telemetry::{TracerProviderGuard, init_tracing};
