//! `fleetlock-gateway` – the network edge of `fleetlockd`.
//!
//! A single port carries both audiences:
//!
//! - **Agents** open a WebSocket, `register` (or say `hello` with a known
//!   device id), send heartbeats, report command outcomes and lock-screen
//!   unlock attempts.  Commands are pushed down the same socket as soon as
//!   they are created.
//! - **Operator tooling** sends administrative requests carrying an `actor`
//!   and may `subscribe` to event topics.
//!
//! A plain HTTP `GET` answers with a JSON health summary.
//!
//! # Modules
//!
//! - [`protocol`] – request and server frames, error status codes.
//! - [`gateway`] – [`Gateway`]: maps frames onto the
//!   [`ControlPlane`](fleetlock_runtime::ControlPlane).
//! - [`sessions`] – [`SessionRegistry`]: live agent sockets, used as the
//!   command transport.
//! - [`server`] – [`GatewayServer`]: the TCP accept loop.

pub mod gateway;
pub mod protocol;
pub mod server;
pub mod sessions;

pub use gateway::{Gateway, OUTBOUND_CAPACITY, Session};
pub use protocol::{Request, RequestFrame, ServerFrame, status_code};
pub use server::{DEFAULT_PORT, GatewayServer};
pub use sessions::SessionRegistry;
