//! `fleetlock-middleware` – The Wiring
//!
//! Moves events and commands between the control plane and the outside world
//! without caring what they mean.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe [`EventBus`] built on Tokio
//!   broadcast channels; the outlet for audit and notification collaborators.
//! - [`adapter`] – the [`CommandTransport`] trait through which device
//!   commands reach agents.

pub mod adapter;
pub mod bus;

pub use adapter::CommandTransport;
pub use bus::{EventBus, Topic, TopicReceiver};
