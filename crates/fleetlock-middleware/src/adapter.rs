//! The command transport seam.
//!
//! The control plane never talks to agents directly.  When an action is
//! ready to go out, the runtime hands it to a [`CommandTransport`], which
//! translates it into whatever the agent connection speaks (a WebSocket frame
//! in `fleetlock-gateway`).
//!
//! Delivery is at-least-once: the same action may be handed over again (on
//! reconnect, or in a heartbeat response), so agents must treat the action id
//! as an idempotency key.

use async_trait::async_trait;
use fleetlock_types::{DeviceAction, DeviceId, FleetResult};

#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Push `action` towards its device.
    ///
    /// `Ok(())` means the transport accepted the command; it says nothing
    /// about the agent having executed it.  Return
    /// [`FleetError::Transport`][fleetlock_types::FleetError::Transport] when
    /// the device has no live connection; the action then waits for the next
    /// heartbeat to be picked up.
    async fn deliver(&self, action: &DeviceAction) -> FleetResult<()>;

    /// Whether the transport currently has a live path to `device_id`.
    fn is_connected(&self, device_id: &DeviceId) -> bool;
}
