//! Live agent connections, keyed by the device each one is bound to.
//!
//! [`SessionRegistry`] is the gateway's [`CommandTransport`]: pushing a
//! command means queueing a [`ServerFrame::Command`] on the connection's
//! bounded outbound channel, which the connection task drains into its
//! socket.  A full queue fails the delivery; the command stays `sent` and
//! goes out again with the next heartbeat.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use fleetlock_middleware::CommandTransport;
use fleetlock_types::{DeviceAction, DeviceId, FleetError, FleetResult};
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::ServerFrame;

/// Opaque id of one WebSocket connection.
pub type ConnectionId = Uuid;

struct Binding {
    conn: ConnectionId,
    outbound: Sender<ServerFrame>,
}

#[derive(Default)]
pub struct SessionRegistry {
    bound: Mutex<HashMap<DeviceId, Binding>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bound(&self) -> MutexGuard<'_, HashMap<DeviceId, Binding>> {
        self.bound.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind `device_id` to a connection.  A newer connection for the same
    /// device replaces the older one.
    pub fn bind(
        &self,
        device_id: DeviceId,
        conn: ConnectionId,
        outbound: Sender<ServerFrame>,
    ) {
        if let Some(old) = self.bound().insert(device_id, Binding { conn, outbound }) {
            if old.conn != conn {
                debug!(%device_id, old = %old.conn, new = %conn, "agent reconnected; replacing session");
            }
        }
    }

    /// Drop the binding, but only if it still belongs to `conn`.
    pub fn unbind(&self, device_id: &DeviceId, conn: ConnectionId) -> bool {
        let mut bound = self.bound();
        match bound.get(device_id) {
            Some(binding) if binding.conn == conn => {
                bound.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub fn connected(&self) -> usize {
        self.bound().len()
    }
}

#[async_trait]
impl CommandTransport for SessionRegistry {
    async fn deliver(&self, action: &DeviceAction) -> FleetResult<()> {
        let outbound = self
            .bound()
            .get(&action.device_id)
            .map(|b| b.outbound.clone())
            .ok_or_else(|| {
                FleetError::Transport(format!("no session for device {}", action.device_id))
            })?;
        let command = ServerFrame::Command {
            action: action.clone(),
        };
        outbound.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => {
                FleetError::Transport(format!("outbound queue full for {}", action.device_id))
            }
            TrySendError::Closed(_) => {
                FleetError::Transport(format!("session for {} closed", action.device_id))
            }
        })
    }

    fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.bound()
            .get(device_id)
            .is_some_and(|b| !b.outbound.is_closed())
    }
}
