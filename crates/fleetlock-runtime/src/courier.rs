//! [`Courier`] – pushes commands through a [`CommandTransport`].
//!
//! An action is marked `sent` *before* the push so that an agent answering
//! immediately always finds it in a state that accepts the acknowledgement.
//! If the push then fails the action simply stays `sent`; the next heartbeat
//! hands it over again.  Devices without a live connection are skipped and
//! pick their commands up from the heartbeat response.

use std::sync::Arc;

use fleetlock_middleware::CommandTransport;
use fleetlock_types::{Actor, DeviceAction, DeviceId, FleetResult};
use tracing::{debug, warn};

use crate::control_plane::ControlPlane;
use crate::dispatcher::ActionRequest;

pub struct Courier {
    plane: Arc<ControlPlane>,
    transport: Arc<dyn CommandTransport>,
}

impl Courier {
    pub fn new(plane: Arc<ControlPlane>, transport: Arc<dyn CommandTransport>) -> Self {
        Self { plane, transport }
    }

    pub fn plane(&self) -> &Arc<ControlPlane> {
        &self.plane
    }

    /// Create an action and push it to its device right away.
    pub async fn submit(&self, actor: &Actor, request: ActionRequest) -> FleetResult<DeviceAction> {
        let action = self.plane.request_action(actor, request)?;
        Ok(self.deliver(action).await)
    }

    /// Push one action; returns it as it stands afterwards.
    pub async fn deliver(&self, action: DeviceAction) -> DeviceAction {
        if !self.transport.is_connected(&action.device_id) {
            debug!(action_id = %action.id, device_id = %action.device_id, "device not connected; waiting for heartbeat");
            return action;
        }
        let sent = match self.plane.dispatcher().mark_sent(&action.id) {
            Ok(sent) => sent,
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "could not mark action sent");
                return action;
            }
        };
        if let Err(e) = self.transport.deliver(&sent).await {
            warn!(action_id = %sent.id, device_id = %sent.device_id, error = %e, "command push failed");
        }
        sent
    }

    /// Push everything the device has not acknowledged, e.g. after it
    /// reconnects.
    pub async fn redeliver(&self, device_id: &DeviceId) -> FleetResult<Vec<DeviceAction>> {
        let outstanding = self.plane.dispatcher().outstanding_for_device(device_id)?;
        let mut delivered = Vec::with_capacity(outstanding.len());
        for action in outstanding {
            delivered.push(self.deliver(action).await);
        }
        Ok(delivered)
    }
}
