//! [`ControlPlane`] – the single entry point for agents and operators.
//!
//! Owns the Device Registry, the Policy Store and the [`ActionDispatcher`],
//! checks capabilities for administrative calls, tracks presence flips and
//! publishes everything that changes onto the [`EventBus`].
//!
//! Nothing here blocks on I/O except the action ledger's SQLite writes, and
//! no lock is held across an `await` (the facade is entirely synchronous;
//! command delivery lives in [`Courier`](crate::courier::Courier)).

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use fleetlock_kernel::AttemptOutcome;
use fleetlock_kernel::presence::{self, PresenceTracker, PresenceTransition};
use fleetlock_middleware::EventBus;
use fleetlock_store::{
    ActionLedger, DeviceRegistry, FleetStats, PolicyStore, Resolution, resolve,
};
use fleetlock_types::{
    ActionId, ActionStatus, ActionType, Actor, AgentSettings, AssignmentId, AssignmentTarget,
    Capability, Clock, Device, DeviceAction, DeviceGroup, DeviceId, DeviceIdentity,
    DeviceProfile, DeviceStatus, EntityKind, Event, EventPayload, FleetError, FleetResult,
    GroupId, Heartbeat, Policy, PolicyAssignment, PolicyChange, PolicyDraft, PolicyId,
    PolicyTemplate, Presence, SystemClock,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dispatcher::{ActionDispatcher, ActionRequest, DispatchConfig, UnlockAttempt};

// ─────────────────────────────────────────────────────────────────────────────
// Views
// ─────────────────────────────────────────────────────────────────────────────

/// A device as operators see it: the stored record plus the status derived
/// at query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: Device,
    pub status: DeviceStatus,
    pub presence: Presence,
    pub groups: Vec<GroupId>,
}

/// Reply to an agent heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub device_id: DeviceId,
    /// `false` when the heartbeat was stale and ignored.
    pub applied: bool,
    pub status: DeviceStatus,
    /// Commands the agent has not acknowledged yet, already marked `sent`.
    pub commands: Vec<DeviceAction>,
    /// Agent settings of the effective policy, or the defaults.
    pub agent: AgentSettings,
}

/// What one sweep pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub timed_out: Vec<DeviceAction>,
    pub presence: Vec<PresenceTransition>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ControlPlane
// ─────────────────────────────────────────────────────────────────────────────

pub struct ControlPlane {
    registry: Arc<DeviceRegistry>,
    policies: Arc<PolicyStore>,
    dispatcher: ActionDispatcher,
    presence: Mutex<PresenceTracker>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl ControlPlane {
    pub fn new(
        ledger: ActionLedger,
        config: DispatchConfig,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let policies = Arc::new(PolicyStore::new());
        let dispatcher = ActionDispatcher::new(
            ledger,
            Arc::clone(&registry),
            Arc::clone(&policies),
            bus.clone(),
            Arc::clone(&clock),
            config,
        );
        Self {
            registry,
            policies,
            dispatcher,
            presence: Mutex::new(PresenceTracker::new()),
            bus,
            clock,
        }
    }

    /// A control plane with an in-memory ledger, default settings and the
    /// system clock.
    pub fn in_memory() -> FleetResult<Self> {
        Ok(Self::new(
            ActionLedger::open_in_memory()?,
            DispatchConfig::default(),
            EventBus::default(),
            Arc::new(SystemClock),
        ))
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn tracker(&self) -> MutexGuard<'_, PresenceTracker> {
        self.presence.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: Event) {
        self.bus.emit(event);
    }

    // ── Devices ──────────────────────────────────────────────────────────────

    /// Enrol a new device.  Agents call this before their first heartbeat.
    pub fn register_device(
        &self,
        identity: &DeviceIdentity,
        profile: DeviceProfile,
    ) -> FleetResult<Device> {
        let now = self.clock.now();
        let device = self.registry.register(identity, profile, now)?;
        self.emit(
            Event::new(
                now,
                EventPayload::DeviceRegistered {
                    hostname: device.hostname.clone(),
                },
            )
            .for_device(device.id),
        );
        Ok(device)
    }

    /// Soft-delete a device; its history stays and its identity may register
    /// again.
    pub fn deactivate_device(&self, actor: &Actor, id: &DeviceId) -> FleetResult<Device> {
        self.dispatcher.authorize(actor, Capability::ManageDevices)?;
        let device = self.registry.deactivate(id)?;
        self.tracker().forget(id);
        info!(device_id = %id, actor = %actor, "device deactivated");
        self.emit(
            Event::new(self.clock.now(), EventPayload::DeviceDeactivated)
                .for_device(*id)
                .by(actor),
        );
        Ok(device)
    }

    /// Ingest a heartbeat and hand back the commands still waiting for the
    /// device.
    ///
    /// Waiting commands are (re-)marked `sent`; the agent deduplicates by
    /// action id.
    pub fn heartbeat(&self, heartbeat: &Heartbeat) -> FleetResult<HeartbeatAck> {
        let now = self.clock.now();
        let receipt = self.registry.record_heartbeat(heartbeat, now)?;
        let device = receipt.device;

        let flip = self.tracker().observe(device.id, device.last_seen, now);
        if let Some(flip) = flip {
            self.announce_presence(&flip, now);
        }

        let mut commands = Vec::new();
        for action in self.dispatcher.outstanding_for_device(&device.id)? {
            match self.dispatcher.mark_sent(&action.id) {
                Ok(sent) => commands.push(sent),
                // Timed out or failed between the query and the update.
                Err(FleetError::InvalidTransition { .. }) => {
                    debug!(action_id = %action.id, "outstanding action moved on; skipped");
                }
                Err(e) => return Err(e),
            }
        }

        let agent = self
            .dispatcher
            .effective_policy(&device)
            .map(|p| p.settings.agent)
            .unwrap_or_default();

        Ok(HeartbeatAck {
            device_id: device.id,
            applied: receipt.applied,
            status: presence::derive_status(&device, now),
            commands,
            agent,
        })
    }

    pub fn device(&self, id: &DeviceId) -> FleetResult<DeviceView> {
        let device = self.registry.get(id)?;
        Ok(self.view(device, self.clock.now()))
    }

    pub fn list_devices(&self, include_inactive: bool) -> Vec<DeviceView> {
        let now = self.clock.now();
        self.registry
            .list(include_inactive)
            .into_iter()
            .map(|d| self.view(d, now))
            .collect()
    }

    fn view(&self, device: Device, now: DateTime<Utc>) -> DeviceView {
        DeviceView {
            status: presence::derive_status(&device, now),
            presence: presence::presence_of(&device, now),
            groups: self.registry.groups_of(&device.id),
            device,
        }
    }

    pub fn is_online(&self, id: &DeviceId) -> FleetResult<bool> {
        let device = self.registry.get(id)?;
        Ok(presence::is_online(device.last_seen, self.clock.now()))
    }

    /// Active devices last seen in `[from, to)`.
    pub fn devices_last_seen_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Device> {
        self.registry.last_seen_between(from, to)
    }

    pub fn stats(&self) -> FleetStats {
        self.registry.stats(self.clock.now())
    }

    // ── Groups ───────────────────────────────────────────────────────────────

    pub fn create_group(
        &self,
        actor: &Actor,
        name: &str,
        description: &str,
    ) -> FleetResult<DeviceGroup> {
        self.dispatcher.authorize(actor, Capability::ManageDevices)?;
        self.registry
            .create_group(name, description, actor.id(), self.clock.now())
    }

    pub fn rename_group(
        &self,
        actor: &Actor,
        id: &GroupId,
        name: &str,
        description: Option<&str>,
    ) -> FleetResult<DeviceGroup> {
        self.dispatcher.authorize(actor, Capability::ManageDevices)?;
        self.registry.rename_group(id, name, description)
    }

    /// Delete a group no active assignment targets.
    pub fn delete_group(&self, actor: &Actor, id: &GroupId) -> FleetResult<DeviceGroup> {
        self.dispatcher.authorize(actor, Capability::ManageDevices)?;
        self.registry.get_group(id)?;
        let count = self.policies.active_assignments_for_group(id);
        if count > 0 {
            return Err(FleetError::ReferencedByAssignments {
                kind: EntityKind::Group,
                id: id.to_string(),
                count,
            });
        }
        self.registry.delete_group(id)
    }

    pub fn list_groups(&self) -> Vec<DeviceGroup> {
        self.registry.list_groups()
    }

    pub fn add_to_group(&self, actor: &Actor, group: &GroupId, device: &DeviceId) -> FleetResult<bool> {
        self.dispatcher.authorize(actor, Capability::ManageDevices)?;
        self.registry.add_member(group, device)
    }

    pub fn remove_from_group(
        &self,
        actor: &Actor,
        group: &GroupId,
        device: &DeviceId,
    ) -> FleetResult<bool> {
        self.dispatcher.authorize(actor, Capability::ManageDevices)?;
        self.registry.remove_member(group, device)
    }

    // ── Policies ─────────────────────────────────────────────────────────────

    pub fn create_policy(&self, actor: &Actor, draft: PolicyDraft) -> FleetResult<Policy> {
        self.dispatcher.authorize(actor, Capability::ManagePolicies)?;
        let policy = self
            .policies
            .create_policy(draft, actor.id(), self.clock.now())?;
        self.policy_changed(actor, policy.id, PolicyChange::Created);
        Ok(policy)
    }

    /// Create a policy from a built-in preset.
    pub fn create_policy_from_template(
        &self,
        actor: &Actor,
        name: &str,
        template: PolicyTemplate,
    ) -> FleetResult<Policy> {
        self.create_policy(actor, PolicyDraft::from_template(name, template))
    }

    pub fn update_policy(
        &self,
        actor: &Actor,
        id: &PolicyId,
        draft: PolicyDraft,
    ) -> FleetResult<Policy> {
        self.dispatcher.authorize(actor, Capability::ManagePolicies)?;
        let policy = self.policies.update_policy(id, draft, self.clock.now())?;
        self.policy_changed(actor, policy.id, PolicyChange::Updated);
        Ok(policy)
    }

    pub fn delete_policy(&self, actor: &Actor, id: &PolicyId) -> FleetResult<Policy> {
        self.dispatcher.authorize(actor, Capability::ManagePolicies)?;
        let policy = self.policies.delete_policy(id)?;
        self.policy_changed(actor, policy.id, PolicyChange::Deleted);
        Ok(policy)
    }

    pub fn get_policy(&self, actor: &Actor, id: &PolicyId) -> FleetResult<Policy> {
        self.dispatcher.authorize(actor, Capability::ViewPolicies)?;
        self.policies.get_policy(id)
    }

    pub fn list_policies(&self, actor: &Actor) -> FleetResult<Vec<Policy>> {
        self.dispatcher.authorize(actor, Capability::ViewPolicies)?;
        Ok(self.policies.list_policies())
    }

    /// Assign a policy to a device or a group.  The target must exist.
    pub fn assign_policy(
        &self,
        actor: &Actor,
        policy_id: &PolicyId,
        target: AssignmentTarget,
    ) -> FleetResult<PolicyAssignment> {
        self.dispatcher.authorize(actor, Capability::ManagePolicies)?;
        match target {
            AssignmentTarget::Device(id) => {
                self.registry.get_active(&id)?;
            }
            AssignmentTarget::Group(id) => {
                self.registry.get_group(&id)?;
            }
        }
        let assignment = self
            .policies
            .assign(policy_id, target, actor.id(), self.clock.now())?;
        self.policy_changed(actor, *policy_id, PolicyChange::Assigned);
        Ok(assignment)
    }

    /// Turn an assignment off (or back on) without deleting it.
    pub fn set_assignment_active(
        &self,
        actor: &Actor,
        id: &AssignmentId,
        active: bool,
    ) -> FleetResult<PolicyAssignment> {
        self.dispatcher.authorize(actor, Capability::ManagePolicies)?;
        let assignment = self
            .policies
            .set_assignment_active(id, active, self.clock.now())?;
        let change = if active {
            PolicyChange::Assigned
        } else {
            PolicyChange::Unassigned
        };
        self.policy_changed(actor, assignment.policy_id, change);
        Ok(assignment)
    }

    pub fn delete_assignment(
        &self,
        actor: &Actor,
        id: &AssignmentId,
    ) -> FleetResult<PolicyAssignment> {
        self.dispatcher.authorize(actor, Capability::ManagePolicies)?;
        let assignment = self.policies.delete_assignment(id)?;
        if assignment.is_active {
            self.policy_changed(actor, assignment.policy_id, PolicyChange::Unassigned);
        }
        Ok(assignment)
    }

    fn policy_changed(&self, actor: &Actor, policy_id: PolicyId, change: PolicyChange) {
        self.emit(
            Event::new(
                self.clock.now(),
                EventPayload::PolicyChanged { policy_id, change },
            )
            .by(actor),
        );
    }

    /// Effective policy of a device plus the ordered candidates behind it.
    ///
    /// Operators need `view_policies`; a device may resolve its own policy.
    pub fn resolve_policy(&self, actor: &Actor, device_id: &DeviceId) -> FleetResult<Resolution> {
        match actor {
            Actor::Device { device_id: origin } if origin == device_id => {}
            _ => self.dispatcher.authorize(actor, Capability::ViewPolicies)?,
        }
        let device = self.registry.get(device_id)?;
        let groups = self.registry.groups_of(device_id);
        Ok(resolve(&self.policies.snapshot(), &device, &groups))
    }

    // ── Actions ──────────────────────────────────────────────────────────────

    pub fn request_action(&self, actor: &Actor, request: ActionRequest) -> FleetResult<DeviceAction> {
        self.dispatcher.create(actor, request)
    }

    pub fn acknowledge(&self, actor: &Actor, id: &ActionId) -> FleetResult<DeviceAction> {
        self.ensure_reporter(actor, id)?;
        self.dispatcher.mark_acknowledged(id)
    }

    pub fn complete(
        &self,
        actor: &Actor,
        id: &ActionId,
        result: Option<serde_json::Value>,
    ) -> FleetResult<DeviceAction> {
        self.ensure_reporter(actor, id)?;
        self.dispatcher.mark_completed(id, result)
    }

    pub fn fail(&self, actor: &Actor, id: &ActionId, error: &str) -> FleetResult<DeviceAction> {
        self.ensure_reporter(actor, id)?;
        self.dispatcher.mark_failed(id, error)
    }

    pub fn unlock_attempt(
        &self,
        actor: &Actor,
        id: &ActionId,
        success: bool,
    ) -> FleetResult<UnlockAttempt> {
        self.ensure_reporter(actor, id)?;
        self.dispatcher.record_unlock_attempt(id, success)
    }

    /// An unlock attempt typed at the device's lock screen.  Feeds the
    /// lockout guard exactly like attempts on `unlock` actions.
    pub fn report_unlock_attempt(
        &self,
        actor: &Actor,
        device_id: &DeviceId,
        success: bool,
    ) -> FleetResult<AttemptOutcome> {
        self.dispatcher
            .record_device_unlock_attempt(actor, device_id, success)
    }

    /// Outcomes are reported by the target device itself or by internal
    /// components.
    fn ensure_reporter(&self, actor: &Actor, id: &ActionId) -> FleetResult<()> {
        let action = self.dispatcher.get(id)?;
        match actor {
            Actor::System => Ok(()),
            Actor::Device { device_id } if *device_id == action.device_id => Ok(()),
            _ => Err(FleetError::Forbidden {
                actor: actor.to_string(),
                capability: Capability::for_action(action.action_type),
            }),
        }
    }

    pub fn action(&self, id: &ActionId) -> FleetResult<DeviceAction> {
        self.dispatcher.get(id)
    }

    pub fn actions_for_device(&self, id: &DeviceId) -> FleetResult<Vec<DeviceAction>> {
        self.dispatcher.list_for_device(id)
    }

    pub fn actions_by_status(&self, status: ActionStatus) -> FleetResult<Vec<DeviceAction>> {
        self.dispatcher.list_by_status(status)
    }

    pub fn actions_by_type(&self, action_type: ActionType) -> FleetResult<Vec<DeviceAction>> {
        self.dispatcher.list_by_type(action_type)
    }

    // ── Background work ──────────────────────────────────────────────────────

    /// Reclassify every active device and publish the flips.
    pub fn scan_presence(&self) -> Vec<PresenceTransition> {
        let now = self.clock.now();
        let devices = self.registry.list(false);
        let flips = self.tracker().scan(&devices, now);
        for flip in &flips {
            self.announce_presence(flip, now);
        }
        flips
    }

    fn announce_presence(&self, flip: &PresenceTransition, now: DateTime<Utc>) {
        match flip.to {
            Presence::Online => info!(device_id = %flip.device_id, "device online"),
            Presence::Offline => warn!(device_id = %flip.device_id, "device offline"),
        }
        self.emit(
            Event::new(
                now,
                EventPayload::PresenceChanged {
                    from: flip.from,
                    to: flip.to,
                },
            )
            .for_device(flip.device_id),
        );
    }

    /// One pass of the background sweep: action timeouts, then presence.
    pub fn sweep(&self) -> FleetResult<SweepReport> {
        let timed_out = self.dispatcher.sweep_timeouts()?;
        let presence = self.scan_presence();
        Ok(SweepReport {
            timed_out,
            presence,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
