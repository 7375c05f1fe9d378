//! [`ActionDispatcher`] – the command state machine.
//!
//! Every [`DeviceAction`] is created and moved here, and nowhere else:
//!
//! ```text
//! pending ──► sent ──► acknowledged ──► completed
//!    │          │            │
//!    └──────────┴────────────┴──► failed | timeout
//! ```
//!
//! State lives in the [`ActionLedger`]; each move is a conditional write
//! keyed on the status the dispatcher read, so two writers racing on the
//! same action cannot both win and a terminal row is never rewritten.
//!
//! # Policy coupling
//!
//! - New actions are authorized by the [`ActionGate`] against the device's
//!   effective policy (system-originated locks must be legitimate under it).
//! - Unlock outcomes go through the [`LockoutGuard`] with limits taken from
//!   the effective policy, falling back to [`DispatchConfig::lockout_defaults`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::Utc;
//! use fleetlock_middleware::EventBus;
//! use fleetlock_runtime::dispatcher::{ActionDispatcher, ActionRequest, DispatchConfig};
//! use fleetlock_store::{ActionLedger, DeviceRegistry, PolicyStore};
//! use fleetlock_types::{ActionType, Actor, DeviceIdentity, DeviceProfile, Heartbeat, Role, SystemClock};
//!
//! let registry = Arc::new(DeviceRegistry::new());
//! let identity = DeviceIdentity { hostname: "kiosk-1".into(), mac_address: None, external_id: None };
//! let device = registry.register(&identity, DeviceProfile::default(), Utc::now()).unwrap();
//! registry.record_heartbeat(&Heartbeat::alive(device.id), Utc::now()).unwrap();
//!
//! let dispatcher = ActionDispatcher::new(
//!     ActionLedger::open_in_memory().unwrap(),
//!     registry,
//!     Arc::new(PolicyStore::new()),
//!     EventBus::default(),
//!     Arc::new(SystemClock),
//!     DispatchConfig::default(),
//! );
//!
//! let admin = Actor::user("alice", Role::ItAdmin);
//! let action = dispatcher.create(&admin, ActionRequest::new(device.id, ActionType::Lock)).unwrap();
//! let sent = dispatcher.mark_sent(&action.id).unwrap();
//! assert_eq!(sent.delivery_attempts, 1);
//! ```

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, TimeDelta, Utc};
use fleetlock_kernel::presence;
use fleetlock_kernel::{ActionGate, AttemptOutcome, CapabilityManager, LockoutGuard, LockoutLimits};
use fleetlock_middleware::EventBus;
use fleetlock_store::{ActionLedger, DeviceRegistry, PolicyStore, resolve};
use fleetlock_types::{
    ActionDetails, ActionId, ActionMetadata, ActionStatus, ActionType, Actor, Capability, Clock,
    Device, DeviceAction, DeviceId, Event, EventPayload, FleetError, FleetResult, Policy, Role,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Seconds an action may stay in flight before the sweep times it out,
/// measured from `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionTimeouts {
    pub lock: u32,
    pub unlock: u32,
    pub screenshot: u32,
    pub restart: u32,
}

impl Default for ActionTimeouts {
    fn default() -> Self {
        Self {
            lock: 120,
            unlock: 300,
            screenshot: 180,
            restart: 600,
        }
    }
}

impl ActionTimeouts {
    pub fn for_type(&self, action_type: ActionType) -> TimeDelta {
        let secs = match action_type {
            ActionType::Lock => self.lock,
            ActionType::Unlock => self.unlock,
            ActionType::Screenshot => self.screenshot,
            ActionType::Restart => self.restart,
        };
        TimeDelta::seconds(i64::from(secs))
    }
}

/// Tunables of an [`ActionDispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchConfig {
    pub timeouts: ActionTimeouts,
    /// Used when a device has no effective policy.
    pub lockout_defaults: LockoutLimits,
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests and results
// ─────────────────────────────────────────────────────────────────────────────

/// A request to issue one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub device_id: DeviceId,
    pub metadata: ActionMetadata,
    #[serde(default)]
    pub reason: String,
    /// Issue the command even though the device is offline.
    #[serde(default)]
    pub force: bool,
}

impl ActionRequest {
    pub fn new(device_id: DeviceId, action_type: ActionType) -> Self {
        Self::with_details(device_id, ActionDetails::for_type(action_type))
    }

    pub fn with_details(device_id: DeviceId, details: ActionDetails) -> Self {
        Self {
            device_id,
            metadata: ActionMetadata::new(details),
            reason: String::new(),
            force: false,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn action_type(&self) -> ActionType {
        self.metadata.details.action_type()
    }
}

/// What one reported unlock attempt did.
#[derive(Debug, Clone, PartialEq)]
pub struct UnlockAttempt {
    /// The action after the attempt was applied.
    pub action: DeviceAction,
    pub outcome: AttemptOutcome,
}

// ─────────────────────────────────────────────────────────────────────────────
// ActionDispatcher
// ─────────────────────────────────────────────────────────────────────────────

pub struct ActionDispatcher {
    ledger: ActionLedger,
    registry: Arc<DeviceRegistry>,
    policies: Arc<PolicyStore>,
    gate: RwLock<ActionGate>,
    lockout: LockoutGuard,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

impl ActionDispatcher {
    /// Build a dispatcher with the stock role → capability table.
    pub fn new(
        ledger: ActionLedger,
        registry: Arc<DeviceRegistry>,
        policies: Arc<PolicyStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            ledger,
            registry,
            policies,
            gate: RwLock::new(ActionGate::new(CapabilityManager::with_defaults())),
            lockout: LockoutGuard::new(),
            bus,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn lockout(&self) -> &LockoutGuard {
        &self.lockout
    }

    fn gate(&self) -> RwLockReadGuard<'_, ActionGate> {
        self.gate.read().unwrap_or_else(|e| e.into_inner())
    }

    fn gate_mut(&self) -> RwLockWriteGuard<'_, ActionGate> {
        self.gate.write().unwrap_or_else(|e| e.into_inner())
    }

    // ── Capabilities ─────────────────────────────────────────────────────────

    /// Check `actor` against the capability table.
    pub fn authorize(&self, actor: &Actor, cap: Capability) -> FleetResult<()> {
        self.gate().authorize(actor, cap)
    }

    pub fn grant(&self, role: Role, cap: Capability) {
        self.gate_mut().capabilities_mut().grant(role, cap);
        info!(role = %role, capability = ?cap, "capability granted");
    }

    pub fn revoke(&self, role: Role, cap: Capability) {
        self.gate_mut().capabilities_mut().revoke(role, cap);
        info!(role = %role, capability = ?cap, "capability revoked");
    }

    // ── Policy lookups ───────────────────────────────────────────────────────

    /// The policy currently governing `device`, if any.
    pub fn effective_policy(&self, device: &Device) -> Option<Policy> {
        let groups = self.registry.groups_of(&device.id);
        resolve(&self.policies.snapshot(), device, &groups).effective_policy
    }

    fn lockout_limits(&self, device_id: &DeviceId) -> FleetResult<LockoutLimits> {
        let device = self.registry.get(device_id)?;
        let policy = self.effective_policy(&device);
        Ok(LockoutLimits::from_policy(
            policy.as_ref(),
            self.config.lockout_defaults,
        ))
    }

    // ── Creation ─────────────────────────────────────────────────────────────

    /// Create a `pending` action.
    ///
    /// # Errors
    ///
    /// - [`FleetError::NotFound`] / [`FleetError::DeviceInactive`] – bad target.
    /// - [`FleetError::DeviceOffline`] – target offline and `force` not set.
    /// - [`FleetError::Forbidden`] / [`FleetError::PolicyViolation`] – see
    ///   [`ActionGate::authorize_action`].
    /// - [`FleetError::ActionAlreadyInFlight`] – a non-terminal action of the
    ///   same type exists for the device.
    pub fn create(&self, actor: &Actor, request: ActionRequest) -> FleetResult<DeviceAction> {
        let now = self.clock.now();
        let device = self.registry.get_active(&request.device_id)?;
        if !request.force && !presence::is_online(device.last_seen, now) {
            return Err(FleetError::DeviceOffline(device.id));
        }

        let policy = self.effective_policy(&device);
        self.gate().authorize_action(
            actor,
            device.id,
            &request.metadata.details,
            policy.as_ref(),
        )?;

        let action_type = request.action_type();
        if self.ledger.find_in_flight(&device.id, action_type)?.is_some() {
            return Err(FleetError::ActionAlreadyInFlight {
                device_id: device.id,
                action_type,
            });
        }

        let action = DeviceAction {
            id: ActionId::new(),
            device_id: device.id,
            action_type,
            status: ActionStatus::Pending,
            initiator: actor.id(),
            reason: request.reason,
            metadata: request.metadata,
            created_at: now,
            sent_at: None,
            acknowledged_at: None,
            completed_at: None,
            delivery_attempts: 0,
            result: None,
            error: None,
        };
        // The ledger's unique index catches a concurrent create that slipped
        // past the lookup above.
        self.ledger.insert(&action)?;
        info!(
            action_id = %action.id,
            device_id = %action.device_id,
            action_type = %action_type,
            actor = %actor,
            "action created"
        );
        self.announce(&action, None, Some(actor));
        Ok(action)
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    /// Record that the command was handed to a transport.
    ///
    /// Marking an already `sent` action again is a re-delivery: it only bumps
    /// `delivery_attempts`.
    pub fn mark_sent(&self, id: &ActionId) -> FleetResult<DeviceAction> {
        let current = self.ledger.get(id)?;
        if current.status == ActionStatus::Sent {
            let mut next = current.clone();
            next.delivery_attempts += 1;
            debug!(action_id = %id, attempts = next.delivery_attempts, "action re-sent");
            return self.commit(&current, next);
        }
        self.advance_from(current, ActionStatus::Sent, |a, now| {
            a.sent_at = Some(now);
            a.delivery_attempts += 1;
        })
    }

    /// The agent received the command.  Repeating the acknowledgement is a
    /// no-op.
    pub fn mark_acknowledged(&self, id: &ActionId) -> FleetResult<DeviceAction> {
        let current = self.ledger.get(id)?;
        if current.status == ActionStatus::Acknowledged {
            return Ok(current);
        }
        self.advance_from(current, ActionStatus::Acknowledged, |a, now| {
            a.acknowledged_at = Some(now);
        })
    }

    /// Terminal success.
    ///
    /// Completing an unlock counts as a successful unlock attempt, so a
    /// device in lockout cannot be unlocked this way: the action fails and
    /// [`FleetError::LockedOut`] is returned.  The counter is only reset once
    /// the completion is stored.  Completed lock and unlock actions update
    /// the device's lock state.
    pub fn mark_completed(
        &self,
        id: &ActionId,
        result: Option<serde_json::Value>,
    ) -> FleetResult<DeviceAction> {
        let current = self.ledger.get(id)?;
        let unlock = current.action_type == ActionType::Unlock;
        if unlock && current.status.can_transition_to(ActionStatus::Completed) {
            let now = self.clock.now();
            if let Err(err) = self.lockout.check(current.device_id, now) {
                return Err(self.block_unlock(current, err, now));
            }
        }
        let done = self.advance_from(current, ActionStatus::Completed, |a, _| {
            a.result = result;
        })?;
        if unlock {
            let limits = self.lockout_limits(&done.device_id)?;
            if let Err(e) = self
                .lockout
                .record_attempt(done.device_id, true, limits, self.clock.now())
            {
                warn!(action_id = %done.id, error = %e, "lockout tripped while unlock completed");
            }
        }
        self.apply_side_effects(&done)?;
        Ok(done)
    }

    /// Terminal failure reported by the agent or the transport.
    pub fn mark_failed(&self, id: &ActionId, error: impl Into<String>) -> FleetResult<DeviceAction> {
        let error = error.into();
        self.advance(id, ActionStatus::Failed, |a, _| a.error = Some(error))
    }

    /// Apply one unlock attempt reported against an `unlock` action.
    ///
    /// A report on a `sent` action acknowledges it first.  A failure below
    /// the limit leaves the action `acknowledged`; the failure that trips the
    /// lockout fails it; an attempt during lockout fails it and returns
    /// [`FleetError::LockedOut`]; a success completes it.
    pub fn record_unlock_attempt(&self, id: &ActionId, success: bool) -> FleetResult<UnlockAttempt> {
        let mut action = self.ledger.get(id)?;
        if action.action_type != ActionType::Unlock {
            return Err(FleetError::InvalidRequest(format!(
                "action {id} is a {} action, not an unlock",
                action.action_type
            )));
        }
        if action.status == ActionStatus::Sent {
            action = self.mark_acknowledged(id)?;
        }
        if action.status != ActionStatus::Acknowledged {
            return Err(FleetError::InvalidTransition {
                action_id: *id,
                from: action.status,
                to: ActionStatus::Completed,
            });
        }

        let now = self.clock.now();
        let device_id = action.device_id;
        let limits = self.lockout_limits(&device_id)?;
        let mut next = action.clone();
        count_attempt(&mut next);

        if success {
            // Reset the counter only once the completion is stored.
            if let Err(err) = self.lockout.check(device_id, now) {
                return Err(self.block_unlock(action, err, now));
            }
            let done = self.advance_from(action, ActionStatus::Completed, |a, _| {
                *a = DeviceAction {
                    result: Some(serde_json::json!({ "unlocked": true })),
                    ..next
                };
            })?;
            let outcome = self
                .lockout
                .record_attempt(device_id, true, limits, now)
                .unwrap_or_else(|e| {
                    warn!(action_id = %done.id, error = %e, "lockout tripped while unlock completed");
                    AttemptOutcome::Unlocked
                });
            self.apply_side_effects(&done)?;
            return Ok(UnlockAttempt {
                action: done,
                outcome,
            });
        }

        let outcome = match self.lockout.record_attempt(device_id, false, limits, now) {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.block_unlock(action, err, now)),
        };
        self.announce_attempt(device_id, &outcome, limits, now);

        let action = match outcome {
            // A failed attempt never reports success.
            AttemptOutcome::Unlocked => action,
            AttemptOutcome::Failed { .. } => self.commit(&action, next)?,
            AttemptOutcome::LockoutTripped { until } => {
                self.advance_from(action, ActionStatus::Failed, |a, _| {
                    *a = DeviceAction {
                        error: Some(format!(
                            "{} failed unlock attempts; locked out until {until}",
                            limits.max_attempts
                        )),
                        ..next
                    };
                })?
            }
        };
        Ok(UnlockAttempt { action, outcome })
    }

    /// Apply an unlock attempt made at the device's own lock screen, with no
    /// operator command behind it.
    ///
    /// Only the device itself (or an actor holding
    /// [`Capability::UnlockDevice`]) may report one.  The attempt counts
    /// against the same per-device limits as attempts on `unlock` actions; a
    /// success marks the device unlocked.
    ///
    /// # Errors
    ///
    /// - [`FleetError::Forbidden`] – another device, or an operator without
    ///   the capability.
    /// - [`FleetError::NotFound`] / [`FleetError::DeviceInactive`] – bad target.
    /// - [`FleetError::LockedOut`] – the device is in lockout.
    pub fn record_device_unlock_attempt(
        &self,
        actor: &Actor,
        device_id: &DeviceId,
        success: bool,
    ) -> FleetResult<AttemptOutcome> {
        match actor {
            Actor::Device { device_id: origin } if origin == device_id => {}
            _ => self.authorize(actor, Capability::UnlockDevice)?,
        }
        let device = self.registry.get_active(device_id)?;
        let now = self.clock.now();
        let limits = self.lockout_limits(&device.id)?;
        let outcome = match self.lockout.record_attempt(device.id, success, limits, now) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.announce_blocked(device.id, &err, now);
                return Err(err);
            }
        };
        self.announce_attempt(device.id, &outcome, limits, now);
        if outcome == AttemptOutcome::Unlocked {
            self.registry.apply_lock_state(&device.id, false, now)?;
        }
        Ok(outcome)
    }

    fn announce_attempt(
        &self,
        device_id: DeviceId,
        outcome: &AttemptOutcome,
        limits: LockoutLimits,
        now: DateTime<Utc>,
    ) {
        let payload = match *outcome {
            AttemptOutcome::Unlocked => return,
            AttemptOutcome::Failed {
                consecutive_failures,
                remaining_attempts,
            } => {
                debug!(device_id = %device_id, consecutive_failures, remaining_attempts, "unlock attempt failed");
                EventPayload::UnlockAttemptFailed {
                    consecutive_failures,
                    max_attempts: limits.max_attempts,
                }
            }
            AttemptOutcome::LockoutTripped { until } => EventPayload::LockoutTripped {
                until,
                max_attempts: limits.max_attempts,
            },
        };
        self.emit(Event::new(now, payload).for_device(device_id));
    }

    fn announce_blocked(&self, device_id: DeviceId, err: &FleetError, now: DateTime<Utc>) {
        if let FleetError::LockedOut {
            remaining_seconds, ..
        } = err
        {
            warn!(device_id = %device_id, remaining_seconds, "unlock blocked by lockout");
            self.emit(
                Event::new(
                    now,
                    EventPayload::UnlockBlocked {
                        remaining_seconds: *remaining_seconds,
                    },
                )
                .for_device(device_id),
            );
        }
    }

    /// Fail `action` because its device is in lockout; returns `err` for the
    /// caller to report.
    fn block_unlock(&self, action: DeviceAction, err: FleetError, now: DateTime<Utc>) -> FleetError {
        if matches!(err, FleetError::LockedOut { .. }) {
            self.announce_blocked(action.device_id, &err, now);
            let message = err.to_string();
            let action_id = action.id;
            if let Err(e) = self.advance_from(action, ActionStatus::Failed, |a, _| {
                count_attempt(a);
                a.error = Some(message);
            }) {
                warn!(action_id = %action_id, error = %e, "could not fail blocked unlock");
            }
        }
        err
    }

    fn apply_side_effects(&self, action: &DeviceAction) -> FleetResult<()> {
        let at = action.completed_at.unwrap_or_else(|| self.clock.now());
        match action.action_type {
            ActionType::Lock => {
                self.registry.apply_lock_state(&action.device_id, true, at)?;
            }
            ActionType::Unlock => {
                self.registry.apply_lock_state(&action.device_id, false, at)?;
            }
            ActionType::Screenshot | ActionType::Restart => {}
        }
        Ok(())
    }

    // ── Timeouts ─────────────────────────────────────────────────────────────

    /// Time out every in-flight action older than its type's threshold.
    ///
    /// Terminal actions are never touched, and running the sweep twice (or
    /// concurrently) expires each action at most once.
    pub fn detect_timeouts(
        &self,
        now: DateTime<Utc>,
        timeouts: &ActionTimeouts,
    ) -> FleetResult<Vec<DeviceAction>> {
        let mut expired = Vec::new();
        for action in self.ledger.list_in_flight()? {
            let limit = timeouts.for_type(action.action_type);
            if now - action.created_at <= limit {
                continue;
            }
            let reason = format!(
                "no outcome reported within {}s",
                limit.num_seconds()
            );
            if self.ledger.expire(&action.id, now, &reason)? {
                let updated = self.ledger.get(&action.id)?;
                info!(
                    action_id = %updated.id,
                    device_id = %updated.device_id,
                    from = %action.status,
                    "action timed out"
                );
                self.announce(&updated, Some(action.status), None);
                expired.push(updated);
            }
        }
        Ok(expired)
    }

    /// [`detect_timeouts`](Self::detect_timeouts) at the clock's current time
    /// with the configured thresholds.
    pub fn sweep_timeouts(&self) -> FleetResult<Vec<DeviceAction>> {
        self.detect_timeouts(self.clock.now(), &self.config.timeouts)
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn get(&self, id: &ActionId) -> FleetResult<DeviceAction> {
        Ok(self.ledger.get(id)?)
    }

    pub fn list_for_device(&self, device_id: &DeviceId) -> FleetResult<Vec<DeviceAction>> {
        Ok(self.ledger.list_for_device(device_id)?)
    }

    pub fn list_by_status(&self, status: ActionStatus) -> FleetResult<Vec<DeviceAction>> {
        Ok(self.ledger.list_by_status(status)?)
    }

    pub fn list_by_type(&self, action_type: ActionType) -> FleetResult<Vec<DeviceAction>> {
        Ok(self.ledger.list_by_type(action_type)?)
    }

    pub fn list_all(&self) -> FleetResult<Vec<DeviceAction>> {
        Ok(self.ledger.list_all()?)
    }

    /// Commands the device has not acknowledged yet (`pending` or `sent`).
    pub fn outstanding_for_device(&self, device_id: &DeviceId) -> FleetResult<Vec<DeviceAction>> {
        Ok(self.ledger.outstanding_for_device(device_id)?)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn advance(
        &self,
        id: &ActionId,
        to: ActionStatus,
        edit: impl FnOnce(&mut DeviceAction, DateTime<Utc>),
    ) -> FleetResult<DeviceAction> {
        let current = self.ledger.get(id)?;
        self.advance_from(current, to, edit)
    }

    fn advance_from(
        &self,
        current: DeviceAction,
        to: ActionStatus,
        edit: impl FnOnce(&mut DeviceAction, DateTime<Utc>),
    ) -> FleetResult<DeviceAction> {
        if !current.status.can_transition_to(to) {
            return Err(FleetError::InvalidTransition {
                action_id: current.id,
                from: current.status,
                to,
            });
        }
        let now = self.clock.now();
        let mut next = current.clone();
        edit(&mut next, now);
        next.status = to;
        if to.is_terminal() {
            next.completed_at = Some(now);
        }
        self.commit(&current, next)
    }

    /// Persist `next` if the stored row still has `current`'s status.
    fn commit(&self, current: &DeviceAction, next: DeviceAction) -> FleetResult<DeviceAction> {
        if !self.ledger.compare_and_swap(current.status, &next)? {
            let latest = self.ledger.get(&current.id)?;
            return Err(FleetError::InvalidTransition {
                action_id: current.id,
                from: latest.status,
                to: next.status,
            });
        }
        if current.status != next.status {
            debug!(action_id = %next.id, from = %current.status, to = %next.status, "action moved");
            self.announce(&next, Some(current.status), None);
        }
        Ok(next)
    }

    fn announce(&self, action: &DeviceAction, from: Option<ActionStatus>, actor: Option<&Actor>) {
        let mut event = Event::new(
            self.clock.now(),
            EventPayload::ActionStateChanged {
                action_id: action.id,
                action_type: action.action_type,
                from,
                to: action.status,
            },
        )
        .for_device(action.device_id);
        if let Some(actor) = actor {
            event = event.by(actor);
        }
        self.emit(event);
    }

    fn emit(&self, event: Event) {
        self.bus.emit(event);
    }
}

fn count_attempt(action: &mut DeviceAction) {
    if let ActionDetails::Unlock { attempts } = &mut action.metadata.details {
        *attempts += 1;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleetlock_middleware::Topic;
    use fleetlock_types::{
        AssignmentTarget, DeviceIdentity, DeviceProfile, Heartbeat, LockTrigger, ManualClock,
        PolicyDraft, PolicyScope, PolicyTemplate,
    };

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: Arc<DeviceRegistry>,
        policies: Arc<PolicyStore>,
        bus: EventBus,
        dispatcher: ActionDispatcher,
    }

    fn fixture() -> Fixture {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let registry = Arc::new(DeviceRegistry::new());
        let policies = Arc::new(PolicyStore::new());
        let bus = EventBus::default();
        let dispatcher = ActionDispatcher::new(
            ActionLedger::open_in_memory().unwrap(),
            Arc::clone(&registry),
            Arc::clone(&policies),
            bus.clone(),
            clock.clone(),
            DispatchConfig::default(),
        );
        Fixture {
            clock,
            registry,
            policies,
            bus,
            dispatcher,
        }
    }

    impl Fixture {
        fn online_device(&self, host: &str) -> DeviceId {
            let identity = DeviceIdentity {
                hostname: host.into(),
                mac_address: None,
                external_id: None,
            };
            let device = self
                .registry
                .register(&identity, DeviceProfile::default(), self.clock.now())
                .unwrap();
            self.heartbeat(device.id);
            device.id
        }

        fn heartbeat(&self, id: DeviceId) {
            self.registry
                .record_heartbeat(&Heartbeat::alive(id), self.clock.now())
                .unwrap();
        }

        fn sent(&self, id: DeviceId, action_type: ActionType) -> DeviceAction {
            let action = self
                .dispatcher
                .create(&admin(), ActionRequest::new(id, action_type))
                .unwrap();
            self.dispatcher.mark_sent(&action.id).unwrap()
        }
    }

    fn admin() -> Actor {
        Actor::user("alice", Role::Superadmin)
    }

    #[test]
    fn create_rejects_unknown_and_inactive_devices() {
        let f = fixture();
        let err = f
            .dispatcher
            .create(&admin(), ActionRequest::new(DeviceId::new(), ActionType::Lock))
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound { .. }));

        let id = f.online_device("pc-01");
        f.registry.deactivate(&id).unwrap();
        let err = f
            .dispatcher
            .create(&admin(), ActionRequest::new(id, ActionType::Lock))
            .unwrap_err();
        assert_eq!(err, FleetError::DeviceInactive(id));
    }

    #[test]
    fn offline_devices_need_force() {
        let f = fixture();
        let id = f.online_device("pc-01");
        f.clock.advance(TimeDelta::minutes(5));

        let err = f
            .dispatcher
            .create(&admin(), ActionRequest::new(id, ActionType::Restart))
            .unwrap_err();
        assert_eq!(err, FleetError::DeviceOffline(id));

        let action = f
            .dispatcher
            .create(&admin(), ActionRequest::new(id, ActionType::Restart).forced())
            .unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.initiator.as_deref(), Some("alice"));
    }

    #[test]
    fn one_in_flight_action_per_type() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let first = f
            .dispatcher
            .create(&admin(), ActionRequest::new(id, ActionType::Lock))
            .unwrap();

        let err = f
            .dispatcher
            .create(&admin(), ActionRequest::new(id, ActionType::Lock))
            .unwrap_err();
        assert_eq!(
            err,
            FleetError::ActionAlreadyInFlight {
                device_id: id,
                action_type: ActionType::Lock
            }
        );

        // A different type is independent.
        f.dispatcher
            .create(&admin(), ActionRequest::new(id, ActionType::Screenshot))
            .unwrap();

        f.dispatcher.mark_failed(&first.id, "agent crashed").unwrap();
        f.dispatcher
            .create(&admin(), ActionRequest::new(id, ActionType::Lock))
            .unwrap();
    }

    #[test]
    fn full_lifecycle_updates_lock_state() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let action = f.sent(id, ActionType::Lock);
        assert_eq!(action.status, ActionStatus::Sent);
        assert!(action.sent_at.is_some());

        let acked = f.dispatcher.mark_acknowledged(&action.id).unwrap();
        assert_eq!(acked.status, ActionStatus::Acknowledged);
        // Repeated acknowledgement is harmless.
        assert_eq!(f.dispatcher.mark_acknowledged(&action.id).unwrap(), acked);

        f.clock.advance(TimeDelta::seconds(3));
        let done = f
            .dispatcher
            .mark_completed(&action.id, Some(serde_json::json!({"ok": true})))
            .unwrap();
        assert_eq!(done.status, ActionStatus::Completed);
        assert_eq!(done.completed_at, Some(f.clock.now()));

        let device = f.registry.get(&id).unwrap();
        assert!(device.is_locked);
        assert_eq!(device.last_lock_time, Some(f.clock.now()));
    }

    #[test]
    fn terminal_actions_never_move() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let action = f.sent(id, ActionType::Screenshot);
        f.dispatcher.mark_failed(&action.id, "no display").unwrap();

        for result in [
            f.dispatcher.mark_sent(&action.id),
            f.dispatcher.mark_acknowledged(&action.id),
            f.dispatcher.mark_completed(&action.id, None),
            f.dispatcher.mark_failed(&action.id, "again"),
        ] {
            assert!(matches!(
                result,
                Err(FleetError::InvalidTransition {
                    from: ActionStatus::Failed,
                    ..
                })
            ));
        }
        assert_eq!(
            f.dispatcher.get(&action.id).unwrap().error.as_deref(),
            Some("no display")
        );
    }

    #[test]
    fn completing_requires_acknowledgement() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let action = f.sent(id, ActionType::Restart);
        let err = f.dispatcher.mark_completed(&action.id, None).unwrap_err();
        assert_eq!(
            err,
            FleetError::InvalidTransition {
                action_id: action.id,
                from: ActionStatus::Sent,
                to: ActionStatus::Completed
            }
        );
    }

    #[test]
    fn resending_is_idempotent() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let action = f.sent(id, ActionType::Lock);
        let again = f.dispatcher.mark_sent(&action.id).unwrap();

        assert_eq!(again.id, action.id);
        assert_eq!(again.status, ActionStatus::Sent);
        assert_eq!(again.sent_at, action.sent_at);
        assert_eq!(again.delivery_attempts, 2);
        assert_eq!(f.dispatcher.list_for_device(&id).unwrap().len(), 1);
    }

    #[test]
    fn roles_without_the_capability_are_forbidden() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let auditor = Actor::user("bob", Role::Auditor);

        let err = f
            .dispatcher
            .create(&auditor, ActionRequest::new(id, ActionType::Restart))
            .unwrap_err();
        assert!(matches!(
            err,
            FleetError::Forbidden {
                capability: Capability::RestartDevice,
                ..
            }
        ));

        f.dispatcher.grant(Role::Auditor, Capability::RestartDevice);
        f.dispatcher
            .create(&auditor, ActionRequest::new(id, ActionType::Restart))
            .unwrap();
    }

    #[test]
    fn device_initiated_locks_follow_the_effective_policy() {
        let f = fixture();
        let id = f.online_device("kiosk-01");
        let me = Actor::Device { device_id: id };
        let idle = |secs| {
            ActionRequest::with_details(
                id,
                ActionDetails::Lock {
                    trigger: LockTrigger::IdleTimeout { idle_seconds: secs },
                },
            )
        };

        // No policy: the 300 s default applies.
        assert!(matches!(
            f.dispatcher.create(&me, idle(120)),
            Err(FleetError::PolicyViolation(_))
        ));

        let kiosk = f
            .policies
            .create_policy(
                PolicyDraft::from_template("kiosk", PolicyTemplate::Kiosk),
                None,
                f.clock.now(),
            )
            .unwrap();
        f.policies
            .assign(&kiosk.id, AssignmentTarget::Device(id), None, f.clock.now())
            .unwrap();

        let hotkey = ActionRequest::with_details(
            id,
            ActionDetails::Lock {
                trigger: LockTrigger::Hotkey,
            },
        );
        assert!(matches!(
            f.dispatcher.create(&me, hotkey),
            Err(FleetError::PolicyViolation(_))
        ));

        let action = f.dispatcher.create(&me, idle(60)).unwrap();
        assert_eq!(action.initiator, Some(format!("device:{id}")));
    }

    #[test]
    fn screenshots_follow_the_monitoring_settings() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let mut draft = PolicyDraft::new("private", PolicyScope::Global, 1);
        draft.settings.monitoring.enable_screenshot = false;
        f.policies.create_policy(draft, None, f.clock.now()).unwrap();

        assert!(matches!(
            f.dispatcher
                .create(&admin(), ActionRequest::new(id, ActionType::Screenshot)),
            Err(FleetError::PolicyViolation(_))
        ));
        assert!(f.dispatcher.list_for_device(&id).unwrap().is_empty());
        f.dispatcher
            .create(&admin(), ActionRequest::new(id, ActionType::Lock))
            .unwrap();
    }

    #[test]
    fn timeouts_expire_stale_actions_once() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let lock = f.sent(id, ActionType::Lock);
        let restart = f.sent(id, ActionType::Restart);
        let shot = f.sent(id, ActionType::Screenshot);
        f.dispatcher.mark_acknowledged(&shot.id).unwrap();
        f.dispatcher.mark_completed(&shot.id, None).unwrap();

        // Exactly at the threshold nothing happens.
        f.clock.advance(TimeDelta::seconds(120));
        assert!(f.dispatcher.sweep_timeouts().unwrap().is_empty());

        f.clock.advance(TimeDelta::seconds(1));
        let expired = f.dispatcher.sweep_timeouts().unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, lock.id);
        assert_eq!(expired[0].status, ActionStatus::Timeout);
        assert_eq!(expired[0].completed_at, Some(f.clock.now()));

        // Second sweep: no double expiry.
        assert!(f.dispatcher.sweep_timeouts().unwrap().is_empty());

        f.clock.advance(TimeDelta::seconds(600));
        let expired = f.dispatcher.sweep_timeouts().unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, restart.id);
        assert_eq!(
            f.dispatcher.get(&shot.id).unwrap().status,
            ActionStatus::Completed
        );
    }

    #[test]
    fn lockout_scenario() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let policy = f
            .policies
            .create_policy(
                PolicyDraft::new("standard", PolicyScope::Global, 1),
                None,
                f.clock.now(),
            )
            .unwrap();
        assert_eq!(policy.settings.unlock.max_unlock_attempts, 3);
        assert_eq!(policy.settings.unlock.lockout_duration_minutes, 15);

        let unlock = f.sent(id, ActionType::Unlock);
        for n in 1..=2 {
            let report = f.dispatcher.record_unlock_attempt(&unlock.id, false).unwrap();
            assert_eq!(
                report.outcome,
                AttemptOutcome::Failed {
                    consecutive_failures: n,
                    remaining_attempts: 3 - n
                }
            );
            assert_eq!(report.action.status, ActionStatus::Acknowledged);
            assert_eq!(
                report.action.metadata.details,
                ActionDetails::Unlock { attempts: n }
            );
        }
        let third = f.dispatcher.record_unlock_attempt(&unlock.id, false).unwrap();
        assert!(matches!(third.outcome, AttemptOutcome::LockoutTripped { .. }));
        assert_eq!(third.action.status, ActionStatus::Failed);

        // Correct credentials within the lockout window are still refused.
        f.clock.advance(TimeDelta::minutes(10));
        f.heartbeat(id);
        let retry = f.sent(id, ActionType::Unlock);
        let err = f.dispatcher.record_unlock_attempt(&retry.id, true).unwrap_err();
        assert_eq!(
            err,
            FleetError::LockedOut {
                device_id: id,
                remaining_seconds: 300
            }
        );
        assert_eq!(
            f.dispatcher.get(&retry.id).unwrap().status,
            ActionStatus::Failed
        );

        // Once the window has passed a correct attempt succeeds.
        f.clock.advance(TimeDelta::minutes(5));
        f.heartbeat(id);
        let last = f.sent(id, ActionType::Unlock);
        let report = f.dispatcher.record_unlock_attempt(&last.id, true).unwrap();
        assert_eq!(report.outcome, AttemptOutcome::Unlocked);
        assert_eq!(report.action.status, ActionStatus::Completed);
        assert_eq!(f.dispatcher.lockout().state(&id).consecutive_failures, 0);
        assert!(!f.registry.get(&id).unwrap().is_locked);
    }

    #[test]
    fn unlock_completion_is_refused_during_lockout() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let limits = LockoutLimits::default();
        for _ in 0..3 {
            f.dispatcher
                .lockout()
                .record_attempt(id, false, limits, f.clock.now())
                .unwrap();
        }
        let unlock = f.sent(id, ActionType::Unlock);
        f.dispatcher.mark_acknowledged(&unlock.id).unwrap();
        let err = f.dispatcher.mark_completed(&unlock.id, None).unwrap_err();
        assert!(matches!(err, FleetError::LockedOut { .. }));
        assert_eq!(
            f.dispatcher.get(&unlock.id).unwrap().status,
            ActionStatus::Failed
        );
    }

    #[tokio::test]
    async fn lock_screen_attempts_trip_the_lockout() {
        let f = fixture();
        let id = f.online_device("pc-01");
        f.registry.apply_lock_state(&id, true, f.clock.now()).unwrap();
        let me = Actor::Device { device_id: id };
        let mut security = f.bus.subscribe_to(Topic::Security);

        for n in 1..=2 {
            assert_eq!(
                f.dispatcher.record_device_unlock_attempt(&me, &id, false).unwrap(),
                AttemptOutcome::Failed {
                    consecutive_failures: n,
                    remaining_attempts: 3 - n
                }
            );
        }
        let tripped = f.dispatcher.record_device_unlock_attempt(&me, &id, false).unwrap();
        assert!(matches!(tripped, AttemptOutcome::LockoutTripped { .. }));

        f.clock.advance(TimeDelta::minutes(10));
        assert_eq!(
            f.dispatcher.record_device_unlock_attempt(&me, &id, true).unwrap_err(),
            FleetError::LockedOut {
                device_id: id,
                remaining_seconds: 300
            }
        );
        assert!(f.registry.get(&id).unwrap().is_locked);

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(security.recv().await.unwrap().payload);
        }
        assert!(matches!(seen[0], EventPayload::UnlockAttemptFailed { consecutive_failures: 1, .. }));
        assert!(matches!(seen[2], EventPayload::LockoutTripped { max_attempts: 3, .. }));
        assert_eq!(seen[3], EventPayload::UnlockBlocked { remaining_seconds: 300 });

        f.clock.advance(TimeDelta::minutes(5));
        assert_eq!(
            f.dispatcher.record_device_unlock_attempt(&me, &id, true).unwrap(),
            AttemptOutcome::Unlocked
        );
        assert!(!f.registry.get(&id).unwrap().is_locked);
        assert_eq!(f.dispatcher.lockout().state(&id).consecutive_failures, 0);
    }

    #[test]
    fn lock_screen_attempts_for_other_devices_are_forbidden() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let other = Actor::Device {
            device_id: f.online_device("pc-02"),
        };
        assert!(matches!(
            f.dispatcher.record_device_unlock_attempt(&other, &id, false),
            Err(FleetError::Forbidden {
                capability: Capability::UnlockDevice,
                ..
            })
        ));
        assert_eq!(f.dispatcher.lockout().state(&id), Default::default());

        // Operators with the unlock capability may report on its behalf.
        f.dispatcher
            .record_device_unlock_attempt(&admin(), &id, false)
            .unwrap();
        assert_eq!(f.dispatcher.lockout().state(&id).consecutive_failures, 1);
    }

    #[test]
    fn refused_completion_keeps_the_failure_count() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let unlock = f.sent(id, ActionType::Unlock);
        f.dispatcher.record_unlock_attempt(&unlock.id, false).unwrap();
        f.dispatcher.record_unlock_attempt(&unlock.id, false).unwrap();

        f.clock.advance(TimeDelta::seconds(301));
        assert_eq!(f.dispatcher.sweep_timeouts().unwrap().len(), 1);

        assert!(matches!(
            f.dispatcher.mark_completed(&unlock.id, None),
            Err(FleetError::InvalidTransition {
                from: ActionStatus::Timeout,
                ..
            })
        ));
        assert!(matches!(
            f.dispatcher.record_unlock_attempt(&unlock.id, true),
            Err(FleetError::InvalidTransition { .. })
        ));
        assert_eq!(f.dispatcher.lockout().state(&id).consecutive_failures, 2);
    }

    #[test]
    fn attempts_on_other_action_types_are_rejected() {
        let f = fixture();
        let id = f.online_device("pc-01");
        let lock = f.sent(id, ActionType::Lock);
        assert!(matches!(
            f.dispatcher.record_unlock_attempt(&lock.id, true),
            Err(FleetError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn transitions_are_published_on_the_actions_topic() {
        let f = fixture();
        let mut rx = f.bus.subscribe_to(Topic::Actions);
        let id = f.online_device("pc-01");
        let action = f.sent(id, ActionType::Screenshot);

        let created = rx.recv().await.unwrap();
        assert_eq!(created.device_id, Some(id));
        assert_eq!(created.actor_id.as_deref(), Some("alice"));
        assert!(matches!(
            created.payload,
            EventPayload::ActionStateChanged {
                from: None,
                to: ActionStatus::Pending,
                ..
            }
        ));
        let sent = rx.recv().await.unwrap();
        assert_eq!(
            sent.payload,
            EventPayload::ActionStateChanged {
                action_id: action.id,
                action_type: ActionType::Screenshot,
                from: Some(ActionStatus::Pending),
                to: ActionStatus::Sent,
            }
        );
    }
}
