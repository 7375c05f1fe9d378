//! [`ActionGate`] – the single check an action request passes before it is
//! recorded.
//!
//! [`ActionGate::authorize_action`] enforces two independent checks in order:
//!
//! 1. **Capability** ([`CapabilityManager`]): an operator must hold the
//!    capability for the action type.  A device may only request a lock of
//!    itself; internal system work is trusted.
//! 2. **Lock legitimacy**: a lock that did not come from an operator must be
//!    justified by the device's effective policy.  A hotkey lock needs
//!    `manual_lock_enabled`; an idle lock needs the reported idle time to have
//!    reached `idle_timeout_seconds`.  Without an effective policy the stock
//!    lock settings apply.
//! 3. **Monitoring**: a screenshot is refused while the effective policy has
//!    `monitoring.enable_screenshot` off, whoever asks for it.
//!
//! # Example
//!
//! ```
//! use fleetlock_kernel::{ActionGate, CapabilityManager};
//! use fleetlock_types::{ActionDetails, Actor, DeviceId, LockTrigger, Role};
//!
//! let gate = ActionGate::new(CapabilityManager::with_defaults());
//! let device = DeviceId::new();
//!
//! let admin = Actor::user("alice", Role::Security);
//! let lock = ActionDetails::Lock { trigger: LockTrigger::Admin };
//! assert!(gate.authorize_action(&admin, device, &lock, None).is_ok());
//!
//! // The agent claims an idle lock after 10 s; the default timeout is 300 s.
//! let agent = Actor::Device { device_id: device };
//! let early = ActionDetails::Lock { trigger: LockTrigger::IdleTimeout { idle_seconds: 10 } };
//! assert!(gate.authorize_action(&agent, device, &early, None).is_err());
//! ```

use fleetlock_types::{
    ActionDetails, ActionType, Actor, Capability, DeviceId, FleetError, LockSettings,
    LockTrigger, Policy,
};

use crate::capability_manager::CapabilityManager;

pub struct ActionGate {
    capability_manager: CapabilityManager,
}

impl ActionGate {
    pub fn new(capability_manager: CapabilityManager) -> Self {
        Self { capability_manager }
    }

    pub fn capabilities(&self) -> &CapabilityManager {
        &self.capability_manager
    }

    pub fn capabilities_mut(&mut self) -> &mut CapabilityManager {
        &mut self.capability_manager
    }

    /// Check that `actor` may exercise `cap`.
    ///
    /// Operators are looked up in the capability table.  [`Actor::System`] is
    /// always allowed.  [`Actor::Device`] holds no capabilities here; its
    /// self-lock right is handled in [`ActionGate::authorize_action`].
    pub fn authorize(&self, actor: &Actor, cap: Capability) -> Result<(), FleetError> {
        match actor {
            Actor::User { role, .. } => self
                .capability_manager
                .check(*role, cap)
                .map_err(|_| FleetError::Forbidden {
                    actor: actor.to_string(),
                    capability: cap,
                }),
            Actor::System => Ok(()),
            Actor::Device { .. } => Err(FleetError::Forbidden {
                actor: actor.to_string(),
                capability: cap,
            }),
        }
    }

    /// Authorize `actor` to issue `details` against `device_id`, given the
    /// device's effective policy.
    ///
    /// # Errors
    ///
    /// - [`FleetError::Forbidden`] – missing capability, or a device acting on
    ///   anything but a lock of itself.
    /// - [`FleetError::PolicyViolation`] – a non-operator lock the policy
    ///   does not allow, or a screenshot on a device whose policy disables
    ///   them.
    pub fn authorize_action(
        &self,
        actor: &Actor,
        device_id: DeviceId,
        details: &ActionDetails,
        policy: Option<&Policy>,
    ) -> Result<(), FleetError> {
        let action_type = details.action_type();
        let cap = Capability::for_action(action_type);

        match actor {
            Actor::Device { device_id: origin }
                if *origin == device_id && action_type == ActionType::Lock => {}
            _ => self.authorize(actor, cap)?,
        }

        match details {
            ActionDetails::Lock { trigger } if actor.is_system_originated() => {
                let lock = policy.map(|p| p.settings.lock.clone()).unwrap_or_default();
                Self::check_lock_trigger(trigger, &lock)?;
            }
            ActionDetails::Screenshot { .. }
                if policy.is_some_and(|p| !p.settings.monitoring.enable_screenshot) =>
            {
                return Err(FleetError::PolicyViolation(
                    "screenshots are disabled by policy".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Decide whether a non-operator lock is legitimate under `lock`.
    pub fn check_lock_trigger(trigger: &LockTrigger, lock: &LockSettings) -> Result<(), FleetError> {
        match trigger {
            LockTrigger::Admin => Err(FleetError::PolicyViolation(
                "admin-triggered lock requires an operator".into(),
            )),
            LockTrigger::Hotkey if !lock.manual_lock_enabled => Err(FleetError::PolicyViolation(
                "manual lock is disabled by policy".into(),
            )),
            LockTrigger::Hotkey => Ok(()),
            LockTrigger::IdleTimeout { idle_seconds } => {
                if *idle_seconds >= lock.idle_timeout_seconds {
                    Ok(())
                } else {
                    Err(FleetError::PolicyViolation(format!(
                        "idle for {idle_seconds}s, policy requires {}s",
                        lock.idle_timeout_seconds
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetlock_types::{PolicyId, PolicyScope, PolicyTemplate, Role};

    fn gate() -> ActionGate {
        ActionGate::new(CapabilityManager::with_defaults())
    }

    fn kiosk_policy() -> Policy {
        let now = Utc::now();
        Policy {
            id: PolicyId::new(),
            name: "kiosk".into(),
            description: String::new(),
            scope: PolicyScope::Group,
            settings: PolicyTemplate::Kiosk.settings(),
            priority: 10,
            is_active: true,
            created_at: now,
            updated_at: now,
            created_by: None,
        }
    }

    fn lock(trigger: LockTrigger) -> ActionDetails {
        ActionDetails::Lock { trigger }
    }

    #[test]
    fn operator_needs_capability_for_action_type() {
        let g = gate();
        let d = DeviceId::new();
        let auditor = Actor::user("audit", Role::Auditor);
        let restart = ActionDetails::for_type(ActionType::Restart);
        let shot = ActionDetails::for_type(ActionType::Screenshot);
        assert!(matches!(
            g.authorize_action(&auditor, d, &restart, None),
            Err(FleetError::Forbidden { capability: Capability::RestartDevice, .. })
        ));
        assert!(g.authorize_action(&auditor, d, &shot, None).is_ok());
    }

    #[test]
    fn operator_locks_ignore_policy() {
        let g = gate();
        let p = kiosk_policy();
        let admin = Actor::user("root", Role::Superadmin);
        assert!(
            g.authorize_action(&admin, DeviceId::new(), &lock(LockTrigger::Hotkey), Some(&p))
                .is_ok()
        );
    }

    #[test]
    fn hotkey_lock_refused_when_manual_lock_disabled() {
        let g = gate();
        let d = DeviceId::new();
        let agent = Actor::Device { device_id: d };
        let p = kiosk_policy();
        assert!(matches!(
            g.authorize_action(&agent, d, &lock(LockTrigger::Hotkey), Some(&p)),
            Err(FleetError::PolicyViolation(_))
        ));
        assert!(g.authorize_action(&agent, d, &lock(LockTrigger::Hotkey), None).is_ok());
    }

    #[test]
    fn idle_lock_honours_policy_timeout() {
        let g = gate();
        let d = DeviceId::new();
        let agent = Actor::Device { device_id: d };
        let p = kiosk_policy(); // 60 s
        let idle = |s| lock(LockTrigger::IdleTimeout { idle_seconds: s });
        assert!(g.authorize_action(&agent, d, &idle(59), Some(&p)).is_err());
        assert!(g.authorize_action(&agent, d, &idle(60), Some(&p)).is_ok());
        // Stock 300 s without a policy.
        assert!(g.authorize_action(&agent, d, &idle(120), None).is_err());
        assert!(g.authorize_action(&agent, d, &idle(300), None).is_ok());
    }

    #[test]
    fn device_may_only_lock_itself() {
        let g = gate();
        let d = DeviceId::new();
        let agent = Actor::Device { device_id: d };
        let hotkey = lock(LockTrigger::Hotkey);
        assert!(g.authorize_action(&agent, DeviceId::new(), &hotkey, None).is_err());
        let unlock = ActionDetails::for_type(ActionType::Unlock);
        assert!(matches!(
            g.authorize_action(&agent, d, &unlock, None),
            Err(FleetError::Forbidden { .. })
        ));
    }

    #[test]
    fn system_lock_needs_a_trigger() {
        let g = gate();
        assert!(matches!(
            g.authorize_action(&Actor::System, DeviceId::new(), &lock(LockTrigger::Admin), None),
            Err(FleetError::PolicyViolation(_))
        ));
        let screenshot = ActionDetails::for_type(ActionType::Screenshot);
        assert!(g.authorize_action(&Actor::System, DeviceId::new(), &screenshot, None).is_ok());
    }

    #[test]
    fn screenshot_refused_when_policy_disables_it() {
        let g = gate();
        let d = DeviceId::new();
        let admin = Actor::user("root", Role::Superadmin);
        let shot = ActionDetails::for_type(ActionType::Screenshot);
        let mut p = kiosk_policy();
        assert!(g.authorize_action(&admin, d, &shot, Some(&p)).is_ok());

        p.settings.monitoring.enable_screenshot = false;
        assert!(matches!(
            g.authorize_action(&admin, d, &shot, Some(&p)),
            Err(FleetError::PolicyViolation(_))
        ));
        // Other action types are unaffected.
        let restart = ActionDetails::for_type(ActionType::Restart);
        assert!(g.authorize_action(&admin, d, &restart, Some(&p)).is_ok());
    }

    #[test]
    fn revoked_capability_takes_effect() {
        let mut g = gate();
        g.capabilities_mut().revoke(Role::Security, Capability::LockDevice);
        let sec = Actor::user("sec", Role::Security);
        assert!(
            g.authorize_action(&sec, DeviceId::new(), &lock(LockTrigger::Admin), None)
                .is_err()
        );
    }
}
