//! [`CapabilityManager`] – the role → capability table.
//!
//! Roles carry no permissions of their own.  Before an action is created or a
//! policy is edited, call [`CapabilityManager::check`] with the caller's
//! [`Role`] and the [`Capability`] the operation needs.  A miss returns
//! [`FleetError::Forbidden`] and the operation must not proceed.

use std::collections::{HashMap, HashSet};

use fleetlock_types::{Capability, FleetError, Role};

/// Maps each [`Role`] to the set of [`Capability`] values it may exercise.
///
/// # Example
///
/// ```
/// use fleetlock_kernel::capability_manager::CapabilityManager;
/// use fleetlock_types::{Capability, Role};
///
/// let caps = CapabilityManager::with_defaults();
///
/// assert!(caps.check(Role::ItAdmin, Capability::RestartDevice).is_ok());
/// assert!(caps.check(Role::Security, Capability::RestartDevice).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CapabilityManager {
    grants: HashMap<Role, HashSet<Capability>>,
}

impl CapabilityManager {
    /// Create an empty table with no grants.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock table:
    ///
    /// | Capability | Roles |
    /// |---|---|
    /// | lock / unlock | superadmin, security, it_admin |
    /// | screenshot | superadmin, security, it_admin, auditor |
    /// | restart | superadmin, it_admin |
    /// | manage devices | superadmin, it_admin |
    /// | manage policies | superadmin, security |
    /// | view policies | every role except unlock_user |
    pub fn with_defaults() -> Self {
        use Capability::*;
        use Role::*;

        let mut mgr = Self::new();
        for role in [Superadmin, Security, ItAdmin] {
            mgr.grant(role, LockDevice);
            mgr.grant(role, UnlockDevice);
            mgr.grant(role, CaptureScreenshot);
        }
        mgr.grant(Auditor, CaptureScreenshot);
        for role in [Superadmin, ItAdmin] {
            mgr.grant(role, RestartDevice);
            mgr.grant(role, ManageDevices);
        }
        for role in [Superadmin, Security] {
            mgr.grant(role, ManagePolicies);
        }
        for role in [Superadmin, Security, ItAdmin, Auditor] {
            mgr.grant(role, ViewPolicies);
        }
        mgr
    }

    /// Grant `cap` to `role`.  Duplicate grants are ignored.
    pub fn grant(&mut self, role: Role, cap: Capability) {
        self.grants.entry(role).or_default().insert(cap);
    }

    /// Revoke `cap` from `role`.  No-op when it was never granted.
    pub fn revoke(&mut self, role: Role, cap: Capability) {
        if let Some(set) = self.grants.get_mut(&role) {
            set.remove(&cap);
        }
    }

    pub fn has(&self, role: Role, cap: Capability) -> bool {
        self.grants
            .get(&role)
            .map(|s| s.contains(&cap))
            .unwrap_or(false)
    }

    /// Return `Ok(())` when `role` holds `cap`, or [`FleetError::Forbidden`].
    pub fn check(&self, role: Role, cap: Capability) -> Result<(), FleetError> {
        if self.has(role, cap) {
            Ok(())
        } else {
            Err(FleetError::Forbidden {
                actor: role.to_string(),
                capability: cap,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlock_types::ActionType;

    #[test]
    fn empty_table_denies_everything() {
        let mgr = CapabilityManager::new();
        for role in Role::ALL {
            assert!(mgr.check(role, Capability::LockDevice).is_err());
        }
    }

    #[test]
    fn defaults_gate_lock_and_unlock_to_elevated_roles() {
        let mgr = CapabilityManager::with_defaults();
        for role in [Role::Superadmin, Role::Security, Role::ItAdmin] {
            assert!(mgr.check(role, Capability::LockDevice).is_ok());
            assert!(mgr.check(role, Capability::UnlockDevice).is_ok());
        }
        assert!(mgr.check(Role::Auditor, Capability::LockDevice).is_err());
        assert!(mgr.check(Role::UnlockUser, Capability::UnlockDevice).is_err());
    }

    #[test]
    fn auditor_may_only_screenshot() {
        let mgr = CapabilityManager::with_defaults();
        let allowed: Vec<ActionType> = ActionType::ALL
            .into_iter()
            .filter(|t| mgr.has(Role::Auditor, Capability::for_action(*t)))
            .collect();
        assert_eq!(allowed, vec![ActionType::Screenshot]);
    }

    #[test]
    fn restart_is_reserved_for_superadmin_and_it_admin() {
        let mgr = CapabilityManager::with_defaults();
        let allowed: Vec<Role> = Role::ALL
            .into_iter()
            .filter(|r| mgr.has(*r, Capability::RestartDevice))
            .collect();
        assert_eq!(allowed, vec![Role::Superadmin, Role::ItAdmin]);
    }

    #[test]
    fn policy_management_split() {
        let mgr = CapabilityManager::with_defaults();
        assert!(mgr.has(Role::Security, Capability::ManagePolicies));
        assert!(!mgr.has(Role::ItAdmin, Capability::ManagePolicies));
        assert!(mgr.has(Role::ItAdmin, Capability::ViewPolicies));
        assert!(!mgr.has(Role::UnlockUser, Capability::ViewPolicies));
    }

    #[test]
    fn revoke_removes_capability() {
        let mut mgr = CapabilityManager::with_defaults();
        mgr.revoke(Role::Security, Capability::LockDevice);
        let err = mgr.check(Role::Security, Capability::LockDevice).unwrap_err();
        assert_eq!(
            err,
            FleetError::Forbidden {
                actor: "security".into(),
                capability: Capability::LockDevice,
            }
        );
    }

    #[test]
    fn revoke_nonexistent_is_noop() {
        let mut mgr = CapabilityManager::new();
        mgr.revoke(Role::Auditor, Capability::RestartDevice);
        assert!(!mgr.has(Role::Auditor, Capability::RestartDevice));
    }

    #[test]
    fn duplicate_grant_is_idempotent() {
        let mut mgr = CapabilityManager::new();
        mgr.grant(Role::UnlockUser, Capability::UnlockDevice);
        mgr.grant(Role::UnlockUser, Capability::UnlockDevice);
        mgr.revoke(Role::UnlockUser, Capability::UnlockDevice);
        assert!(!mgr.has(Role::UnlockUser, Capability::UnlockDevice));
    }
}
