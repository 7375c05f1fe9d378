//! Policy Store.
//!
//! Storage and retrieval of [`Policy`] definitions and their
//! [`PolicyAssignment`]s.  The only logic here is invariant enforcement:
//!
//! - settings pass the [`PolicyValidator`] on create and update;
//! - an assignment has exactly one target (guaranteed by
//!   [`AssignmentTarget`]);
//! - at most one *active* assignment per (policy, target) pair;
//! - a policy, or a group, referenced by active assignments cannot be
//!   deleted.
//!
//! Resolution works on a [`PolicySnapshot`], a consistent copy taken under
//! one read lock.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use fleetlock_kernel::PolicyValidator;
use fleetlock_types::{
    AssignmentId, AssignmentTarget, EntityKind, FleetError, FleetResult, GroupId, Policy,
    PolicyAssignment, PolicyDraft, PolicyId,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A consistent read-only copy of all policies and assignments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub policies: Vec<Policy>,
    pub assignments: Vec<PolicyAssignment>,
}

#[derive(Default)]
struct PolicyState {
    policies: HashMap<PolicyId, Policy>,
    assignments: HashMap<AssignmentId, PolicyAssignment>,
}

impl PolicyState {
    fn active_assignments_of(&self, policy_id: &PolicyId) -> usize {
        self.assignments
            .values()
            .filter(|a| a.is_active && a.policy_id == *policy_id)
            .count()
    }

    fn has_active(&self, policy_id: &PolicyId, target: &AssignmentTarget) -> bool {
        self.assignments
            .values()
            .any(|a| a.is_active && a.policy_id == *policy_id && a.target == *target)
    }
}

pub struct PolicyStore {
    validator: PolicyValidator,
    state: RwLock<PolicyState>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_policies(policies: &mut [Policy]) {
    policies.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.created_at.cmp(&a.created_at))
            .then(a.id.cmp(&b.id))
    });
}

impl PolicyStore {
    /// A store enforcing the standard settings bounds.
    pub fn new() -> Self {
        Self::with_validator(PolicyValidator::with_bounds())
    }

    pub fn with_validator(validator: PolicyValidator) -> Self {
        Self {
            validator,
            state: RwLock::new(PolicyState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PolicyState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PolicyState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn check_draft(&self, draft: &PolicyDraft) -> FleetResult<()> {
        if draft.name.trim().is_empty() {
            return Err(FleetError::InvalidRequest("policy name is required".into()));
        }
        self.validator.validate(&draft.settings)
    }

    // ── Policies ─────────────────────────────────────────────────────────────

    pub fn create_policy(
        &self,
        draft: PolicyDraft,
        created_by: Option<String>,
        now: DateTime<Utc>,
    ) -> FleetResult<Policy> {
        self.check_draft(&draft)?;
        let policy = Policy {
            id: PolicyId::new(),
            name: draft.name.trim().to_string(),
            description: draft.description,
            scope: draft.scope,
            settings: draft.settings,
            priority: draft.priority,
            is_active: draft.is_active,
            created_at: now,
            updated_at: now,
            created_by,
        };
        self.write().policies.insert(policy.id, policy.clone());
        info!(policy_id = %policy.id, name = %policy.name, "policy created");
        Ok(policy)
    }

    /// Replace the editable fields of a policy.  `created_at` and
    /// `created_by` are kept; `updated_at` becomes `now`.
    pub fn update_policy(
        &self,
        id: &PolicyId,
        draft: PolicyDraft,
        now: DateTime<Utc>,
    ) -> FleetResult<Policy> {
        self.check_draft(&draft)?;
        let mut state = self.write();
        let policy = state
            .policies
            .get_mut(id)
            .ok_or_else(|| FleetError::not_found(EntityKind::Policy, id))?;
        policy.name = draft.name.trim().to_string();
        policy.description = draft.description;
        policy.scope = draft.scope;
        policy.settings = draft.settings;
        policy.priority = draft.priority;
        policy.is_active = draft.is_active;
        policy.updated_at = now;
        info!(policy_id = %id, "policy updated");
        Ok(policy.clone())
    }

    /// Delete a policy.  Fails with [`FleetError::ReferencedByAssignments`]
    /// while any active assignment points at it; inactive assignments are
    /// removed along with it.
    pub fn delete_policy(&self, id: &PolicyId) -> FleetResult<Policy> {
        let mut state = self.write();
        if !state.policies.contains_key(id) {
            return Err(FleetError::not_found(EntityKind::Policy, id));
        }
        let count = state.active_assignments_of(id);
        if count > 0 {
            return Err(FleetError::ReferencedByAssignments {
                kind: EntityKind::Policy,
                id: id.to_string(),
                count,
            });
        }
        state.assignments.retain(|_, a| a.policy_id != *id);
        let policy = state
            .policies
            .remove(id)
            .ok_or_else(|| FleetError::not_found(EntityKind::Policy, id))?;
        info!(policy_id = %id, "policy deleted");
        Ok(policy)
    }

    pub fn get_policy(&self, id: &PolicyId) -> FleetResult<Policy> {
        self.read()
            .policies
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::not_found(EntityKind::Policy, id))
    }

    /// All policies, highest priority first.
    pub fn list_policies(&self) -> Vec<Policy> {
        let mut out: Vec<Policy> = self.read().policies.values().cloned().collect();
        sort_policies(&mut out);
        out
    }

    // ── Assignments ──────────────────────────────────────────────────────────

    /// Link `policy_id` to `target`.  The caller has already checked that the
    /// target exists.
    pub fn assign(
        &self,
        policy_id: &PolicyId,
        target: AssignmentTarget,
        assigned_by: Option<String>,
        now: DateTime<Utc>,
    ) -> FleetResult<PolicyAssignment> {
        let mut state = self.write();
        if !state.policies.contains_key(policy_id) {
            return Err(FleetError::not_found(EntityKind::Policy, policy_id));
        }
        if state.has_active(policy_id, &target) {
            return Err(FleetError::DuplicateAssignment(target.to_string()));
        }
        let assignment = PolicyAssignment {
            id: AssignmentId::new(),
            policy_id: *policy_id,
            target,
            assigned_at: now,
            assigned_by,
            is_active: true,
        };
        state.assignments.insert(assignment.id, assignment.clone());
        info!(policy_id = %policy_id, target = %target, "policy assigned");
        Ok(assignment)
    }

    /// Turn an assignment on or off.  Re-activating fails with
    /// [`FleetError::DuplicateAssignment`] if another active assignment for
    /// the same pair appeared meanwhile.
    pub fn set_assignment_active(
        &self,
        id: &AssignmentId,
        active: bool,
        now: DateTime<Utc>,
    ) -> FleetResult<PolicyAssignment> {
        let mut state = self.write();
        let current = state
            .assignments
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::not_found(EntityKind::Assignment, id))?;
        if active && !current.is_active && state.has_active(&current.policy_id, &current.target) {
            return Err(FleetError::DuplicateAssignment(current.target.to_string()));
        }
        let assignment = state
            .assignments
            .get_mut(id)
            .ok_or_else(|| FleetError::not_found(EntityKind::Assignment, id))?;
        if assignment.is_active != active {
            assignment.is_active = active;
            assignment.assigned_at = now;
        }
        Ok(assignment.clone())
    }

    pub fn delete_assignment(&self, id: &AssignmentId) -> FleetResult<PolicyAssignment> {
        let removed = self
            .write()
            .assignments
            .remove(id)
            .ok_or_else(|| FleetError::not_found(EntityKind::Assignment, id))?;
        info!(assignment_id = %id, "policy assignment deleted");
        Ok(removed)
    }

    pub fn get_assignment(&self, id: &AssignmentId) -> FleetResult<PolicyAssignment> {
        self.read()
            .assignments
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::not_found(EntityKind::Assignment, id))
    }

    /// Assignments of one policy, oldest first.
    pub fn assignments_for_policy(&self, policy_id: &PolicyId) -> Vec<PolicyAssignment> {
        let mut out: Vec<PolicyAssignment> = self
            .read()
            .assignments
            .values()
            .filter(|a| a.policy_id == *policy_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Number of active assignments targeting `group`.
    pub fn active_assignments_for_group(&self, group: &GroupId) -> usize {
        let target = AssignmentTarget::Group(*group);
        self.read()
            .assignments
            .values()
            .filter(|a| a.is_active && a.target == target)
            .count()
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        let state = self.read();
        let mut policies: Vec<Policy> = state.policies.values().cloned().collect();
        sort_policies(&mut policies);
        let mut assignments: Vec<PolicyAssignment> = state.assignments.values().cloned().collect();
        assignments.sort_by_key(|a| a.id);
        PolicySnapshot {
            policies,
            assignments,
        }
    }
}
