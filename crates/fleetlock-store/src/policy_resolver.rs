//! Policy Resolver – device → effective policy.
//!
//! # Algorithm
//!
//! Candidates are gathered in three tiers:
//!
//! 1. **device** – active assignments targeting the device directly;
//! 2. **group** – active assignments targeting any group the device is in;
//! 3. **global** – every active policy with [`PolicyScope::Global`].
//!
//! Only active policies count in any tier.  Within a tier candidates are
//! ordered by priority (descending), then creation time (newest first), then
//! policy id (ascending), which is a total order.  Tiers are concatenated in
//! the order above and deduplicated by policy id, keeping the first
//! occurrence.  The head of that list is the effective policy; an empty list
//! means the device has no effective policy, which is a normal state.
//!
//! [`resolve`] reads nothing but its arguments, so identical inputs always
//! give identical output and it is safe to call from any number of threads.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use fleetlock_store::policy_resolver::{resolve, Tier};
//! use fleetlock_store::policy_store::PolicyStore;
//! use fleetlock_types::{
//!     AssignmentTarget, Device, DeviceId, DeviceIdentity, DeviceProfile, PolicyDraft, PolicyScope,
//! };
//!
//! let now = Utc::now();
//! let identity = DeviceIdentity { hostname: "d1".into(), mac_address: None, external_id: None };
//! let device = Device::register(DeviceId::new(), &identity, DeviceProfile::default(), now);
//!
//! let store = PolicyStore::new();
//! let global = store.create_policy(PolicyDraft::new("P0", PolicyScope::Global, 1), None, now).unwrap();
//! let direct = store.create_policy(PolicyDraft::new("P2", PolicyScope::Device, 0), None, now).unwrap();
//! store.assign(&direct.id, AssignmentTarget::Device(device.id), None, now).unwrap();
//!
//! let r = resolve(&store.snapshot(), &device, &[]);
//! assert_eq!(r.effective_policy.unwrap().id, direct.id);
//! assert_eq!(r.applied_policies[0].tier, Tier::Device);
//! assert_eq!(r.applied_policies[1].policy.id, global.id);
//! ```

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use fleetlock_types::{
    AssignmentId, AssignmentTarget, Device, DeviceId, GroupId, Policy, PolicyId, PolicyScope,
};
use serde::{Deserialize, Serialize};

use crate::policy_store::PolicySnapshot;

/// Precedence tier a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Device,
    Group,
    Global,
}

/// One entry of the ordered candidate list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPolicy {
    pub policy: Policy,
    pub tier: Tier,
    /// The assignment that brought the policy in; `None` for the global tier.
    pub assignment_id: Option<AssignmentId>,
}

/// Answer to a policy resolution query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub device_id: DeviceId,
    pub effective_policy: Option<Policy>,
    pub applied_policies: Vec<AppliedPolicy>,
    /// Latest change among the contributing policies and assignments, or the
    /// device's registration time when nothing applies.
    pub last_updated: DateTime<Utc>,
}

fn candidate_order(a: &Policy, b: &Policy) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(b.created_at.cmp(&a.created_at))
        .then(a.id.cmp(&b.id))
}

type Assigned<'a> = (&'a Policy, AssignmentId, DateTime<Utc>);

fn assigned_order(x: &Assigned<'_>, y: &Assigned<'_>) -> Ordering {
    candidate_order(x.0, y.0).then(x.1.cmp(&y.1))
}

/// Compute the effective policy of `device`, a member of `groups`.
pub fn resolve(snapshot: &PolicySnapshot, device: &Device, groups: &[GroupId]) -> Resolution {
    let active_policy = |id: PolicyId| {
        snapshot
            .policies
            .iter()
            .find(|p| p.id == id && p.is_active)
    };

    let mut device_tier: Vec<Assigned<'_>> = Vec::new();
    let mut group_tier: Vec<Assigned<'_>> = Vec::new();
    let mut stamps = Vec::new();

    for a in snapshot.assignments.iter().filter(|a| a.is_active) {
        let tier = match a.target {
            AssignmentTarget::Device(id) if id == device.id => Tier::Device,
            AssignmentTarget::Group(g) if groups.contains(&g) => Tier::Group,
            _ => continue,
        };
        let Some(policy) = active_policy(a.policy_id) else {
            continue;
        };
        let entry = (policy, a.id, a.assigned_at);
        match tier {
            Tier::Device => device_tier.push(entry),
            _ => group_tier.push(entry),
        }
    }

    device_tier.sort_by(assigned_order);
    group_tier.sort_by(assigned_order);

    let mut global_tier: Vec<&Policy> = snapshot
        .policies
        .iter()
        .filter(|p| p.is_active && p.scope == PolicyScope::Global)
        .collect();
    global_tier.sort_by(|a, b| candidate_order(a, b));

    let mut seen = HashSet::new();
    let mut applied = Vec::new();
    let tiered = device_tier
        .into_iter()
        .map(|(p, a, at)| (p, Tier::Device, Some((a, at))))
        .chain(
            group_tier
                .into_iter()
                .map(|(p, a, at)| (p, Tier::Group, Some((a, at)))),
        )
        .chain(global_tier.into_iter().map(|p| (p, Tier::Global, None)));

    for (policy, tier, via) in tiered {
        if !seen.insert(policy.id) {
            continue;
        }
        stamps.push(policy.updated_at);
        if let Some((_, assigned_at)) = via {
            stamps.push(assigned_at);
        }
        applied.push(AppliedPolicy {
            policy: policy.clone(),
            tier,
            assignment_id: via.map(|(id, _)| id),
        });
    }

    Resolution {
        device_id: device.id,
        effective_policy: applied.first().map(|a| a.policy.clone()),
        applied_policies: applied,
        last_updated: stamps.into_iter().max().unwrap_or(device.registered_at),
    }
}
