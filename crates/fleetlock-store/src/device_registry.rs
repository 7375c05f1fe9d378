//! Device Registry.
//!
//! Holds device identity and last-known state, the device groups, and the
//! membership index between the two.  All writes go through a single
//! reader/writer lock, which also gives per-device heartbeat serialization:
//! a heartbeat is applied completely before the next one for the same device
//! is looked at.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use fleetlock_store::device_registry::DeviceRegistry;
//! use fleetlock_types::{DeviceIdentity, DeviceProfile, Heartbeat};
//!
//! let registry = DeviceRegistry::new();
//! let identity = DeviceIdentity {
//!     hostname: "ws-001".into(),
//!     mac_address: Some("aa:bb:cc:dd:ee:ff".into()),
//!     external_id: None,
//! };
//! let device = registry.register(&identity, DeviceProfile::default(), Utc::now()).unwrap();
//!
//! // The same hardware cannot be registered twice while active.
//! assert!(registry.register(&identity, DeviceProfile::default(), Utc::now()).is_err());
//!
//! let receipt = registry.record_heartbeat(&Heartbeat::alive(device.id), Utc::now()).unwrap();
//! assert!(receipt.applied);
//! assert!(receipt.device.last_seen.is_some());
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use fleetlock_kernel::presence;
use fleetlock_types::{
    Device, DeviceGroup, DeviceId, DeviceIdentity, DeviceProfile, EntityKind, FleetError,
    FleetResult, GroupId, Heartbeat,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of [`DeviceRegistry::record_heartbeat`].
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatReceipt {
    /// The device after the heartbeat (unchanged when not applied).
    pub device: Device,
    /// `false` when the heartbeat carried a sequence number that did not
    /// advance past the last applied one.
    pub applied: bool,
}

/// Point-in-time fleet totals over active devices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FleetStats {
    pub total_devices: usize,
    pub online_devices: usize,
    pub offline_devices: usize,
    pub locked_devices: usize,
    pub online_percentage: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryState {
    devices: HashMap<DeviceId, Device>,
    /// Natural key → id, active devices only.
    natural_keys: HashMap<String, DeviceId>,
    groups: HashMap<GroupId, DeviceGroup>,
    members: HashMap<GroupId, BTreeSet<DeviceId>>,
    memberships: HashMap<DeviceId, BTreeSet<GroupId>>,
}

impl RegistryState {
    fn device_mut(&mut self, id: &DeviceId) -> FleetResult<&mut Device> {
        self.devices
            .get_mut(id)
            .ok_or_else(|| FleetError::not_found(EntityKind::Device, id))
    }

    fn ensure_group(&self, id: &GroupId) -> FleetResult<()> {
        if self.groups.contains_key(id) {
            Ok(())
        } else {
            Err(FleetError::not_found(EntityKind::Group, id))
        }
    }

    fn group_name_taken(&self, name: &str, except: Option<GroupId>) -> bool {
        self.groups
            .values()
            .any(|g| Some(g.id) != except && g.name.eq_ignore_ascii_case(name))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DeviceRegistry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct DeviceRegistry {
    state: RwLock<RegistryState>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // ── Devices ──────────────────────────────────────────────────────────────

    /// Register a new device under a fresh id.
    ///
    /// Fails with [`FleetError::DuplicateIdentity`] when an active device
    /// already holds the same natural key.
    pub fn register(
        &self,
        identity: &DeviceIdentity,
        profile: DeviceProfile,
        now: DateTime<Utc>,
    ) -> FleetResult<Device> {
        if identity.hostname.trim().is_empty() {
            return Err(FleetError::InvalidRequest("hostname is required".into()));
        }
        let key = identity.natural_key();
        let mut state = self.write();
        if state.natural_keys.contains_key(&key) {
            return Err(FleetError::DuplicateIdentity(key));
        }
        let device = Device::register(DeviceId::new(), identity, profile, now);
        state.natural_keys.insert(key, device.id);
        state.devices.insert(device.id, device.clone());
        info!(device_id = %device.id, hostname = %device.hostname, "device registered");
        Ok(device)
    }

    pub fn get(&self, id: &DeviceId) -> FleetResult<Device> {
        self.read()
            .devices
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::not_found(EntityKind::Device, id))
    }

    /// Like [`get`](Self::get) but also rejects deactivated devices.
    pub fn get_active(&self, id: &DeviceId) -> FleetResult<Device> {
        let device = self.get(id)?;
        if device.is_active {
            Ok(device)
        } else {
            Err(FleetError::DeviceInactive(*id))
        }
    }

    /// All devices ordered by name, then id.
    pub fn list(&self, include_inactive: bool) -> Vec<Device> {
        let state = self.read();
        let mut out: Vec<Device> = state
            .devices
            .values()
            .filter(|d| include_inactive || d.is_active)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    /// Apply an agent heartbeat.
    ///
    /// Overwrites the lock flag, reported status and metrics, merges metadata
    /// key by key, and moves `last_seen` forward (never backwards).  A
    /// heartbeat whose `sequence` does not exceed the last applied one is
    /// ignored and reported with `applied == false`.
    pub fn record_heartbeat(
        &self,
        heartbeat: &Heartbeat,
        now: DateTime<Utc>,
    ) -> FleetResult<HeartbeatReceipt> {
        let mut state = self.write();
        let device = state.device_mut(&heartbeat.device_id)?;
        if !device.is_active {
            return Err(FleetError::DeviceInactive(device.id));
        }

        if let (Some(seq), Some(last)) = (heartbeat.sequence, device.heartbeat_sequence) {
            if seq <= last {
                debug!(device_id = %device.id, seq, last, "stale heartbeat ignored");
                return Ok(HeartbeatReceipt {
                    device: device.clone(),
                    applied: false,
                });
            }
        }

        device.last_seen = Some(device.last_seen.map_or(now, |seen| seen.max(now)));
        device.reported_status = heartbeat.status;
        device.is_locked = heartbeat.is_locked;
        device.metrics = heartbeat.metrics;
        if let Some(v) = &heartbeat.agent_version {
            device.agent_version = v.clone();
        }
        if let Some(ip) = &heartbeat.ip_address {
            device.ip_address = Some(ip.clone());
        }
        for (k, v) in &heartbeat.metadata {
            device.metadata.insert(k.clone(), v.clone());
        }
        if heartbeat.sequence.is_some() {
            device.heartbeat_sequence = heartbeat.sequence;
        }
        debug!(device_id = %device.id, status = %device.reported_status, "heartbeat applied");
        Ok(HeartbeatReceipt {
            device: device.clone(),
            applied: true,
        })
    }

    /// Record the lock state reached by a completed lock or unlock action.
    pub fn apply_lock_state(
        &self,
        id: &DeviceId,
        locked: bool,
        at: DateTime<Utc>,
    ) -> FleetResult<Device> {
        let mut state = self.write();
        let device = state.device_mut(id)?;
        device.is_locked = locked;
        if locked {
            device.last_lock_time = Some(at);
        } else {
            device.last_unlock_time = Some(at);
        }
        Ok(device.clone())
    }

    /// Soft-delete a device.  The record and its history stay; the natural key
    /// is released so the hardware may register again.
    pub fn deactivate(&self, id: &DeviceId) -> FleetResult<Device> {
        let mut state = self.write();
        let device = state.device_mut(id)?;
        if !device.is_active {
            return Ok(device.clone());
        }
        device.is_active = false;
        let deactivated = device.clone();
        let key = deactivated.identity().natural_key();
        if state.natural_keys.get(&key) == Some(id) {
            state.natural_keys.remove(&key);
        }
        info!(device_id = %id, "device deactivated");
        Ok(deactivated)
    }

    /// Active devices whose `last_seen` falls in `[from, to)`, oldest first.
    ///
    /// With `from = now - 1h` and `to = now - 5min` this yields devices that
    /// went offline within the last hour.
    pub fn last_seen_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Device> {
        let state = self.read();
        let mut out: Vec<Device> = state
            .devices
            .values()
            .filter(|d| d.is_active)
            .filter(|d| d.last_seen.is_some_and(|seen| seen >= from && seen < to))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.last_seen.cmp(&b.last_seen).then(a.id.cmp(&b.id)));
        out
    }

    pub fn stats(&self, now: DateTime<Utc>) -> FleetStats {
        let state = self.read();
        let active = state.devices.values().filter(|d| d.is_active);
        let (mut total, mut online, mut locked) = (0usize, 0usize, 0usize);
        for d in active {
            total += 1;
            if presence::is_online(d.last_seen, now) {
                online += 1;
            }
            if d.is_locked {
                locked += 1;
            }
        }
        let online_percentage = if total == 0 {
            0.0
        } else {
            online as f64 * 100.0 / total as f64
        };
        FleetStats {
            total_devices: total,
            online_devices: online,
            offline_devices: total - online,
            locked_devices: locked,
            online_percentage,
        }
    }

    // ── Groups ───────────────────────────────────────────────────────────────

    pub fn create_group(
        &self,
        name: &str,
        description: &str,
        created_by: Option<String>,
        now: DateTime<Utc>,
    ) -> FleetResult<DeviceGroup> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FleetError::InvalidRequest("group name is required".into()));
        }
        let mut state = self.write();
        if state.group_name_taken(name, None) {
            return Err(FleetError::DuplicateIdentity(format!("group:{name}")));
        }
        let group = DeviceGroup {
            id: GroupId::new(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: now,
            created_by,
        };
        state.groups.insert(group.id, group.clone());
        state.members.insert(group.id, BTreeSet::new());
        info!(group_id = %group.id, name = %group.name, "device group created");
        Ok(group)
    }

    pub fn rename_group(
        &self,
        id: &GroupId,
        name: &str,
        description: Option<&str>,
    ) -> FleetResult<DeviceGroup> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FleetError::InvalidRequest("group name is required".into()));
        }
        let mut state = self.write();
        state.ensure_group(id)?;
        if state.group_name_taken(name, Some(*id)) {
            return Err(FleetError::DuplicateIdentity(format!("group:{name}")));
        }
        let group = state
            .groups
            .get_mut(id)
            .ok_or_else(|| FleetError::not_found(EntityKind::Group, id))?;
        group.name = name.to_string();
        if let Some(desc) = description {
            group.description = desc.to_string();
        }
        Ok(group.clone())
    }

    /// Remove a group and its memberships.  Callers check for assignments
    /// first; the registry does not know about policies.
    pub fn delete_group(&self, id: &GroupId) -> FleetResult<DeviceGroup> {
        let mut state = self.write();
        let group = state
            .groups
            .remove(id)
            .ok_or_else(|| FleetError::not_found(EntityKind::Group, id))?;
        if let Some(members) = state.members.remove(id) {
            for device in members {
                if let Some(set) = state.memberships.get_mut(&device) {
                    set.remove(id);
                }
            }
        }
        info!(group_id = %id, "device group deleted");
        Ok(group)
    }

    pub fn get_group(&self, id: &GroupId) -> FleetResult<DeviceGroup> {
        self.read()
            .groups
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::not_found(EntityKind::Group, id))
    }

    pub fn list_groups(&self) -> Vec<DeviceGroup> {
        let mut out: Vec<DeviceGroup> = self.read().groups.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    /// Add `device` to `group`.  Returns `false` if it was already a member.
    pub fn add_member(&self, group: &GroupId, device: &DeviceId) -> FleetResult<bool> {
        let mut state = self.write();
        state.ensure_group(group)?;
        state.device_mut(device)?;
        let added = state.members.entry(*group).or_default().insert(*device);
        state.memberships.entry(*device).or_default().insert(*group);
        Ok(added)
    }

    /// Remove `device` from `group`.  Returns `false` if it was not a member.
    pub fn remove_member(&self, group: &GroupId, device: &DeviceId) -> FleetResult<bool> {
        let mut state = self.write();
        state.ensure_group(group)?;
        let removed = state
            .members
            .get_mut(group)
            .is_some_and(|set| set.remove(device));
        if let Some(set) = state.memberships.get_mut(device) {
            set.remove(group);
        }
        Ok(removed)
    }

    /// Groups `device` belongs to, in id order.
    pub fn groups_of(&self, device: &DeviceId) -> Vec<GroupId> {
        self.read()
            .memberships
            .get(device)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn members_of(&self, group: &GroupId) -> FleetResult<Vec<DeviceId>> {
        let state = self.read();
        state.ensure_group(group)?;
        Ok(state
            .members
            .get(group)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use fleetlock_types::DeviceStatus;
    use serde_json::json;

    fn identity(host: &str, mac: &str) -> DeviceIdentity {
        DeviceIdentity {
            hostname: host.into(),
            mac_address: Some(mac.into()),
            external_id: None,
        }
    }

    fn registered(reg: &DeviceRegistry, host: &str) -> Device {
        reg.register(&identity(host, "00:11:22:33:44:55"), DeviceProfile::default(), Utc::now())
            .unwrap()
    }

    #[test]
    fn duplicate_natural_key_is_rejected_while_active() {
        let reg = DeviceRegistry::new();
        let d = registered(&reg, "pc-1");
        let err = reg
            .register(&identity("PC-1", "00-11-22-33-44-55"), DeviceProfile::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, FleetError::DuplicateIdentity(_)));

        reg.deactivate(&d.id).unwrap();
        let again = registered(&reg, "pc-1");
        assert_ne!(again.id, d.id);
    }

    #[test]
    fn blank_hostname_is_rejected() {
        let reg = DeviceRegistry::new();
        let err = reg
            .register(&identity(" ", "aa"), DeviceProfile::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidRequest(_)));
    }

    #[test]
    fn heartbeat_for_unknown_device_is_not_found() {
        let reg = DeviceRegistry::new();
        let err = reg
            .record_heartbeat(&Heartbeat::alive(DeviceId::new()), Utc::now())
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound { kind: EntityKind::Device, .. }));
    }

    #[test]
    fn heartbeat_merges_metadata_and_overwrites_state() {
        let reg = DeviceRegistry::new();
        let d = registered(&reg, "pc-2");
        let now = Utc::now();

        let mut hb = Heartbeat::alive(d.id);
        hb.metadata.insert("os_build".into(), json!("22631"));
        hb.metadata.insert("user".into(), json!("kim"));
        hb.metrics.cpu_usage = Some(40.0);
        hb.is_locked = true;
        reg.record_heartbeat(&hb, now).unwrap();

        let mut hb = Heartbeat::alive(d.id);
        hb.metadata.insert("user".into(), json!("lee"));
        hb.status = DeviceStatus::Unlocked;
        let after = reg.record_heartbeat(&hb, now).unwrap().device;

        assert_eq!(after.metadata["os_build"], json!("22631"));
        assert_eq!(after.metadata["user"], json!("lee"));
        assert!(!after.is_locked);
        assert_eq!(after.metrics.cpu_usage, None);
        assert_eq!(after.reported_status, DeviceStatus::Unlocked);
    }

    #[test]
    fn stale_sequence_is_ignored() {
        let reg = DeviceRegistry::new();
        let d = registered(&reg, "pc-3");
        let t0 = Utc::now();

        let mut hb = Heartbeat::alive(d.id);
        hb.sequence = Some(7);
        hb.is_locked = true;
        assert!(reg.record_heartbeat(&hb, t0).unwrap().applied);

        let mut late = Heartbeat::alive(d.id);
        late.sequence = Some(6);
        let receipt = reg.record_heartbeat(&late, t0 + TimeDelta::seconds(1)).unwrap();
        assert!(!receipt.applied);
        assert!(receipt.device.is_locked);
        assert_eq!(receipt.device.last_seen, Some(t0));
        assert_eq!(receipt.device.heartbeat_sequence, Some(7));
    }

    #[test]
    fn last_seen_never_moves_backwards() {
        let reg = DeviceRegistry::new();
        let d = registered(&reg, "pc-4");
        let t0 = Utc::now();
        reg.record_heartbeat(&Heartbeat::alive(d.id), t0).unwrap();
        let after = reg
            .record_heartbeat(&Heartbeat::alive(d.id), t0 - TimeDelta::seconds(30))
            .unwrap()
            .device;
        assert_eq!(after.last_seen, Some(t0));
    }

    #[test]
    fn inactive_device_rejects_heartbeats() {
        let reg = DeviceRegistry::new();
        let d = registered(&reg, "pc-5");
        reg.deactivate(&d.id).unwrap();
        assert!(matches!(
            reg.record_heartbeat(&Heartbeat::alive(d.id), Utc::now()),
            Err(FleetError::DeviceInactive(_))
        ));
        assert!(reg.get(&d.id).is_ok());
        assert!(reg.get_active(&d.id).is_err());
        assert!(reg.list(false).is_empty());
        assert_eq!(reg.list(true).len(), 1);
    }

    #[test]
    fn last_seen_range_query() {
        let reg = DeviceRegistry::new();
        let now = Utc::now();
        let old = registered(&reg, "old");
        let recent = registered(&reg, "recent");
        let _never = registered(&reg, "never");
        reg.record_heartbeat(&Heartbeat::alive(old.id), now - TimeDelta::minutes(90))
            .unwrap();
        reg.record_heartbeat(&Heartbeat::alive(recent.id), now - TimeDelta::minutes(20))
            .unwrap();

        let hits = reg.last_seen_between(now - TimeDelta::hours(1), now - TimeDelta::minutes(5));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, recent.id);
    }

    #[test]
    fn stats_count_presence_and_locks() {
        let reg = DeviceRegistry::new();
        let now = Utc::now();
        let a = registered(&reg, "a");
        let b = registered(&reg, "b");
        registered(&reg, "c");
        let mut hb = Heartbeat::alive(a.id);
        hb.is_locked = true;
        reg.record_heartbeat(&hb, now).unwrap();
        reg.record_heartbeat(&Heartbeat::alive(b.id), now - TimeDelta::minutes(10))
            .unwrap();

        let s = reg.stats(now);
        assert_eq!(s.total_devices, 3);
        assert_eq!(s.online_devices, 1);
        assert_eq!(s.offline_devices, 2);
        assert_eq!(s.locked_devices, 1);
        assert!((s.online_percentage - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn membership_index_is_kept_both_ways() {
        let reg = DeviceRegistry::new();
        let d = registered(&reg, "lab-1");
        let g1 = reg.create_group("Lab", "", None, Utc::now()).unwrap();
        let g2 = reg.create_group("Floor 2", "", None, Utc::now()).unwrap();

        assert!(reg.add_member(&g1.id, &d.id).unwrap());
        assert!(!reg.add_member(&g1.id, &d.id).unwrap());
        reg.add_member(&g2.id, &d.id).unwrap();

        let mut expected = vec![g1.id, g2.id];
        expected.sort();
        assert_eq!(reg.groups_of(&d.id), expected);
        assert_eq!(reg.members_of(&g1.id).unwrap(), vec![d.id]);

        reg.delete_group(&g1.id).unwrap();
        assert_eq!(reg.groups_of(&d.id), vec![g2.id]);

        assert!(reg.remove_member(&g2.id, &d.id).unwrap());
        assert!(reg.groups_of(&d.id).is_empty());
    }

    #[test]
    fn group_names_are_unique_case_insensitively() {
        let reg = DeviceRegistry::new();
        let g = reg.create_group("Kiosks", "", None, Utc::now()).unwrap();
        assert!(reg.create_group("kiosks", "", None, Utc::now()).is_err());
        let other = reg.create_group("Laptops", "", None, Utc::now()).unwrap();
        assert!(reg.rename_group(&other.id, "KIOSKS", None).is_err());
        let renamed = reg.rename_group(&g.id, "Lobby kiosks", Some("ground floor")).unwrap();
        assert_eq!(renamed.description, "ground floor");
    }

    #[test]
    fn lock_state_side_effects_stamp_times() {
        let reg = DeviceRegistry::new();
        let d = registered(&reg, "pc-9");
        let t = Utc::now();
        let locked = reg.apply_lock_state(&d.id, true, t).unwrap();
        assert!(locked.is_locked);
        assert_eq!(locked.last_lock_time, Some(t));
        let unlocked = reg.apply_lock_state(&d.id, false, t).unwrap();
        assert!(!unlocked.is_locked);
        assert_eq!(unlocked.last_unlock_time, Some(t));
    }
}
