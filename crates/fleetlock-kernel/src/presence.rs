//! Presence – online/offline classification from heartbeat recency.
//!
//! A device is online when its last heartbeat is strictly less than
//! [`ONLINE_THRESHOLD_SECONDS`] old.  The threshold is a fixed constant and is
//! not tuned by any policy; a policy's heartbeat interval only affects how
//! often the agent reports.
//!
//! [`PresenceTracker`] remembers the last classification of every device so
//! that both the heartbeat path and the periodic decay scan report each flip
//! exactly once.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use fleetlock_types::{Device, DeviceId, DeviceStatus, Presence};

/// Staleness threshold: five minutes.
pub const ONLINE_THRESHOLD_SECONDS: i64 = 300;

pub fn online_threshold() -> TimeDelta {
    TimeDelta::seconds(ONLINE_THRESHOLD_SECONDS)
}

/// `now - last_seen < 5 min`.  A device that never reported is offline.
pub fn is_online(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_seen {
        Some(seen) => now - seen < online_threshold(),
        None => false,
    }
}

pub fn presence_of(device: &Device, now: DateTime<Utc>) -> Presence {
    if is_online(device.last_seen, now) {
        Presence::Online
    } else {
        Presence::Offline
    }
}

/// The operator-facing status of `device` at `now`.
///
/// Staleness always wins over whatever the agent last claimed; among live
/// devices an agent-reported error outranks the lock flag.
pub fn derive_status(device: &Device, now: DateTime<Utc>) -> DeviceStatus {
    if !is_online(device.last_seen, now) {
        return DeviceStatus::Offline;
    }
    match device.reported_status {
        DeviceStatus::Error => DeviceStatus::Error,
        _ if device.is_locked => DeviceStatus::Locked,
        DeviceStatus::Unlocked => DeviceStatus::Unlocked,
        _ => DeviceStatus::Online,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PresenceTracker
// ────────────────────────────────────────────────────────────────────────────

/// A single online/offline flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceTransition {
    pub device_id: DeviceId,
    pub from: Presence,
    pub to: Presence,
}

/// Remembers the last reported presence of each device.
///
/// Devices the tracker has never seen are assumed offline, so the first
/// heartbeat of a new device yields an offline → online transition.
///
/// # Example
///
/// ```
/// use chrono::{TimeDelta, Utc};
/// use fleetlock_kernel::presence::PresenceTracker;
/// use fleetlock_types::{DeviceId, Presence};
///
/// let mut tracker = PresenceTracker::new();
/// let id = DeviceId::new();
/// let now = Utc::now();
///
/// let t = tracker.observe(id, Some(now), now).unwrap();
/// assert_eq!(t.to, Presence::Online);
///
/// // Same classification again: nothing to report.
/// assert!(tracker.observe(id, Some(now), now).is_none());
///
/// let later = now + TimeDelta::minutes(5);
/// assert_eq!(tracker.observe(id, Some(now), later).unwrap().to, Presence::Offline);
/// ```
#[derive(Debug, Default)]
pub struct PresenceTracker {
    last: HashMap<DeviceId, Presence>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `device_id` at `now` and return the transition, if any.
    pub fn observe(
        &mut self,
        device_id: DeviceId,
        last_seen: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<PresenceTransition> {
        let to = if is_online(last_seen, now) {
            Presence::Online
        } else {
            Presence::Offline
        };
        let from = self
            .last
            .insert(device_id, to)
            .unwrap_or(Presence::Offline);
        (from != to).then_some(PresenceTransition { device_id, from, to })
    }

    /// Reclassify every device in `devices` and collect the flips.
    pub fn scan<'a>(
        &mut self,
        devices: impl IntoIterator<Item = &'a Device>,
        now: DateTime<Utc>,
    ) -> Vec<PresenceTransition> {
        devices
            .into_iter()
            .filter_map(|d| self.observe(d.id, d.last_seen, now))
            .collect()
    }

    /// Last classification reported for `device_id`.
    pub fn last_known(&self, device_id: &DeviceId) -> Option<Presence> {
        self.last.get(device_id).copied()
    }

    /// Drop all memory of `device_id` (e.g. after deactivation).
    pub fn forget(&mut self, device_id: &DeviceId) {
        self.last.remove(device_id);
    }
}
