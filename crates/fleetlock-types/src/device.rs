//! Device records, groups, and the heartbeat contract.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DeviceId, GroupId};

/// Status an agent reports, and the status the server derives from it.
///
/// Only the derived value is shown to operators; see
/// `fleetlock_kernel::presence::derive_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
    Locked,
    Unlocked,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Locked => "locked",
            DeviceStatus::Unlocked => "unlocked",
            DeviceStatus::Error => "error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary presence classification derived from heartbeat recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

/// The natural key material supplied at registration.
///
/// A device is identified either by an explicit `external_id` or, failing
/// that, by the `hostname` + `mac_address` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub hostname: String,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
}

impl DeviceIdentity {
    /// Canonical natural key used for duplicate detection.
    ///
    /// Comparison is case-insensitive; MAC separators are normalised so that
    /// `AA-BB-..` and `aa:bb:..` collide.
    pub fn natural_key(&self) -> String {
        if let Some(ext) = self.external_id.as_deref().filter(|e| !e.trim().is_empty()) {
            return format!("ext:{}", ext.trim().to_lowercase());
        }
        let mac = self
            .mac_address
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_lowercase()
            .replace('-', ":");
        format!("host:{}|{}", self.hostname.trim().to_lowercase(), mac)
    }
}

/// Descriptive registration metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Display name; defaults to the hostname when empty.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub department: String,
}

/// Transient resource metrics carried by heartbeats (percentages).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    #[serde(default)]
    pub cpu_usage: Option<f32>,
    #[serde(default)]
    pub memory_usage: Option<f32>,
    #[serde(default)]
    pub disk_usage: Option<f32>,
}

/// A managed endpoint.
///
/// `reported_status` is whatever the agent last claimed; the operator-facing
/// status is always re-derived against `last_seen`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub hostname: String,
    pub mac_address: Option<String>,
    pub external_id: Option<String>,
    pub ip_address: Option<String>,
    pub os_version: String,
    pub agent_version: String,
    pub location: String,
    pub department: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_locked: bool,
    pub reported_status: DeviceStatus,
    pub metrics: DeviceMetrics,
    /// Free-form agent metadata, merged key-by-key on every heartbeat.
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub registered_at: DateTime<Utc>,
    pub last_lock_time: Option<DateTime<Utc>>,
    pub last_unlock_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    /// Sequence number of the last applied heartbeat, if the agent sends one.
    pub heartbeat_sequence: Option<u64>,
}

impl Device {
    /// Build a freshly registered, never-seen device.
    pub fn register(
        id: DeviceId,
        identity: &DeviceIdentity,
        profile: DeviceProfile,
        now: DateTime<Utc>,
    ) -> Self {
        let name = if profile.name.trim().is_empty() {
            identity.hostname.clone()
        } else {
            profile.name
        };
        Self {
            id,
            name,
            hostname: identity.hostname.clone(),
            mac_address: identity.mac_address.clone(),
            external_id: identity.external_id.clone(),
            ip_address: profile.ip_address,
            os_version: profile.os_version,
            agent_version: profile.agent_version,
            location: profile.location,
            department: profile.department,
            last_seen: None,
            is_locked: false,
            reported_status: DeviceStatus::Offline,
            metrics: DeviceMetrics::default(),
            metadata: BTreeMap::new(),
            registered_at: now,
            last_lock_time: None,
            last_unlock_time: None,
            is_active: true,
            heartbeat_sequence: None,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            hostname: self.hostname.clone(),
            mac_address: self.mac_address.clone(),
            external_id: self.external_id.clone(),
        }
    }
}

/// A named set of devices. Membership lives in the registry's index, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub id: GroupId,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

/// Heartbeat payload sent by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub device_id: DeviceId,
    #[serde(default = "default_reported_status")]
    pub status: DeviceStatus,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(flatten)]
    pub metrics: DeviceMetrics,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Monotonic per-agent counter; heartbeats that do not advance it are
    /// discarded.
    #[serde(default)]
    pub sequence: Option<u64>,
}

fn default_reported_status() -> DeviceStatus {
    DeviceStatus::Online
}

impl Heartbeat {
    /// Minimal "I'm alive" heartbeat.
    pub fn alive(device_id: DeviceId) -> Self {
        Self {
            device_id,
            status: DeviceStatus::Online,
            is_locked: false,
            metrics: DeviceMetrics::default(),
            agent_version: None,
            ip_address: None,
            metadata: BTreeMap::new(),
            sequence: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(host: &str, mac: Option<&str>, ext: Option<&str>) -> DeviceIdentity {
        DeviceIdentity {
            hostname: host.to_string(),
            mac_address: mac.map(str::to_string),
            external_id: ext.map(str::to_string),
        }
    }

    #[test]
    fn natural_key_prefers_external_id() {
        let a = identity("pc-01", Some("aa:bb"), Some("ASSET-9"));
        let b = identity("other", None, Some("asset-9"));
        assert_eq!(a.natural_key(), b.natural_key());
    }

    #[test]
    fn natural_key_normalises_hostname_and_mac() {
        let a = identity("PC-01", Some("AA-BB-CC-DD-EE-FF"), None);
        let b = identity("pc-01", Some("aa:bb:cc:dd:ee:ff"), None);
        assert_eq!(a.natural_key(), b.natural_key());
    }

    #[test]
    fn blank_external_id_falls_back_to_hostname() {
        let a = identity("pc-01", None, Some("  "));
        assert!(a.natural_key().starts_with("host:pc-01"));
    }

    #[test]
    fn register_defaults_name_to_hostname() {
        let now = Utc::now();
        let d = Device::register(
            DeviceId::new(),
            &identity("kiosk-7", None, None),
            DeviceProfile::default(),
            now,
        );
        assert_eq!(d.name, "kiosk-7");
        assert!(d.is_active);
        assert!(d.last_seen.is_none());
        assert_eq!(d.registered_at, now);
    }

    #[test]
    fn heartbeat_accepts_flat_metrics() {
        let id = DeviceId::new();
        let json = format!(
            r#"{{"device_id":"{id}","status":"locked","is_locked":true,"cpu_usage":12.5}}"#
        );
        let hb: Heartbeat = serde_json::from_str(&json).unwrap();
        assert_eq!(hb.status, DeviceStatus::Locked);
        assert!(hb.is_locked);
        assert_eq!(hb.metrics.cpu_usage, Some(12.5));
        assert!(hb.sequence.is_none());
    }
}
