//! Daemon configuration – reads/writes `~/.fleetlock/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetlock_kernel::LockoutLimits;
use fleetlock_runtime::{ActionTimeouts, DispatchConfig};
use serde::{Deserialize, Serialize};

/// Unlock lockout limits for devices without an effective policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutDefaults {
    pub max_attempts: u32,
    pub duration_minutes: u32,
}

impl Default for LockoutDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            duration_minutes: 15,
        }
    }
}

/// Persisted daemon configuration stored in `~/.fleetlock/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Port of the agent/operator gateway (HTTP + WebSocket).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// SQLite file for the action ledger.  In-memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<String>,

    /// Seconds between timeout/presence sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    #[serde(default)]
    pub action_timeouts: ActionTimeouts,

    #[serde(default)]
    pub lockout_defaults: LockoutDefaults,

    /// Per-topic capacity of the event bus.
    #[serde(default = "default_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_listen_port() -> u16 {
    7070
}
fn default_sweep_interval() -> u64 {
    15
}
fn default_bus_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            ledger_path: None,
            sweep_interval_seconds: default_sweep_interval(),
            action_timeouts: ActionTimeouts::default(),
            lockout_defaults: LockoutDefaults::default(),
            event_bus_capacity: default_bus_capacity(),
        }
    }
}

impl Config {
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            timeouts: self.action_timeouts,
            lockout_defaults: LockoutLimits::new(
                self.lockout_defaults.max_attempts,
                self.lockout_defaults.duration_minutes,
            ),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

/// Return the path to `~/.fleetlock/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".fleetlock").join("config.toml")
}

/// Load the config from disk and apply environment overrides.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    Ok(load_from(&config_path())?.map(|mut cfg| {
        apply_env_overrides(&mut cfg);
        cfg
    }))
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `FLEETLOCK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FLEETLOCK_LISTEN_PORT` | `listen_port` |
/// | `FLEETLOCK_LEDGER_PATH` | `ledger_path` |
/// | `FLEETLOCK_SWEEP_INTERVAL` | `sweep_interval_seconds` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("FLEETLOCK_LISTEN_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.listen_port = port;
    }
    if let Ok(v) = std::env::var("FLEETLOCK_LEDGER_PATH")
        && !v.trim().is_empty()
    {
        cfg.ledger_path = Some(v);
    }
    if let Ok(v) = std::env::var("FLEETLOCK_SWEEP_INTERVAL")
        && let Ok(secs) = v.parse::<u64>()
        && secs > 0
    {
        cfg.sweep_interval_seconds = secs;
    }
}

/// Save the config to disk, creating `~/.fleetlock/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.listen_port, 7070);
        assert_eq!(loaded.sweep_interval_seconds, 15);
        assert_eq!(loaded.action_timeouts.restart, 600);
        assert_eq!(loaded.lockout_defaults.max_attempts, 3);
        assert_eq!(loaded.event_bus_capacity, 256);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "ledger_path = \"/var/lib/fleetlock/ledger.db\"\n\n[action_timeouts]\nlock = 45\n",
        )
        .unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.ledger_path.as_deref(), Some("/var/lib/fleetlock/ledger.db"));
        assert_eq!(cfg.action_timeouts.lock, 45);
        assert_eq!(cfg.action_timeouts.unlock, 300);
        assert_eq!(cfg.lockout_defaults, LockoutDefaults::default());
    }

    #[test]
    fn dispatch_config_carries_timeouts_and_lockout_defaults() {
        let mut cfg = Config::default();
        cfg.lockout_defaults.max_attempts = 5;
        cfg.action_timeouts.screenshot = 30;
        let dispatch = cfg.dispatch_config();
        assert_eq!(dispatch.lockout_defaults, LockoutLimits::new(5, 15));
        assert_eq!(dispatch.timeouts.screenshot, 30);
    }

    #[test]
    fn config_path_points_to_fleetlock_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".fleetlock"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn apply_env_overrides_changes_listen_port() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("FLEETLOCK_LISTEN_PORT", "9443") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.listen_port, 9443);
        unsafe { std::env::remove_var("FLEETLOCK_LISTEN_PORT") };
    }

    #[test]
    fn apply_env_overrides_changes_ledger_path() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("FLEETLOCK_LEDGER_PATH", "/tmp/ledger.db") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.ledger_path.as_deref(), Some("/tmp/ledger.db"));
        unsafe { std::env::remove_var("FLEETLOCK_LEDGER_PATH") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_interval() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("FLEETLOCK_SWEEP_INTERVAL", "soon") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.sweep_interval_seconds, 15);
        unsafe { std::env::remove_var("FLEETLOCK_SWEEP_INTERVAL") };
    }
}
