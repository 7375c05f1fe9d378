//! [`PolicyValidator`] – bounds checking for policy settings.
//!
//! Every policy create or update passes its [`PolicySettings`] through
//! [`PolicyValidator::validate`].  Rules run in insertion order and the first
//! violation is returned.  Out-of-range values are rejected, never clamped.

use fleetlock_types::{FleetError, PolicySettings};

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single invariant over [`PolicySettings`].
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, settings: &PolicySettings) -> Result<(), FleetError>;
}

// ────────────────────────────────────────────────────────────────────────────
// PolicyValidator
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use fleetlock_kernel::policy_validator::PolicyValidator;
/// use fleetlock_types::{FleetError, PolicySettings};
///
/// let validator = PolicyValidator::with_bounds();
///
/// let mut settings = PolicySettings::default();
/// assert!(validator.validate(&settings).is_ok());
///
/// settings.unlock.max_unlock_attempts = 0;
/// assert!(matches!(
///     validator.validate(&settings),
///     Err(FleetError::ValidationRange { .. })
/// ));
/// ```
#[derive(Default)]
pub struct PolicyValidator {
    rules: Vec<Box<dyn Rule>>,
}

impl PolicyValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard bounds:
    ///
    /// - `lock.idle_timeout_seconds` 30 – 86 400
    /// - `unlock.max_unlock_attempts` 1 – 10
    /// - `unlock.lockout_duration_minutes` 1 – 1 440
    /// - `agent.heartbeat_interval_seconds` 30 – 3 600
    /// - `monitoring.log_retention_days` 1 – 365
    ///
    /// plus [`HotkeyRule`].
    pub fn with_bounds() -> Self {
        let mut v = Self::new();
        v.add_rule(Box::new(RangeRule {
            field: "lock.idle_timeout_seconds",
            min: 30,
            max: 86_400,
            read: |s| s.lock.idle_timeout_seconds,
        }));
        v.add_rule(Box::new(RangeRule {
            field: "unlock.max_unlock_attempts",
            min: 1,
            max: 10,
            read: |s| s.unlock.max_unlock_attempts,
        }));
        v.add_rule(Box::new(RangeRule {
            field: "unlock.lockout_duration_minutes",
            min: 1,
            max: 1_440,
            read: |s| s.unlock.lockout_duration_minutes,
        }));
        v.add_rule(Box::new(RangeRule {
            field: "agent.heartbeat_interval_seconds",
            min: 30,
            max: 3_600,
            read: |s| s.agent.heartbeat_interval_seconds,
        }));
        v.add_rule(Box::new(RangeRule {
            field: "monitoring.log_retention_days",
            min: 1,
            max: 365,
            read: |s| s.monitoring.log_retention_days,
        }));
        v.add_rule(Box::new(HotkeyRule { max_len: 50 }));
        v
    }

    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn validate(&self, settings: &PolicySettings) -> Result<(), FleetError> {
        for rule in &self.rules {
            rule.check(settings)?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Inclusive `[min, max]` bound on one numeric setting.
pub struct RangeRule {
    /// Dotted path reported in [`FleetError::ValidationRange`].
    pub field: &'static str,
    pub min: u32,
    pub max: u32,
    pub read: fn(&PolicySettings) -> u32,
}

impl Rule for RangeRule {
    fn name(&self) -> &str {
        self.field
    }

    fn check(&self, settings: &PolicySettings) -> Result<(), FleetError> {
        let value = (self.read)(settings);
        if value < self.min || value > self.max {
            return Err(FleetError::ValidationRange {
                field: self.field.to_string(),
                value: i64::from(value),
                min: i64::from(self.min),
                max: i64::from(self.max),
            });
        }
        Ok(())
    }
}

/// When manual locking is enabled the hotkey must be set and short enough
/// for the agent to register it.
pub struct HotkeyRule {
    pub max_len: usize,
}

impl Rule for HotkeyRule {
    fn name(&self) -> &str {
        "lock.lock_hotkey"
    }

    fn check(&self, settings: &PolicySettings) -> Result<(), FleetError> {
        let hotkey = settings.lock.lock_hotkey.trim();
        if settings.lock.manual_lock_enabled && hotkey.is_empty() {
            return Err(FleetError::InvalidRequest(
                "lock.lock_hotkey must be set when manual lock is enabled".into(),
            ));
        }
        if hotkey.len() > self.max_len {
            return Err(FleetError::InvalidRequest(format!(
                "lock.lock_hotkey is longer than {} characters",
                self.max_len
            )));
        }
        Ok(())
    }
}
