//! [`LockoutGuard`] – consecutive unlock-failure counter with temporary lockout.
//!
//! # Algorithm
//!
//! For each device the guard keeps a failure counter and an optional
//! lockout expiry.  On every attempt:
//!
//! 1. If `now < expiry` the attempt is rejected with
//!    [`FleetError::LockedOut`], whatever its outcome would have been.
//! 2. A failure increments the counter.  When it reaches the limit's
//!    `max_attempts` the expiry is set to `now + duration` and the counter
//!    goes back to zero.
//! 3. A success resets the counter and clears the expiry.
//!
//! The limits come from the device's effective policy at the time of the
//! attempt; with no effective policy [`LockoutLimits::default`] (3 attempts,
//! 15 minutes) applies, so the guard is never disabled.
//!
//! Check and update happen under one lock, so two concurrent attempts for the
//! same device cannot both slip under the limit.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeDelta, Utc};
//! use fleetlock_kernel::lockout_guard::{AttemptOutcome, LockoutGuard, LockoutLimits};
//! use fleetlock_types::DeviceId;
//!
//! let guard = LockoutGuard::new();
//! let device = DeviceId::new();
//! let limits = LockoutLimits::default();
//! let now = Utc::now();
//!
//! guard.record_attempt(device, false, limits, now).unwrap();
//! guard.record_attempt(device, false, limits, now).unwrap();
//! let tripped = guard.record_attempt(device, false, limits, now).unwrap();
//! assert!(matches!(tripped, AttemptOutcome::LockoutTripped { .. }));
//!
//! // Even a correct password is refused until the lockout expires.
//! assert!(guard.record_attempt(device, true, limits, now).is_err());
//!
//! let later = now + TimeDelta::minutes(15);
//! assert_eq!(
//!     guard.record_attempt(device, true, limits, later).unwrap(),
//!     AttemptOutcome::Unlocked
//! );
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};
use fleetlock_types::{DeviceId, FleetError, Policy};
use tracing::{debug, info};

// ─────────────────────────────────────────────────────────────────────────────
// Limits
// ─────────────────────────────────────────────────────────────────────────────

/// Attempt limit and lockout length in force for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutLimits {
    pub max_attempts: u32,
    pub duration: TimeDelta,
}

impl LockoutLimits {
    pub fn new(max_attempts: u32, duration_minutes: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            duration: TimeDelta::minutes(i64::from(duration_minutes)),
        }
    }

    /// Limits taken from `policy`, or `fallback` when there is none.
    pub fn from_policy(policy: Option<&Policy>, fallback: LockoutLimits) -> Self {
        match policy {
            Some(p) => Self::new(
                p.settings.unlock.max_unlock_attempts,
                p.settings.unlock.lockout_duration_minutes,
            ),
            None => fallback,
        }
    }
}

impl Default for LockoutLimits {
    /// 3 attempts, 15 minutes.
    fn default() -> Self {
        Self::new(3, 15)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Result of an attempt that was allowed to be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Correct credentials; the counter is cleared.
    Unlocked,
    /// Wrong credentials, limit not yet reached.
    Failed {
        consecutive_failures: u32,
        remaining_attempts: u32,
    },
    /// Wrong credentials and the limit was reached by this attempt.
    LockoutTripped { until: DateTime<Utc> },
}

/// Read-only view of one device's counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockoutState {
    pub consecutive_failures: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl LockoutState {
    pub fn is_locked_out(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LockoutGuard
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LockoutGuard {
    counters: Mutex<HashMap<DeviceId, LockoutState>>,
}

fn remaining_seconds(until: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let ms = (until - now).num_milliseconds();
    (ms + 999) / 1000
}

impl LockoutGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject with [`FleetError::LockedOut`] if `device_id` is in lockout.
    pub fn check(&self, device_id: DeviceId, now: DateTime<Utc>) -> Result<(), FleetError> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        match counters.get_mut(&device_id) {
            Some(state) => Self::check_state(device_id, state, now),
            None => Ok(()),
        }
    }

    fn check_state(
        device_id: DeviceId,
        state: &mut LockoutState,
        now: DateTime<Utc>,
    ) -> Result<(), FleetError> {
        match state.locked_until {
            Some(until) if now < until => Err(FleetError::LockedOut {
                device_id,
                remaining_seconds: remaining_seconds(until, now),
            }),
            Some(_) => {
                // Expired: start over with a clean counter.
                *state = LockoutState::default();
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Evaluate one unlock attempt atomically.
    pub fn record_attempt(
        &self,
        device_id: DeviceId,
        success: bool,
        limits: LockoutLimits,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, FleetError> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let state = counters.entry(device_id).or_default();
        Self::check_state(device_id, state, now)?;

        if success {
            *state = LockoutState::default();
            debug!(device_id = %device_id, "unlock succeeded; counter reset");
            return Ok(AttemptOutcome::Unlocked);
        }

        state.consecutive_failures += 1;
        if state.consecutive_failures >= limits.max_attempts {
            let until = now + limits.duration;
            *state = LockoutState {
                consecutive_failures: 0,
                locked_until: Some(until),
            };
            info!(device_id = %device_id, until = %until, "unlock lockout tripped");
            return Ok(AttemptOutcome::LockoutTripped { until });
        }

        Ok(AttemptOutcome::Failed {
            consecutive_failures: state.consecutive_failures,
            remaining_attempts: limits.max_attempts - state.consecutive_failures,
        })
    }

    pub fn state(&self, device_id: &DeviceId) -> LockoutState {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(device_id).copied().unwrap_or_default()
    }

    /// Administrative reset of a device's counter and lockout.
    pub fn reset(&self, device_id: &DeviceId) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.remove(device_id);
    }
}
