//! Action Ledger.
//!
//! Persists every [`DeviceAction`] so the command history and any in-flight
//! work survive a restart.  Status changes are compare-and-swap updates keyed
//! on the current status, so two writers (or two replicas sharing the file)
//! can never both move the same action.
//!
//! # Storage layout
//!
//! A single SQLite table `device_actions`:
//!
//! | column            | type    | description                                   |
//! |-------------------|---------|-----------------------------------------------|
//! | id                | TEXT    | UUID primary key                              |
//! | device_id         | TEXT    | target device                                 |
//! | action_type       | TEXT    | `lock`, `unlock`, `screenshot`, `restart`     |
//! | status            | TEXT    | lifecycle state                               |
//! | initiator         | TEXT    | requesting actor (NULL when system-originated)|
//! | reason            | TEXT    | free text                                     |
//! | metadata          | TEXT    | JSON [`ActionMetadata`]                       |
//! | created_at        | TEXT    | RFC-3339 UTC, nanosecond precision            |
//! | sent_at           | TEXT    | nullable                                      |
//! | acknowledged_at   | TEXT    | nullable                                      |
//! | completed_at      | TEXT    | nullable, set on any terminal state           |
//! | delivery_attempts | INTEGER | hand-offs to a transport                      |
//! | result            | TEXT    | nullable JSON                                 |
//! | error             | TEXT    | nullable                                      |
//!
//! A partial unique index on `(device_id, action_type)` over the in-flight
//! statuses backs the one-in-flight-action-per-type rule at the storage level.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use fleetlock_store::action_ledger::ActionLedger;
//! use fleetlock_types::{
//!     ActionId, ActionMetadata, ActionStatus, ActionType, DeviceAction, DeviceId,
//! };
//!
//! let ledger = ActionLedger::open_in_memory().unwrap();
//! let action = DeviceAction {
//!     id: ActionId::new(),
//!     device_id: DeviceId::new(),
//!     action_type: ActionType::Screenshot,
//!     status: ActionStatus::Pending,
//!     initiator: Some("auditor-1".into()),
//!     reason: "incident review".into(),
//!     metadata: ActionMetadata::for_type(ActionType::Screenshot),
//!     created_at: Utc::now(),
//!     sent_at: None,
//!     acknowledged_at: None,
//!     completed_at: None,
//!     delivery_attempts: 0,
//!     result: None,
//!     error: None,
//! };
//! ledger.insert(&action).unwrap();
//!
//! // A second in-flight screenshot for the same device is refused.
//! let dup = DeviceAction { id: ActionId::new(), ..action.clone() };
//! assert!(ledger.insert(&dup).is_err());
//!
//! assert_eq!(ledger.get(&action.id).unwrap(), action);
//! ```

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use fleetlock_types::{
    ActionId, ActionMetadata, ActionStatus, ActionType, DeviceAction, DeviceId, EntityKind,
    FleetError,
};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use thiserror::Error;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Metadata encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Action not found: {0}")]
    NotFound(ActionId),
    #[error("A {action_type} action is already in flight for device {device_id}")]
    InFlight {
        device_id: DeviceId,
        action_type: ActionType,
    },
}

impl From<LedgerError> for FleetError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => FleetError::not_found(EntityKind::Action, id),
            LedgerError::InFlight {
                device_id,
                action_type,
            } => FleetError::ActionAlreadyInFlight {
                device_id,
                action_type,
            },
            other => FleetError::Storage(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding helpers
// ─────────────────────────────────────────────────────────────────────────────

const COLUMNS: &str = "id, device_id, action_type, status, initiator, reason, metadata, \
     created_at, sent_at, acknowledged_at, completed_at, delivery_attempts, result, error";

/// Fixed-width RFC-3339 so lexical order equals time order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn ts_opt(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(ts)
}

fn in_flight_list() -> String {
    ActionStatus::IN_FLIGHT
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_ts_opt(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(idx, r)).transpose()
}

fn row_to_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceAction> {
    let id: String = row.get(0)?;
    let device_id: String = row.get(1)?;
    let type_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let metadata: String = row.get(6)?;
    let result: Option<String> = row.get(12)?;

    let action_type = ActionType::parse(&type_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(2, type_str, rusqlite::types::Type::Text)
    })?;
    let status = ActionStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(3, status_str, rusqlite::types::Type::Text)
    })?;
    let metadata: ActionMetadata =
        serde_json::from_str(&metadata).map_err(|e| conversion_err(6, e))?;
    let result = result
        .map(|r| serde_json::from_str(&r))
        .transpose()
        .map_err(|e| conversion_err(12, e))?;
    let delivery_attempts: i64 = row.get(11)?;

    Ok(DeviceAction {
        id: id.parse().map_err(|e| conversion_err(0, e))?,
        device_id: device_id.parse().map_err(|e| conversion_err(1, e))?,
        action_type,
        status,
        initiator: row.get(4)?,
        reason: row.get(5)?,
        metadata,
        created_at: parse_ts(7, row.get(7)?)?,
        sent_at: parse_ts_opt(8, row.get(8)?)?,
        acknowledged_at: parse_ts_opt(9, row.get(9)?)?,
        completed_at: parse_ts_opt(10, row.get(10)?)?,
        delivery_attempts: u32::try_from(delivery_attempts).unwrap_or(u32::MAX),
        result,
        error: row.get(13)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// ActionLedger
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed store of [`DeviceAction`] rows.
pub struct ActionLedger {
    conn: Mutex<Connection>,
}

impl ActionLedger {
    /// Open (or create) a persistent ledger at `path`.
    pub fn open(path: &str) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    /// Open a temporary in-memory ledger.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<(), LedgerError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS device_actions (
                id                TEXT NOT NULL PRIMARY KEY,
                device_id         TEXT NOT NULL,
                action_type       TEXT NOT NULL,
                status            TEXT NOT NULL,
                initiator         TEXT,
                reason            TEXT NOT NULL DEFAULT '',
                metadata          TEXT NOT NULL,
                created_at        TEXT NOT NULL,
                sent_at           TEXT,
                acknowledged_at   TEXT,
                completed_at      TEXT,
                delivery_attempts INTEGER NOT NULL DEFAULT 0,
                result            TEXT,
                error             TEXT
            );
            CREATE INDEX IF NOT EXISTS device_actions_by_device
                ON device_actions (device_id, created_at);
            CREATE UNIQUE INDEX IF NOT EXISTS device_actions_one_in_flight
                ON device_actions (device_id, action_type)
                WHERE status IN ({});",
            in_flight_list()
        );
        self.conn().execute_batch(&sql)?;
        Ok(())
    }

    /// Insert a new action.
    ///
    /// Returns [`LedgerError::InFlight`] when a non-terminal action of the
    /// same type already exists for the device.
    pub fn insert(&self, action: &DeviceAction) -> Result<(), LedgerError> {
        let conn = self.conn();
        let metadata = serde_json::to_string(&action.metadata)?;
        let result = action.result.as_ref().map(serde_json::to_string).transpose()?;
        let outcome = conn.execute(
            &format!(
                "INSERT INTO device_actions ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                action.id.to_string(),
                action.device_id.to_string(),
                action.action_type.as_str(),
                action.status.as_str(),
                action.initiator,
                action.reason,
                metadata,
                ts(action.created_at),
                ts_opt(action.sent_at),
                ts_opt(action.acknowledged_at),
                ts_opt(action.completed_at),
                i64::from(action.delivery_attempts),
                result,
                action.error,
            ],
        );
        match outcome {
            Ok(_) => {
                debug!(action_id = %action.id, device_id = %action.device_id, "action recorded");
                Ok(())
            }
            Err(e) if is_constraint_violation(&e) && !action.status.is_terminal() => {
                Err(LedgerError::InFlight {
                    device_id: action.device_id,
                    action_type: action.action_type,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, id: &ActionId) -> Result<DeviceAction, LedgerError> {
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM device_actions WHERE id = ?1"),
                params![id.to_string()],
                row_to_action,
            )
            .optional()?
            .ok_or(LedgerError::NotFound(*id))
    }

    /// Write `updated` over the stored row, but only if the stored status is
    /// still `expected`.  Returns `false` when another writer got there first.
    pub fn compare_and_swap(
        &self,
        expected: ActionStatus,
        updated: &DeviceAction,
    ) -> Result<bool, LedgerError> {
        let result = updated.result.as_ref().map(serde_json::to_string).transpose()?;
        let metadata = serde_json::to_string(&updated.metadata)?;
        let changed = self.conn().execute(
            "UPDATE device_actions
             SET status = ?1, sent_at = ?2, acknowledged_at = ?3, completed_at = ?4,
                 delivery_attempts = ?5, result = ?6, error = ?7, metadata = ?8
             WHERE id = ?9 AND status = ?10",
            params![
                updated.status.as_str(),
                ts_opt(updated.sent_at),
                ts_opt(updated.acknowledged_at),
                ts_opt(updated.completed_at),
                i64::from(updated.delivery_attempts),
                result,
                updated.error,
                metadata,
                updated.id.to_string(),
                expected.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Move an action to `timeout` if it is still in flight.
    ///
    /// Safe to race: whichever sweep runs second matches no row and gets
    /// `false`.
    pub fn expire(
        &self,
        id: &ActionId,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, LedgerError> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE device_actions
                 SET status = ?1, completed_at = ?2, error = ?3
                 WHERE id = ?4 AND status IN ({})",
                in_flight_list()
            ),
            params![ActionStatus::Timeout.as_str(), ts(now), reason, id.to_string()],
        )?;
        Ok(changed == 1)
    }

    fn query(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<DeviceAction>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM device_actions {filter} ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(args, row_to_action)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(LedgerError::Sqlite)
    }

    /// Every non-terminal action, oldest first.
    pub fn list_in_flight(&self) -> Result<Vec<DeviceAction>, LedgerError> {
        self.query(&format!("WHERE status IN ({})", in_flight_list()), &[])
    }

    /// The in-flight action of `action_type` for `device_id`, if any.
    pub fn find_in_flight(
        &self,
        device_id: &DeviceId,
        action_type: ActionType,
    ) -> Result<Option<DeviceAction>, LedgerError> {
        let device = device_id.to_string();
        let found = self.query(
            &format!(
                "WHERE device_id = ?1 AND action_type = ?2 AND status IN ({})",
                in_flight_list()
            ),
            &[&device, &action_type.as_str()],
        )?;
        Ok(found.into_iter().next())
    }

    /// Actions awaiting delivery or acknowledgement for `device_id`.
    pub fn outstanding_for_device(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<DeviceAction>, LedgerError> {
        let device = device_id.to_string();
        self.query(
            "WHERE device_id = ?1 AND status IN ('pending', 'sent')",
            &[&device],
        )
    }

    pub fn list_for_device(&self, device_id: &DeviceId) -> Result<Vec<DeviceAction>, LedgerError> {
        let device = device_id.to_string();
        self.query("WHERE device_id = ?1", &[&device])
    }

    pub fn list_by_status(&self, status: ActionStatus) -> Result<Vec<DeviceAction>, LedgerError> {
        self.query("WHERE status = ?1", &[&status.as_str()])
    }

    pub fn list_by_type(&self, action_type: ActionType) -> Result<Vec<DeviceAction>, LedgerError> {
        self.query("WHERE action_type = ?1", &[&action_type.as_str()])
    }

    pub fn list_all(&self) -> Result<Vec<DeviceAction>, LedgerError> {
        self.query("", &[])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
