// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! saoe-audit
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};

pub mod ledger;

/// Event type recorded when an envelope passes all twelve validation steps.
pub const EVENT_VALIDATED: &str = "validated";
/// Event type recorded when an envelope is rejected at the shim boundary.
pub const EVENT_REJECTED: &str = "rejected";
/// Event type recorded when an envelope is signed and written to a peer queue.
pub const EVENT_FORWARDED: &str = "forwarded";
/// Event type recorded for each tool call the ToolGate dispatches.
pub const EVENT_TOOL_EXECUTED: &str = "tool_executed";
/// Event type recorded when a handler fails on a validated envelope.
pub const EVENT_HANDLER_ERROR: &str = "handler_error";
/// Event type recorded when the quarantine back-pressure limit is hit.
pub const EVENT_QUARANTINE_LIMIT: &str = "quarantine_limit_exceeded";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from audit-log operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// An `envelope_id` was submitted that has already been recorded.
    ///
    /// Raised by the UNIQUE constraint at insert time; this is the
    /// authoritative replay guard.
    #[error("replay detected: envelope_id {envelope_id:?} already processed")]
    ReplayAttack {
        /// The duplicate envelope identifier.
        envelope_id: String,
    },

    /// Any other storage-layer failure.
    #[error("audit store error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Event details could not be serialized to JSON.
    #[error("audit event details not serializable: {0}")]
    Details(#[from] serde_json::Error),

    /// The store's parent directory could not be created.
    #[error("audit store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

/// A single audit event to be appended to the store.
///
/// All identity fields are optional; `envelope_id` is globally unique when
/// present. Construct with [`AuditEvent::new`] and the `with_*` builders:
///
/// ```
/// use saoe_audit::AuditEvent;
///
/// let ev = AuditEvent::new("validated")
///     .with_envelope_id("e-1")
///     .with_sender_id("intake_agent")
///     .with_agent_id("sanitization_agent");
/// assert_eq!(ev.event_type, "validated");
/// ```
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Event discriminator (`validated`, `rejected`, `forwarded`, ...).
    pub event_type: String,
    /// RFC 3339 UTC timestamp; defaults to now.
    pub timestamp_utc: String,
    /// Globally unique envelope identifier, when the event concerns one.
    pub envelope_id: Option<String>,
    /// Session the event belongs to.
    pub session_id: Option<String>,
    /// Originating agent of the envelope concerned.
    pub sender_id: Option<String>,
    /// Destination agent of the envelope concerned.
    pub receiver_id: Option<String>,
    /// Template referenced by the envelope concerned.
    pub template_id: Option<String>,
    /// Agent that emitted this event.
    pub agent_id: Option<String>,
    /// Arbitrary structured detail payload.
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    /// Create an event of the given type, timestamped now.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp_utc: now_utc(),
            envelope_id: None,
            session_id: None,
            sender_id: None,
            receiver_id: None,
            template_id: None,
            agent_id: None,
            details: None,
        }
    }

    /// Set the envelope identifier.
    #[must_use]
    pub fn with_envelope_id(mut self, id: impl Into<String>) -> Self {
        self.envelope_id = Some(id.into());
        self
    }

    /// Set the session identifier.
    #[must_use]
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Set the sender identifier.
    #[must_use]
    pub fn with_sender_id(mut self, id: impl Into<String>) -> Self {
        self.sender_id = Some(id.into());
        self
    }

    /// Set the receiver identifier.
    #[must_use]
    pub fn with_receiver_id(mut self, id: impl Into<String>) -> Self {
        self.receiver_id = Some(id.into());
        self
    }

    /// Set the template identifier.
    #[must_use]
    pub fn with_template_id(mut self, id: impl Into<String>) -> Self {
        self.template_id = Some(id.into());
        self
    }

    /// Set the emitting agent identifier.
    #[must_use]
    pub fn with_agent_id(mut self, id: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    /// Attach a structured details payload.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Override the timestamp (tests and backfill tooling only).
    #[must_use]
    pub fn with_timestamp(mut self, ts: impl Into<String>) -> Self {
        self.timestamp_utc = ts.into();
        self
    }
}

/// A stored audit row, as read back by [`AuditLog::recent_events`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditRecord {
    /// Monotonic row id.
    pub id: i64,
    /// Event discriminator.
    pub event_type: String,
    /// Envelope identifier, if any.
    pub envelope_id: Option<String>,
    /// Session identifier, if any.
    pub session_id: Option<String>,
    /// Sender identifier, if any.
    pub sender_id: Option<String>,
    /// Receiver identifier, if any.
    pub receiver_id: Option<String>,
    /// Template identifier, if any.
    pub template_id: Option<String>,
    /// Emitting agent identifier, if any.
    pub agent_id: Option<String>,
    /// RFC 3339 UTC timestamp.
    pub timestamp_utc: String,
    /// Structured details, if any.
    pub details: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const CREATE_EVENTS: &str = "
CREATE TABLE IF NOT EXISTS audit_events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type      TEXT NOT NULL,
    envelope_id     TEXT,
    session_id      TEXT,
    sender_id       TEXT,
    receiver_id     TEXT,
    template_id     TEXT,
    agent_id        TEXT,
    timestamp_utc   TEXT NOT NULL,
    details_json    TEXT
);
";

// Partial index: UNIQUE only where envelope_id IS NOT NULL.
const CREATE_ENVELOPE_IDX: &str = "
CREATE UNIQUE INDEX IF NOT EXISTS idx_envelope_id
    ON audit_events (envelope_id)
    WHERE envelope_id IS NOT NULL;
";

const CREATE_SESSION_IDX: &str = "
CREATE INDEX IF NOT EXISTS idx_sender_event_ts
    ON audit_events (sender_id, event_type, timestamp_utc);
";

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Append-only SQLite audit log.
///
/// Each operation opens, uses, and closes its own connection, which keeps
/// multi-process use safe: agents run as separate OS processes sharing only
/// this file. WAL mode lets readers proceed while a writer commits.
#[derive(Debug, Clone)]
pub struct AuditLog {
    db_path: PathBuf,
}

impl AuditLog {
    /// Open (creating if necessary) the audit store at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Storage`] if the schema cannot be created.
    pub fn open(db_path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = Self {
            db_path: db_path.to_path_buf(),
        };
        let conn = log.connect()?;
        conn.execute_batch(CREATE_EVENTS)?;
        conn.execute_batch(CREATE_ENVELOPE_IDX)?;
        conn.execute_batch(CREATE_SESSION_IDX)?;
        Ok(log)
    }

    fn connect(&self) -> Result<Connection, AuditError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Append `event` to the store.
    ///
    /// The insert is atomic: when `event.envelope_id` is non-null and already
    /// present, the UNIQUE constraint fires and this returns
    /// [`AuditError::ReplayAttack`]. Callers must not pre-check with
    /// [`has_envelope_id`](Self::has_envelope_id) as a guard; that races.
    ///
    /// # Errors
    ///
    /// [`AuditError::ReplayAttack`] on a duplicate envelope id,
    /// [`AuditError::Storage`] on any other database failure.
    pub fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let details_json = match &event.details {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        let conn = self.connect()?;
        let inserted = conn.execute(
            "INSERT INTO audit_events
                 (event_type, envelope_id, session_id, sender_id,
                  receiver_id, template_id, agent_id, timestamp_utc, details_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.event_type,
                event.envelope_id,
                event.session_id,
                event.sender_id,
                event.receiver_id,
                event.template_id,
                event.agent_id,
                event.timestamp_utc,
                details_json,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_envelope_unique_violation(&e) => {
                let envelope_id = event.envelope_id.clone().unwrap_or_default();
                tracing::warn!(%envelope_id, "duplicate envelope_id rejected by audit store");
                Err(AuditError::ReplayAttack { envelope_id })
            }
            Err(e) => Err(AuditError::Storage(e)),
        }
    }

    /// Fast advisory read: has this envelope id been recorded?
    ///
    /// Never authoritative; the UNIQUE constraint in [`emit`](Self::emit) is.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Storage`] on database failure.
    pub fn has_envelope_id(&self, envelope_id: &str) -> Result<bool, AuditError> {
        let conn = self.connect()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM audit_events WHERE envelope_id = ?1 LIMIT 1",
                params![envelope_id],
                |_| Ok(()),
            )
            .map(|()| true);
        match found {
            Ok(v) => Ok(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(AuditError::Storage(e)),
        }
    }

    /// Count `validated` events for `sender_id` within the last
    /// `window_hours`, rolling window ending now.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Storage`] on database failure.
    pub fn query_session_count(
        &self,
        sender_id: &str,
        window_hours: i64,
    ) -> Result<u64, AuditError> {
        let cutoff = (Utc::now() - Duration::hours(window_hours))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*)
             FROM audit_events
             WHERE sender_id = ?1
               AND event_type = ?2
               AND timestamp_utc >= ?3",
            params![sender_id, EVENT_VALIDATED, cutoff],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Return the most recent `limit` events, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Storage`] on database failure.
    pub fn recent_events(&self, limit: u32) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_type, envelope_id, session_id, sender_id,
                    receiver_id, template_id, agent_id, timestamp_utc, details_json
             FROM audit_events
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            let details_json: Option<String> = row.get(9)?;
            Ok(AuditRecord {
                id: row.get(0)?,
                event_type: row.get(1)?,
                envelope_id: row.get(2)?,
                session_id: row.get(3)?,
                sender_id: row.get(4)?,
                receiver_id: row.get(5)?,
                template_id: row.get(6)?,
                agent_id: row.get(7)?,
                timestamp_utc: row.get(8)?,
                details: details_json.and_then(|s| serde_json::from_str(&s).ok()),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn is_envelope_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(inner, Some(msg)) => {
            inner.code == rusqlite::ErrorCode::ConstraintViolation
                && msg.to_lowercase().contains("envelope_id")
        }
        _ => false,
    }
}

/// Current UTC time in the RFC 3339 form stored in the `timestamp_utc`
/// column (microsecond precision, `Z` suffix). The fixed format keeps
/// lexicographic and chronological order identical, which the quota query
/// relies on.
#[must_use]
pub fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
