//! Durable append-only event ledger.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so readers never block the ingesting writer
//! - `busy_timeout = 5s` to absorb lock contention between processes
//! - `foreign_keys = ON` so deleting an attempt cascades to its ledger
//!
//! Ingestion upserts by `(attempt_id, seq)` inside an immediate
//! transaction. A resent event with identical content is a duplicate and
//! is acknowledged without change; the same sequence with different content
//! is a collision, kept out of the ledger and flagged for review. Payloads
//! that do not decode are stored with a quarantine reason so the ledger
//! stays gap-free.

pub mod integrity;
pub mod migrations;
pub mod schema;

pub use integrity::{IntegrityReport, SeqRange, find_gaps};

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ErrorCode;
use crate::event::{Event, EventBatch, EventDecodeError, WireEvent};
use crate::{AttemptId, FileMap};

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("attempt {0} not found")]
    AttemptNotFound(AttemptId),

    #[error("attempt {0} is already finished")]
    AttemptFinished(AttemptId),

    #[error("sequence {0} is out of range (must be between 1 and 2^63-1)")]
    InvalidSequence(u64),

    #[error("event {seq} has a non-finite relative time")]
    InvalidTime { seq: u64 },

    #[error("corrupt store row: {0}")]
    Corrupt(String),

    #[error("failed to prepare store directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::AttemptNotFound(_) => ErrorCode::AttemptNotFound,
            Self::AttemptFinished(_) => ErrorCode::AttemptFinished,
            Self::InvalidSequence(_) | Self::InvalidTime { .. } => ErrorCode::InvalidRequest,
            Self::Corrupt(_) | Self::Json(_) => ErrorCode::CorruptStore,
            Self::Io { .. } | Self::Sqlite(_) => ErrorCode::StoreWriteFailed,
        }
    }

    /// Caused by the request rather than the store.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::AttemptNotFound(_)
                | Self::AttemptFinished(_)
                | Self::InvalidSequence(_)
                | Self::InvalidTime { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: AttemptId,
    pub assignment_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub starter_state: FileMap,
    /// Denormalized snapshot written on submit/save. Always reproducible
    /// by replaying the ledger from `starter_state`.
    pub final_state: Option<FileMap>,
}

impl Attempt {
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewAttempt {
    pub assignment_id: Option<String>,
    /// Defaults to now when `None`.
    pub started_at: Option<DateTime<Utc>>,
    pub starter_state: FileMap,
}

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    #[serde(flatten)]
    pub wire: WireEvent,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_reason: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl StoredEvent {
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.wire.seq
    }

    #[must_use]
    pub const fn is_quarantined(&self) -> bool {
        self.quarantine_reason.is_some()
    }

    /// # Errors
    ///
    /// Returns the decode failure for quarantined rows.
    pub fn decode(&self) -> Result<Event, EventDecodeError> {
        self.wire.decode()
    }
}

/// Per-batch ingestion outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub inserted: usize,
    /// Resends identical to a stored event.
    pub duplicates: usize,
    /// Same sequence, different content. Not stored; flagged.
    pub collisions: usize,
    /// Inserted with a quarantine reason.
    pub quarantined: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    SequenceCollision,
    SequenceGap,
}

impl FlagKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SequenceCollision => "sequence_collision",
            Self::SequenceGap => "sequence_gap",
        }
    }

    #[must_use]
    pub const fn code(self) -> ErrorCode {
        match self {
            Self::SequenceCollision => ErrorCode::SequenceCollision,
            Self::SequenceGap => ErrorCode::SequenceGap,
        }
    }
}

impl FromStr for FlagKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequence_collision" => Ok(Self::SequenceCollision),
            "sequence_gap" => Ok(Self::SequenceGap),
            other => Err(StoreError::Corrupt(format!("unknown flag kind '{other}'"))),
        }
    }
}

impl std::fmt::Display for FlagKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted marker that an attempt's ledger needs manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerFlag {
    pub attempt_id: AttemptId,
    pub kind: FlagKind,
    pub seq: u64,
    pub detail: String,
    pub flagged_at: DateTime<Utc>,
}

/// Returned by [`EventStore::finish_attempt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinishReport {
    pub attempt: Attempt,
    pub gaps: Vec<SeqRange>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Open (or create) a store file, apply pragmas and migrate.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or opening,
    /// configuring or migrating the database fails.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut conn = Connection::open(path)?;
        configure_connection(&conn)?;
        migrations::migrate(&mut conn)?;
        debug!(path = %path.display(), "event store opened");
        Ok(Self { conn })
    }

    /// In-memory store for tests and simulation.
    ///
    /// # Errors
    ///
    /// Returns an error if migration fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::migrate(&mut conn)?;
        Ok(Self { conn })
    }

    pub(crate) const fn conn(&self) -> &Connection {
        &self.conn
    }

    // -- attempts -----------------------------------------------------------

    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn create_attempt(&self, new: &NewAttempt) -> Result<Attempt, StoreError> {
        let started_at = new.started_at.unwrap_or_else(Utc::now);
        let starter_json = serde_json::to_string(&new.starter_state)?;
        self.conn.execute(
            "INSERT INTO attempts (assignment_id, started_at_us, starter_state_json)
             VALUES (?1, ?2, ?3)",
            params![new.assignment_id, started_at.timestamp_micros(), starter_json],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(attempt_id = id, assignment_id = ?new.assignment_id, "attempt created");
        self.attempt(id)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::AttemptNotFound`] if no such attempt exists.
    pub fn attempt(&self, id: AttemptId) -> Result<Attempt, StoreError> {
        self.find_attempt(id)?
            .ok_or(StoreError::AttemptNotFound(id))
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or the row is corrupt.
    pub fn find_attempt(&self, id: AttemptId) -> Result<Option<Attempt>, StoreError> {
        let raw = self
            .conn
            .query_row(
                &format!("{ATTEMPT_COLUMNS} WHERE attempt_id = ?1"),
                [id],
                RawAttempt::from_row,
            )
            .optional()?;
        raw.map(RawAttempt::into_attempt).transpose()
    }

    /// Attempts in start order, optionally limited to one assignment.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub fn list_attempts(&self, assignment_id: Option<&str>) -> Result<Vec<Attempt>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "{ATTEMPT_COLUMNS} WHERE (?1 IS NULL OR assignment_id = ?1)
             ORDER BY started_at_us, attempt_id"
        ))?;
        let rows = stmt
            .query_map([assignment_id], RawAttempt::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawAttempt::into_attempt).collect()
    }

    /// Overwrite the cached final state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AttemptNotFound`] if the attempt does not exist.
    pub fn save_final_state(&self, id: AttemptId, state: &FileMap) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        let changed = self.conn.execute(
            "UPDATE attempts SET final_state_json = ?2 WHERE attempt_id = ?1",
            params![id, json],
        )?;
        if changed == 0 {
            return Err(StoreError::AttemptNotFound(id));
        }
        debug!(attempt_id = id, files = state.len(), "final state saved");
        Ok(())
    }

    /// Mark the attempt finished, optionally saving its final state, and
    /// flag any sequence gaps in the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AttemptFinished`] if it was already finished.
    pub fn finish_attempt(
        &self,
        id: AttemptId,
        final_state: Option<&FileMap>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<FinishReport, StoreError> {
        let attempt = self.attempt(id)?;
        if attempt.is_finished() {
            return Err(StoreError::AttemptFinished(id));
        }
        let finished_at = finished_at.unwrap_or_else(Utc::now).max(attempt.started_at);
        let final_json = final_state.map(serde_json::to_string).transpose()?;

        let tx = rusqlite::Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE attempts
             SET finished_at_us = ?2, final_state_json = COALESCE(?3, final_state_json)
             WHERE attempt_id = ?1",
            params![id, finished_at.timestamp_micros(), final_json],
        )?;
        let gaps = integrity::flag_gaps(&tx, id)?;
        tx.commit()?;

        info!(attempt_id = id, gaps = gaps.len(), "attempt finished");
        Ok(FinishReport {
            attempt: self.attempt(id)?,
            gaps,
        })
    }

    /// Delete an attempt and, by cascade, its ledger and flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_attempt(&self, id: AttemptId) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute("DELETE FROM attempts WHERE attempt_id = ?1", [id])?;
        if changed > 0 {
            info!(attempt_id = id, "attempt deleted");
        }
        Ok(changed > 0)
    }

    // -- events -------------------------------------------------------------

    /// Store a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns an error, storing nothing, if the attempt does not exist, an
    /// event has an out-of-range sequence or time, or the write fails.
    pub fn ingest(&self, batch: &EventBatch) -> Result<IngestReport, StoreError> {
        let tx = rusqlite::Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let finished: Option<Option<i64>> = tx
            .query_row(
                "SELECT finished_at_us FROM attempts WHERE attempt_id = ?1",
                [batch.attempt_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(finished) = finished else {
            return Err(StoreError::AttemptNotFound(batch.attempt_id));
        };

        let received_at = Utc::now().timestamp_micros();
        let mut report = IngestReport::default();

        for wire in &batch.events {
            let seq = to_sql_seq(wire.seq)?;
            if !wire.t.is_finite() {
                return Err(StoreError::InvalidTime { seq: wire.seq });
            }
            let hash = content_hash(wire);
            let quarantine = wire.decode().err().map(|err| err.to_string());

            let inserted = tx.execute(
                "INSERT INTO events (
                    attempt_id, seq, t, type, file_path, payload_json,
                    content_hash, quarantine_reason, received_at_us
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(attempt_id, seq) DO NOTHING",
                params![
                    batch.attempt_id,
                    seq,
                    wire.t,
                    wire.kind,
                    wire.file_path,
                    wire.payload_json,
                    hash,
                    quarantine,
                    received_at,
                ],
            )?;

            if inserted == 1 {
                report.inserted += 1;
                if let Some(reason) = &quarantine {
                    report.quarantined += 1;
                    warn!(attempt_id = batch.attempt_id, seq = wire.seq, %reason, "event quarantined");
                }
                continue;
            }

            let existing: String = tx.query_row(
                "SELECT content_hash FROM events WHERE attempt_id = ?1 AND seq = ?2",
                params![batch.attempt_id, seq],
                |row| row.get(0),
            )?;
            if existing == hash {
                report.duplicates += 1;
            } else {
                report.collisions += 1;
                tx.execute(
                    "INSERT OR IGNORE INTO ledger_flags (attempt_id, kind, seq, detail, flagged_at_us)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        batch.attempt_id,
                        FlagKind::SequenceCollision.as_str(),
                        seq,
                        format!("stored {existing}, received {hash}"),
                        received_at,
                    ],
                )?;
                warn!(
                    attempt_id = batch.attempt_id,
                    seq = wire.seq,
                    "sequence collision; ledger flagged for review"
                );
            }
        }
        if report.inserted > 0 {
            integrity::refresh_gap_flags(&tx, batch.attempt_id)?;
        }
        tx.commit()?;

        if finished.is_some() && report.inserted > 0 {
            warn!(
                attempt_id = batch.attempt_id,
                inserted = report.inserted,
                "late events stored for finished attempt"
            );
        }
        debug!(attempt_id = batch.attempt_id, ?report, "batch ingested");
        Ok(report)
    }

    /// Full ledger in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn ledger(&self, id: AttemptId) -> Result<Vec<StoredEvent>, StoreError> {
        self.ledger_page(id, None, None)
    }

    /// Ledger events with `seq > after`, at most `limit`, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub fn ledger_page(
        &self,
        id: AttemptId,
        after: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let after = after.map_or(Ok(0), to_sql_seq)?;
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let mut stmt = self.conn.prepare(
            "SELECT seq, t, type, file_path, payload_json, content_hash,
                    quarantine_reason, received_at_us
             FROM events
             WHERE attempt_id = ?1 AND seq > ?2
             ORDER BY seq
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![id, after, limit], RawEvent::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawEvent::into_stored).collect()
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn last_sequence(&self, id: AttemptId) -> Result<Option<u64>, StoreError> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(seq) FROM events WHERE attempt_id = ?1",
            [id],
            |row| row.get(0),
        )?;
        max.map(from_sql_seq).transpose()
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn event_count(&self, id: AttemptId) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE attempt_id = ?1",
            [id],
            |row| row.get(0),
        )?;
        usize::try_from(count).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    /// Review flags for an attempt, by sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub fn flags(&self, id: AttemptId) -> Result<Vec<LedgerFlag>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, seq, detail, flagged_at_us FROM ledger_flags
             WHERE attempt_id = ?1 ORDER BY seq, kind",
        )?;
        let rows = stmt
            .query_map([id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(kind, seq, detail, at)| {
                Ok(LedgerFlag {
                    attempt_id: id,
                    kind: kind.parse()?,
                    seq: from_sql_seq(seq)?,
                    detail,
                    flagged_at: from_micros(at)?,
                })
            })
            .collect()
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// BLAKE3 over the fields that define an event's content.
#[must_use]
pub fn content_hash(wire: &WireEvent) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&wire.t.to_bits().to_le_bytes());
    hasher.update(wire.kind.as_bytes());
    hasher.update(&[0]);
    match &wire.file_path {
        Some(path) => {
            hasher.update(&[1]);
            hasher.update(path.as_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
    hasher.update(&[0]);
    hasher.update(wire.payload_json.as_bytes());
    format!("blake3:{}", hasher.finalize().to_hex())
}

fn to_sql_seq(seq: u64) -> Result<i64, StoreError> {
    match i64::try_from(seq) {
        Ok(value) if value >= 1 => Ok(value),
        _ => Err(StoreError::InvalidSequence(seq)),
    }
}

fn from_sql_seq(seq: i64) -> Result<u64, StoreError> {
    u64::try_from(seq).map_err(|_| StoreError::Corrupt(format!("negative sequence {seq}")))
}

fn from_micros(us: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {us} out of range")))
}

const ATTEMPT_COLUMNS: &str = "SELECT attempt_id, assignment_id, started_at_us, finished_at_us,
    starter_state_json, final_state_json FROM attempts";

struct RawAttempt {
    id: AttemptId,
    assignment_id: Option<String>,
    started_at_us: i64,
    finished_at_us: Option<i64>,
    starter_json: String,
    final_json: Option<String>,
}

impl RawAttempt {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            assignment_id: row.get(1)?,
            started_at_us: row.get(2)?,
            finished_at_us: row.get(3)?,
            starter_json: row.get(4)?,
            final_json: row.get(5)?,
        })
    }

    fn into_attempt(self) -> Result<Attempt, StoreError> {
        Ok(Attempt {
            id: self.id,
            assignment_id: self.assignment_id,
            started_at: from_micros(self.started_at_us)?,
            finished_at: self.finished_at_us.map(from_micros).transpose()?,
            starter_state: serde_json::from_str(&self.starter_json)?,
            final_state: self
                .final_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

struct RawEvent {
    seq: i64,
    t: f64,
    kind: String,
    file_path: Option<String>,
    payload_json: String,
    content_hash: String,
    quarantine_reason: Option<String>,
    received_at_us: i64,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            t: row.get(1)?,
            kind: row.get(2)?,
            file_path: row.get(3)?,
            payload_json: row.get(4)?,
            content_hash: row.get(5)?,
            quarantine_reason: row.get(6)?,
            received_at_us: row.get(7)?,
        })
    }

    fn into_stored(self) -> Result<StoredEvent, StoreError> {
        Ok(StoredEvent {
            wire: WireEvent {
                t: self.t,
                seq: from_sql_seq(self.seq)?,
                kind: self.kind,
                file_path: self.file_path,
                payload_json: self.payload_json,
            },
            content_hash: self.content_hash,
            quarantine_reason: self.quarantine_reason,
            received_at: from_micros(self.received_at_us)?,
        })
    }
}
