//! SQLite schema for the event ledger.
//!
//! - `attempts` holds attempt metadata plus the starter and cached final state
//! - `events` is the append-only ledger keyed by `(attempt_id, seq)`
//! - `ledger_flags` records collisions and gaps awaiting manual review
//! - `store_meta` tracks the schema version

/// Migration v1: ledger tables.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS attempts (
    attempt_id INTEGER PRIMARY KEY AUTOINCREMENT,
    assignment_id TEXT,
    started_at_us INTEGER NOT NULL,
    finished_at_us INTEGER,
    starter_state_json TEXT NOT NULL DEFAULT '{}',
    final_state_json TEXT,
    CHECK (finished_at_us IS NULL OR finished_at_us >= started_at_us)
);

CREATE TABLE IF NOT EXISTS events (
    attempt_id INTEGER NOT NULL REFERENCES attempts(attempt_id) ON DELETE CASCADE,
    seq INTEGER NOT NULL CHECK (seq >= 1),
    t REAL NOT NULL,
    type TEXT NOT NULL,
    file_path TEXT,
    payload_json TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    quarantine_reason TEXT,
    received_at_us INTEGER NOT NULL,
    PRIMARY KEY (attempt_id, seq)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS ledger_flags (
    flag_id INTEGER PRIMARY KEY AUTOINCREMENT,
    attempt_id INTEGER NOT NULL REFERENCES attempts(attempt_id) ON DELETE CASCADE,
    kind TEXT NOT NULL CHECK (kind IN ('sequence_collision', 'sequence_gap')),
    seq INTEGER NOT NULL,
    detail TEXT NOT NULL DEFAULT '',
    flagged_at_us INTEGER NOT NULL,
    UNIQUE (attempt_id, kind, seq)
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    created_at_us INTEGER NOT NULL
);

INSERT OR IGNORE INTO store_meta (id, schema_version, created_at_us)
VALUES (1, 0, CAST(strftime('%s', 'now') AS INTEGER) * 1000000);

CREATE INDEX IF NOT EXISTS idx_attempts_assignment
    ON attempts(assignment_id, started_at_us);

CREATE INDEX IF NOT EXISTS idx_ledger_flags_attempt
    ON ledger_flags(attempt_id, seq);
";

/// Migration v2: read-path indexes for time-window and per-kind queries.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_attempt_time
    ON events(attempt_id, t);

CREATE INDEX IF NOT EXISTS idx_events_type
    ON events(type);

CREATE INDEX IF NOT EXISTS idx_events_quarantined
    ON events(attempt_id)
    WHERE quarantine_reason IS NOT NULL;
";

/// Indexes expected after all migrations.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_attempts_assignment",
    "idx_ledger_flags_attempt",
    "idx_events_attempt_time",
    "idx_events_type",
    "idx_events_quarantined",
];
