//! Ledger integrity: gap detection and the full integrity check.

use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::{info, warn};

use super::{EventStore, FlagKind, StoreError, from_sql_seq};
use crate::AttemptId;
use crate::event::FIRST_SEQUENCE;
use crate::replay::{FinalStateCheck, Timeline, verify_final_state};

/// Inclusive run of missing sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeqRange {
    pub first: u64,
    pub last: u64,
}

impl SeqRange {
    /// Number of missing sequences in the run.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.last - self.first + 1
    }
}

impl std::fmt::Display for SeqRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}..={}", self.first, self.last)
        }
    }
}

/// Missing runs in an ascending sequence list, counting from 1.
#[must_use]
pub fn find_gaps(sorted_seqs: impl IntoIterator<Item = u64>) -> Vec<SeqRange> {
    let mut gaps = Vec::new();
    let mut expected = FIRST_SEQUENCE;
    for seq in sorted_seqs {
        if seq > expected {
            gaps.push(SeqRange {
                first: expected,
                last: seq - 1,
            });
        }
        expected = expected.max(seq.saturating_add(1));
    }
    gaps
}

/// Find gaps in an attempt's ledger and persist a flag for each run.
pub(crate) fn flag_gaps(conn: &Connection, attempt_id: AttemptId) -> Result<Vec<SeqRange>, StoreError> {
    let gaps = sync_gap_flags(conn, attempt_id)?;
    for gap in &gaps {
        warn!(attempt_id, missing = %gap, "sequence gap; ledger flagged for review");
    }
    Ok(gaps)
}

/// Re-scan an attempt that already carries gap flags, after late events
/// were stored. Flags for runs that are now filled are removed.
pub(crate) fn refresh_gap_flags(conn: &Connection, attempt_id: AttemptId) -> Result<(), StoreError> {
    let flagged: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM ledger_flags WHERE attempt_id = ?1 AND kind = ?2)",
        params![attempt_id, FlagKind::SequenceGap.as_str()],
        |row| row.get(0),
    )?;
    if flagged {
        sync_gap_flags(conn, attempt_id)?;
    }
    Ok(())
}

/// Make the persisted gap flags match the ledger: one flag per missing run,
/// keyed by the run's first sequence. A flag whose run still starts at the
/// same sequence keeps its original timestamp.
fn sync_gap_flags(conn: &Connection, attempt_id: AttemptId) -> Result<Vec<SeqRange>, StoreError> {
    let seqs = conn
        .prepare("SELECT seq FROM events WHERE attempt_id = ?1 ORDER BY seq")?
        .query_map([attempt_id], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(from_sql_seq)
        .collect::<Result<Vec<_>, _>>()?;
    let gaps = find_gaps(seqs);

    let firsts = gaps
        .iter()
        .map(|gap| i64::try_from(gap.first).map_err(|_| StoreError::InvalidSequence(gap.first)))
        .collect::<Result<Vec<_>, _>>()?;

    let flagged = conn
        .prepare("SELECT seq FROM ledger_flags WHERE attempt_id = ?1 AND kind = ?2")?
        .query_map(params![attempt_id, FlagKind::SequenceGap.as_str()], |row| {
            row.get::<_, i64>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for seq in flagged.into_iter().filter(|seq| !firsts.contains(seq)) {
        conn.execute(
            "DELETE FROM ledger_flags WHERE attempt_id = ?1 AND kind = ?2 AND seq = ?3",
            params![attempt_id, FlagKind::SequenceGap.as_str(), seq],
        )?;
        info!(attempt_id, seq, "sequence gap filled; flag cleared");
    }

    let now = chrono::Utc::now().timestamp_micros();
    for (gap, first) in gaps.iter().zip(&firsts) {
        conn.execute(
            "INSERT OR IGNORE INTO ledger_flags (attempt_id, kind, seq, detail, flagged_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                attempt_id,
                FlagKind::SequenceGap.as_str(),
                first,
                format!("missing {gap}"),
                now,
            ],
        )?;
    }
    Ok(gaps)
}

/// Result of [`EventStore::check_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub attempt_id: AttemptId,
    pub event_count: usize,
    pub last_sequence: Option<u64>,
    pub gaps: Vec<SeqRange>,
    /// Sequences flagged as collisions at ingest.
    pub collisions: Vec<u64>,
    pub quarantined: Vec<u64>,
    pub final_state: FinalStateCheck,
}

impl IntegrityReport {
    /// No gaps, no collisions and the cached final state replays.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.gaps.is_empty()
            && self.collisions.is_empty()
            && !matches!(self.final_state, FinalStateCheck::Mismatch { .. })
    }
}

impl EventStore {
    /// Scan for gaps (flagging any found), gather collision flags and
    /// quarantined events, and verify the cached final state by replaying
    /// the full ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt does not exist or a query fails.
    pub fn check_integrity(
        &self,
        attempt_id: AttemptId,
        default_file: &str,
    ) -> Result<IntegrityReport, StoreError> {
        let attempt = self.attempt(attempt_id)?;
        let ledger = self.ledger(attempt_id)?;
        let gaps = flag_gaps(self.conn(), attempt_id)?;

        let collisions = self
            .flags(attempt_id)?
            .into_iter()
            .filter(|flag| flag.kind == FlagKind::SequenceCollision)
            .map(|flag| flag.seq)
            .collect();
        let quarantined = ledger
            .iter()
            .filter(|event| event.is_quarantined())
            .map(super::StoredEvent::sequence)
            .collect();

        let timeline = Timeline::from_stored(&ledger);
        let final_state = verify_final_state(&attempt, &timeline, default_file);
        if let FinalStateCheck::Mismatch { files } = &final_state {
            warn!(attempt_id, ?files, "cached final state differs from replay");
        }

        Ok(IntegrityReport {
            attempt_id,
            event_count: ledger.len(),
            last_sequence: ledger.last().map(super::StoredEvent::sequence),
            gaps,
            collisions,
            quarantined,
            final_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileMap;
    use crate::event::{EventBatch, WireEvent};
    use crate::store::NewAttempt;
    use serde_json::json;

    #[test]
    fn finds_leading_inner_and_no_trailing_gaps() {
        assert!(find_gaps([1, 2, 3]).is_empty());
        assert_eq!(
            find_gaps([3, 4, 7]),
            vec![SeqRange { first: 1, last: 2 }, SeqRange { first: 5, last: 6 }]
        );
        assert!(find_gaps(Vec::new()).is_empty());
    }

    #[test]
    fn repeated_sequences_are_not_gaps() {
        assert!(find_gaps([1, 1, 2]).is_empty());
    }

    #[test]
    fn range_display() {
        assert_eq!(SeqRange { first: 4, last: 4 }.to_string(), "4");
        assert_eq!(SeqRange { first: 4, last: 9 }.to_string(), "4..=9");
        assert_eq!(SeqRange { first: 4, last: 9 }.count(), 6);
    }

    fn edit(seq: u64, code: &str) -> WireEvent {
        WireEvent {
            t: 0.0,
            seq,
            kind: "edit".into(),
            file_path: None,
            payload_json: json!({"fullCode": code}).to_string(),
        }
    }

    #[test]
    fn integrity_detects_stale_final_state() {
        let store = EventStore::open_in_memory().expect("store");
        let attempt = store
            .create_attempt(&NewAttempt {
                starter_state: FileMap::from([("main.py".into(), "a".into())]),
                ..NewAttempt::default()
            })
            .expect("attempt");
        store
            .ingest(&EventBatch {
                attempt_id: attempt.id,
                events: vec![edit(1, "ab"), edit(3, "abc")],
            })
            .expect("ingest");
        store
            .save_final_state(attempt.id, &FileMap::from([("main.py".into(), "ab".into())]))
            .expect("save");

        let report = store.check_integrity(attempt.id, "main.py").expect("check");
        assert_eq!(report.gaps, vec![SeqRange { first: 2, last: 2 }]);
        assert_eq!(
            report.final_state,
            FinalStateCheck::Mismatch {
                files: vec!["main.py".into()]
            }
        );
        assert!(!report.is_clean());
        assert_eq!(store.flags(attempt.id).expect("flags").len(), 1);

        let again = store.check_integrity(attempt.id, "main.py").expect("recheck");
        assert_eq!(again.gaps.len(), 1);
        assert_eq!(store.flags(attempt.id).expect("flags").len(), 1);
    }

    #[test]
    fn late_events_clear_filled_gap_flags() {
        let store = EventStore::open_in_memory().expect("store");
        let attempt = store.create_attempt(&NewAttempt::default()).expect("attempt");
        store
            .ingest(&EventBatch {
                attempt_id: attempt.id,
                events: vec![edit(1, "a"), edit(4, "abcd"), edit(7, "abcdefg")],
            })
            .expect("ingest");
        let finish = store.finish_attempt(attempt.id, None, None).expect("finish");
        assert_eq!(
            finish.gaps,
            vec![SeqRange { first: 2, last: 3 }, SeqRange { first: 5, last: 6 }]
        );
        assert_eq!(store.flags(attempt.id).expect("flags").len(), 2);

        // Fills 2..=3 completely and the front of 5..=6.
        store
            .ingest(&EventBatch {
                attempt_id: attempt.id,
                events: vec![edit(2, "ab"), edit(3, "abc"), edit(5, "abcde")],
            })
            .expect("late ingest");
        let flags = store.flags(attempt.id).expect("flags");
        let seqs: Vec<u64> = flags.iter().map(|flag| flag.seq).collect();
        assert_eq!(seqs, vec![6]);
        assert!(flags.iter().all(|flag| flag.kind == FlagKind::SequenceGap));

        store
            .ingest(&EventBatch {
                attempt_id: attempt.id,
                events: vec![edit(6, "abcdef")],
            })
            .expect("last ingest");
        assert!(store.flags(attempt.id).expect("flags").is_empty());
        let report = store.check_integrity(attempt.id, "main.py").expect("check");
        assert!(report.gaps.is_empty());
    }

    #[test]
    fn clean_ledger_passes() {
        let store = EventStore::open_in_memory().expect("store");
        let attempt = store.create_attempt(&NewAttempt::default()).expect("attempt");
        store
            .ingest(&EventBatch {
                attempt_id: attempt.id,
                events: vec![edit(1, "x")],
            })
            .expect("ingest");
        store
            .save_final_state(attempt.id, &FileMap::from([("main.py".into(), "x".into())]))
            .expect("save");
        let report = store.check_integrity(attempt.id, "main.py").expect("check");
        assert!(report.is_clean());
        assert_eq!(report.final_state, FinalStateCheck::Matches);
        assert_eq!(report.last_sequence, Some(1));
    }
}
