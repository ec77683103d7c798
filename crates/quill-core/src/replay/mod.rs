//! Deterministic reconstruction of per-file code state from a ledger.
//!
//! # Algorithm
//!
//! 1. Build a [`Timeline`] from the ledger: entries sorted by sequence,
//!    each tagged parsed or unparsable.
//! 2. Start from the attempt's starter state.
//! 3. Walk entries up to and including the target. Each parsed `edit` sets
//!    `state[file_path or default_file] = fullCode`. Every other entry,
//!    including unparsable ones, leaves state untouched.
//!
//! Because only the last edit per file matters, reconstructing at `j` from
//! a snapshot at `i` by applying `(i, j]` gives exactly the same state as
//! reconstructing at `j` from scratch. [`Replayer`] exploits this to step
//! forward incrementally.
//!
//! # Performance
//!
//! O(N) in the number of entries up to the target; no intermediate
//! snapshots are stored.

use serde::Serialize;
use tracing::debug;

use crate::FileMap;
use crate::error::ErrorCode;
use crate::event::{Event, EventKind, EventPayload, WireEvent};
use crate::store::{Attempt, StoredEvent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("sequence {requested} is beyond the end of the ledger (last: {last:?})")]
    SequenceOutOfRange { requested: u64, last: Option<u64> },

    #[error("step {step} is out of range ({len} meaningful events)")]
    StepOutOfRange { step: usize, len: usize },

    #[error("cannot rewind from sequence {from} to {to}")]
    Rewind { from: u64, to: u64 },
}

impl ReplayError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::InvalidRequest
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

/// Decoded view of one ledger event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub sequence: u64,
    pub relative_time: f64,
    /// Raw kind string, kept even when unknown.
    pub kind: String,
    pub file_path: Option<String>,
    #[serde(flatten)]
    pub body: EntryBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryBody {
    Parsed { payload: EventPayload },
    Unparsable { reason: String, payload_json: String },
}

impl TimelineEntry {
    fn from_wire(wire: &WireEvent) -> Self {
        let body = match wire.decode() {
            Ok(event) => EntryBody::Parsed {
                payload: event.payload,
            },
            Err(err) => {
                debug!(seq = wire.seq, error = %err, "unparsable event kept in timeline");
                EntryBody::Unparsable {
                    reason: err.to_string(),
                    payload_json: wire.payload_json.clone(),
                }
            }
        };
        Self {
            sequence: wire.seq,
            relative_time: wire.t,
            kind: wire.kind.clone(),
            file_path: wire.file_path.clone(),
            body,
        }
    }

    fn from_event(event: &Event) -> Self {
        Self {
            sequence: event.sequence,
            relative_time: event.relative_time,
            kind: event.kind().as_str().to_string(),
            file_path: event.file_path.clone(),
            body: EntryBody::Parsed {
                payload: event.payload.clone(),
            },
        }
    }

    #[must_use]
    pub const fn payload(&self) -> Option<&EventPayload> {
        match &self.body {
            EntryBody::Parsed { payload } => Some(payload),
            EntryBody::Unparsable { .. } => None,
        }
    }

    /// Parsed kind, if the entry decoded.
    #[must_use]
    pub fn parsed_kind(&self) -> Option<EventKind> {
        self.payload().map(EventPayload::kind)
    }

    #[must_use]
    pub const fn is_unparsable(&self) -> bool {
        matches!(self.body, EntryBody::Unparsable { .. })
    }

    /// The file an edit applies to, and its new content.
    fn edit_target<'a>(&'a self, default_file: &'a str) -> Option<(&'a str, &'a str)> {
        let edit = self.payload()?.as_edit()?;
        Some((
            self.file_path.as_deref().unwrap_or(default_file),
            edit.full_code.as_str(),
        ))
    }
}

/// Ordered, decoded ledger. Duplicate sequences keep their first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    #[must_use]
    pub fn from_wire<'a>(events: impl IntoIterator<Item = &'a WireEvent>) -> Self {
        Self::from_entries(events.into_iter().map(TimelineEntry::from_wire).collect())
    }

    #[must_use]
    pub fn from_stored(events: &[StoredEvent]) -> Self {
        Self::from_wire(events.iter().map(|e| &e.wire))
    }

    #[must_use]
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        Self::from_entries(events.into_iter().map(TimelineEntry::from_event).collect())
    }

    fn from_entries(mut entries: Vec<TimelineEntry>) -> Self {
        entries.sort_by_key(|e| e.sequence);
        entries.dedup_by_key(|e| e.sequence);
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.entries.last().map(|e| e.sequence)
    }

    #[must_use]
    pub fn unparsable_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_unparsable()).count()
    }

    /// Number of entries with `sequence <= seq`.
    fn position_of(&self, seq: u64) -> usize {
        self.entries.partition_point(|e| e.sequence <= seq)
    }

    /// Sequences of the meaningful-event index.
    ///
    /// Skips edits whose `fullCode` equals the preceding retained edit's
    /// for the same file. Everything else is retained.
    #[must_use]
    pub fn meaningful_sequences(&self, default_file: &str) -> Vec<u64> {
        let mut last_code: FileMap = FileMap::new();
        let mut retained = Vec::new();
        for entry in &self.entries {
            if let Some((file, code)) = entry.edit_target(default_file) {
                if last_code.get(file).is_some_and(|prev| prev == code) {
                    continue;
                }
                last_code.insert(file.to_string(), code.to_string());
            }
            retained.push(entry.sequence);
        }
        retained
    }
}

// ---------------------------------------------------------------------------
// Reconstruction
// ---------------------------------------------------------------------------

/// Reconstructed state at a logical position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplaySnapshot {
    /// `None` before any event has been applied.
    pub at_sequence: Option<u64>,
    pub files: FileMap,
    /// The entry at `at_sequence`, exposed for non-edit context.
    pub event: Option<TimelineEntry>,
}

/// Incremental forward replay over a [`Timeline`].
#[derive(Debug, Clone)]
pub struct Replayer<'a> {
    timeline: &'a Timeline,
    default_file: String,
    files: FileMap,
    applied: usize,
}

impl<'a> Replayer<'a> {
    #[must_use]
    pub fn new(timeline: &'a Timeline, starter: &FileMap, default_file: &str) -> Self {
        Self {
            timeline,
            default_file: default_file.to_string(),
            files: starter.clone(),
            applied: 0,
        }
    }

    /// Apply every entry with `sequence <= seq`.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Rewind`] if `seq` is before the current
    /// position.
    pub fn advance_to(&mut self, seq: u64) -> Result<(), ReplayError> {
        if let Some(current) = self.position() {
            if seq < current {
                return Err(ReplayError::Rewind {
                    from: current,
                    to: seq,
                });
            }
        }
        self.apply_until(self.timeline.position_of(seq));
        Ok(())
    }

    /// Apply everything.
    pub fn advance_to_end(&mut self) {
        self.apply_until(self.timeline.len());
    }

    /// Apply entries up to (excluding) index `end`. Never moves backwards.
    fn apply_until(&mut self, end: usize) {
        let timeline = self.timeline;
        let Some(pending) = timeline.entries().get(self.applied..end) else {
            return;
        };
        for entry in pending {
            if let Some((file, code)) = entry.edit_target(&self.default_file) {
                self.files.insert(file.to_string(), code.to_string());
            }
        }
        self.applied = end;
    }

    /// Sequence of the last applied entry.
    #[must_use]
    pub fn position(&self) -> Option<u64> {
        self.applied
            .checked_sub(1)
            .map(|i| self.timeline.entries()[i].sequence)
    }

    #[must_use]
    pub const fn files(&self) -> &FileMap {
        &self.files
    }

    #[must_use]
    pub fn snapshot(&self) -> ReplaySnapshot {
        let event = self
            .applied
            .checked_sub(1)
            .map(|i| self.timeline.entries()[i].clone());
        ReplaySnapshot {
            at_sequence: event.as_ref().map(|e| e.sequence),
            files: self.files.clone(),
            event,
        }
    }

    #[must_use]
    pub fn into_files(self) -> FileMap {
        self.files
    }
}

/// State after every event with `sequence <= seq`. `seq = 0` is the
/// starter state.
///
/// # Errors
///
/// Returns [`ReplayError::SequenceOutOfRange`] if `seq` is past the last
/// event.
pub fn reconstruct_at_sequence(
    timeline: &Timeline,
    starter: &FileMap,
    default_file: &str,
    seq: u64,
) -> Result<ReplaySnapshot, ReplayError> {
    let last = timeline.last_sequence();
    if seq > last.unwrap_or(0) {
        return Err(ReplayError::SequenceOutOfRange {
            requested: seq,
            last,
        });
    }
    let mut replayer = Replayer::new(timeline, starter, default_file);
    replayer.advance_to(seq)?;
    Ok(replayer.snapshot())
}

/// State at the `step`-th (0-based) meaningful event.
///
/// # Errors
///
/// Returns [`ReplayError::StepOutOfRange`] if there are not enough
/// meaningful events.
pub fn reconstruct_at_step(
    timeline: &Timeline,
    starter: &FileMap,
    default_file: &str,
    step: usize,
) -> Result<ReplaySnapshot, ReplayError> {
    let index = timeline.meaningful_sequences(default_file);
    let seq = *index.get(step).ok_or(ReplayError::StepOutOfRange {
        step,
        len: index.len(),
    })?;
    reconstruct_at_sequence(timeline, starter, default_file, seq)
}

/// State after the whole ledger.
#[must_use]
pub fn reconstruct_final(timeline: &Timeline, starter: &FileMap, default_file: &str) -> FileMap {
    let mut replayer = Replayer::new(timeline, starter, default_file);
    replayer.advance_to_end();
    replayer.into_files()
}

/// Outcome of comparing the cached final state with a full replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FinalStateCheck {
    NotSaved,
    Matches,
    Mismatch { files: Vec<String> },
}

/// Compare `attempt.final_state` against replaying the full ledger.
#[must_use]
pub fn verify_final_state(
    attempt: &Attempt,
    timeline: &Timeline,
    default_file: &str,
) -> FinalStateCheck {
    let Some(saved) = &attempt.final_state else {
        return FinalStateCheck::NotSaved;
    };
    let replayed = reconstruct_final(timeline, &attempt.starter_state, default_file);

    let mut files: Vec<String> = saved
        .keys()
        .chain(replayed.keys())
        .filter(|name| saved.get(*name) != replayed.get(*name))
        .cloned()
        .collect();
    files.sort();
    files.dedup();

    if files.is_empty() {
        FinalStateCheck::Matches
    } else {
        FinalStateCheck::Mismatch { files }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(seq: u64, kind: &str, file: Option<&str>, payload: serde_json::Value) -> WireEvent {
        WireEvent {
            t: 0.0,
            seq,
            kind: kind.into(),
            file_path: file.map(str::to_string),
            payload_json: payload.to_string(),
        }
    }

    fn edit(seq: u64, file: Option<&str>, code: &str) -> WireEvent {
        wire(seq, "edit", file, json!({"fullCode": code}))
    }

    fn starter() -> FileMap {
        FileMap::from([("main.py".into(), "print('hi')".into())])
    }

    #[test]
    fn edits_replace_content_and_others_do_not() {
        let timeline = Timeline::from_wire(&[
            edit(1, None, "print('hello')"),
            wire(2, "paste", None, json!({"size": 150})),
            wire(3, "run", None, json!({})),
            edit(4, None, "print('bye')"),
        ]);
        let snap = reconstruct_at_sequence(&timeline, &starter(), "main.py", 3).expect("snap");
        assert_eq!(snap.files["main.py"], "print('hello')");
        assert_eq!(snap.at_sequence, Some(3));
        assert_eq!(
            snap.event.and_then(|e| e.parsed_kind()),
            Some(EventKind::Run)
        );
    }

    #[test]
    fn sequence_zero_is_starter_state() {
        let timeline = Timeline::from_wire(&[edit(1, None, "x")]);
        let snap = reconstruct_at_sequence(&timeline, &starter(), "main.py", 0).expect("snap");
        assert_eq!(snap.files, starter());
        assert_eq!(snap.at_sequence, None);
    }

    #[test]
    fn out_of_range_sequence_is_an_error() {
        let timeline = Timeline::from_wire(&[edit(1, None, "x")]);
        let err = reconstruct_at_sequence(&timeline, &starter(), "main.py", 2)
            .expect_err("past the end");
        assert_eq!(
            err,
            ReplayError::SequenceOutOfRange {
                requested: 2,
                last: Some(1)
            }
        );
    }

    #[test]
    fn unparsable_events_are_tagged_and_skipped() {
        let timeline = Timeline::from_wire(&[
            edit(1, None, "ok"),
            wire(2, "edit", None, json!({"code": "bad"})),
            wire(3, "scroll", None, json!({})),
        ]);
        assert_eq!(timeline.unparsable_count(), 2);
        let files = reconstruct_final(&timeline, &starter(), "main.py");
        assert_eq!(files["main.py"], "ok");
        let serialized = serde_json::to_value(&timeline.entries()[1]).expect("json");
        assert_eq!(serialized["status"], "unparsable");
    }

    #[test]
    fn multi_file_edits_target_their_file() {
        let timeline = Timeline::from_wire(&[
            edit(1, Some("util.py"), "def f(): pass"),
            edit(2, None, "import util"),
        ]);
        let files = reconstruct_final(&timeline, &starter(), "main.py");
        assert_eq!(files["util.py"], "def f(): pass");
        assert_eq!(files["main.py"], "import util");
    }

    #[test]
    fn meaningful_index_skips_repeated_full_code_per_file() {
        let timeline = Timeline::from_wire(&[
            edit(1, None, "a"),
            edit(2, None, "a"),
            edit(3, Some("b.py"), "a"),
            wire(4, "run", None, json!({})),
            edit(5, None, "a"),
            edit(6, None, "ab"),
        ]);
        assert_eq!(timeline.meaningful_sequences("main.py"), vec![1, 3, 4, 6]);
        let snap = reconstruct_at_step(&timeline, &starter(), "main.py", 3).expect("step");
        assert_eq!(snap.at_sequence, Some(6));
        assert!(matches!(
            reconstruct_at_step(&timeline, &starter(), "main.py", 4),
            Err(ReplayError::StepOutOfRange { step: 4, len: 4 })
        ));
    }

    #[test]
    fn replayer_refuses_to_rewind() {
        let timeline = Timeline::from_wire(&[edit(1, None, "a"), edit(2, None, "b")]);
        let mut replayer = Replayer::new(&timeline, &starter(), "main.py");
        replayer.advance_to(2).expect("forward");
        assert_eq!(
            replayer.advance_to(1),
            Err(ReplayError::Rewind { from: 2, to: 1 })
        );
    }

    #[test]
    fn advance_to_end_continues_from_current_position() {
        let timeline = Timeline::from_wire(&[
            edit(1, None, "a"),
            edit(2, Some("util.py"), "u"),
            edit(3, None, "abc"),
        ]);
        let mut replayer = Replayer::new(&timeline, &starter(), "main.py");
        replayer.advance_to(1).expect("forward");
        replayer.advance_to_end();
        assert_eq!(replayer.position(), Some(3));
        replayer.advance_to_end();
        replayer.advance_to(3).expect("same position");
        assert_eq!(
            replayer.into_files(),
            reconstruct_final(&timeline, &starter(), "main.py")
        );

        let empty = Timeline::default();
        let mut replayer = Replayer::new(&empty, &starter(), "main.py");
        replayer.advance_to_end();
        assert_eq!(replayer.position(), None);
        assert_eq!(replayer.into_files(), starter());
    }

    #[test]
    fn timeline_sorts_and_dedups() {
        let timeline = Timeline::from_wire(&[edit(2, None, "b"), edit(1, None, "a"), edit(2, None, "z")]);
        let seqs: Vec<u64> = timeline.entries().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(reconstruct_final(&timeline, &starter(), "main.py")["main.py"], "b");
    }

    #[test]
    fn final_state_check_reports_differing_files() {
        let timeline = Timeline::from_wire(&[edit(1, None, "x")]);
        let mut attempt = Attempt {
            id: 1,
            assignment_id: None,
            started_at: chrono::Utc::now(),
            finished_at: None,
            starter_state: starter(),
            final_state: None,
        };
        assert_eq!(verify_final_state(&attempt, &timeline, "main.py"), FinalStateCheck::NotSaved);

        attempt.final_state = Some(FileMap::from([("main.py".into(), "x".into())]));
        assert_eq!(verify_final_state(&attempt, &timeline, "main.py"), FinalStateCheck::Matches);

        attempt.final_state = Some(FileMap::from([
            ("main.py".into(), "x".into()),
            ("extra.py".into(), String::new()),
        ]));
        assert_eq!(
            verify_final_state(&attempt, &timeline, "main.py"),
            FinalStateCheck::Mismatch {
                files: vec!["extra.py".into()]
            }
        );
    }
}
