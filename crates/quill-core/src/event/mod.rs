//! Event data model for the session ledger.
//!
//! This module defines the typed [`Event`], the [`EventKind`] catalog, the
//! per-kind payload structs, and the [`WireEvent`]/[`EventBatch`] shapes that
//! cross the ingestion boundary.
//!
//! # Wire format
//!
//! ```text
//! {"t": 12.5, "seq": 42, "type": "edit", "file_path": "main.py", "payload_json": "{...}"}
//! ```
//!
//! `payload_json` is an opaque serialized object whose shape is determined
//! by `type`. Decoding it into a typed [`EventPayload`] happens at the
//! ingestion and reconstruction boundaries; a payload that does not match
//! its kind is quarantined, never silently reinterpreted.

pub mod kind;
pub mod payload;

pub use kind::{EventKind, UnknownEventKind};
pub use payload::{
    AiPromptData, AiResponseData, AnswerFeedbackData, AnswerSubmittedData, CursorData, EditData,
    EventPayload, Extra, FileCreateData, FileDeleteData, FileSwitchData, HintReceivedData,
    HintRequestedData, ParsonsDragData, ParsonsDropData, PasteData, PayloadError, RunData,
    TechniqueTransitionData,
};

use serde::{Deserialize, Serialize};

use crate::AttemptId;

/// The sequence number assigned to the first event of every attempt.
pub const FIRST_SEQUENCE: u64 = 1;

/// A single captured action, typed and sequenced.
///
/// `sequence` defines the total order within an attempt. `relative_time`
/// is seconds since logging started and is only used for display and
/// metrics, never for ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Strictly increasing, unique within the attempt.
    pub sequence: u64,
    /// Seconds since logging start; non-decreasing.
    pub relative_time: f64,
    /// File this event applies to. `None` for single-file attempts.
    pub file_path: Option<String>,
    /// Typed payload; its variant determines the event kind.
    pub payload: EventPayload,
}

impl Event {
    /// The event kind, derived from the payload variant.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Convert to the wire shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize.
    pub fn to_wire(&self) -> Result<WireEvent, serde_json::Error> {
        Ok(WireEvent {
            t: self.relative_time,
            seq: self.sequence,
            kind: self.kind().as_str().to_string(),
            file_path: self.file_path.clone(),
            payload_json: self.payload.to_json()?,
        })
    }

    /// Decode a wire event into a typed event.
    ///
    /// # Errors
    ///
    /// Returns [`EventDecodeError::UnknownKind`] if `type` is not one of the
    /// 16 known kinds, or [`EventDecodeError::Payload`] if `payload_json`
    /// does not match the kind's schema.
    pub fn from_wire(wire: &WireEvent) -> Result<Self, EventDecodeError> {
        let kind: EventKind = wire.kind.parse()?;
        let payload = EventPayload::deserialize_for(kind, &wire.payload_json)?;
        Ok(Self {
            sequence: wire.seq,
            relative_time: wire.t,
            file_path: wire.file_path.clone(),
            payload,
        })
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{}\t{:.3}s\t{}\t{}\t{}",
            self.sequence,
            self.relative_time,
            self.kind(),
            self.file_path.as_deref().unwrap_or("-"),
            summary(&self.payload),
        )
    }
}

/// One-line human summary of a payload, used by timelines and logs.
#[must_use]
pub fn summary(payload: &EventPayload) -> String {
    match payload {
        EventPayload::Edit(d) => format!(
            "+{} -{} ({} changes, {} chars)",
            d.chars_added, d.chars_removed, d.change_count, d.new_length
        ),
        EventPayload::Cursor(d) => format!("{}:{}", d.line, d.column),
        EventPayload::Paste(d) => format!("{} chars", d.size),
        EventPayload::Run(d) => d
            .exit_code
            .map_or_else(|| "run".to_string(), |code| format!("exit {code}")),
        EventPayload::AiPrompt(d) => preview(&d.prompt),
        EventPayload::AiResponse(d) => preview(&d.response),
        EventPayload::FileCreate(_) => "created".to_string(),
        EventPayload::FileDelete(_) => "deleted".to_string(),
        EventPayload::FileSwitch(d) => {
            format!("from {}", d.from.as_deref().unwrap_or("-"))
        }
        EventPayload::HintRequested(d) => {
            d.level.map_or_else(|| "hint".to_string(), |l| format!("level {l}"))
        }
        EventPayload::HintReceived(d) => preview(&d.hint),
        EventPayload::TechniqueTransition(d) => {
            format!("{} -> {}", d.from.as_deref().unwrap_or("-"), d.to)
        }
        EventPayload::ParsonsDrag(d) => d.block_id.clone(),
        EventPayload::ParsonsDrop(d) => match d.to_index {
            Some(index) => format!("{} @ {index}", d.block_id),
            None => d.block_id.clone(),
        },
        EventPayload::AnswerSubmitted(d) => preview(&d.answer.to_string()),
        EventPayload::AnswerFeedback(d) => {
            let verdict = if d.correct { "correct" } else { "incorrect" };
            verdict.to_string()
        }
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 40;
    if text.chars().count() > MAX {
        let cut: String = text.chars().take(MAX).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// Event as it crosses the ingestion and replay boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Seconds since logging start.
    pub t: f64,
    /// Sequence number.
    pub seq: u64,
    /// Event kind string; may be unknown to this build.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub file_path: Option<String>,
    /// Opaque serialized payload object.
    pub payload_json: String,
}

impl WireEvent {
    /// Try to decode into a typed [`Event`].
    ///
    /// # Errors
    ///
    /// Same as [`Event::from_wire`].
    pub fn decode(&self) -> Result<Event, EventDecodeError> {
        Event::from_wire(self)
    }
}

/// Atomic upload unit: every event in a batch is stored or none is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    #[serde(alias = "attemptId")]
    pub attempt_id: AttemptId,
    pub events: Vec<WireEvent>,
}

impl EventBatch {
    /// Build a batch from typed events.
    ///
    /// # Errors
    ///
    /// Returns an error if any payload fails to serialize.
    pub fn from_events<'a>(
        attempt_id: AttemptId,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> Result<Self, serde_json::Error> {
        let events = events
            .into_iter()
            .map(Event::to_wire)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { attempt_id, events })
    }

    /// Inclusive sequence range covered by this batch.
    #[must_use]
    pub fn sequence_range(&self) -> Option<(u64, u64)> {
        let first = self.events.iter().map(|e| e.seq).min()?;
        let last = self.events.iter().map(|e| e.seq).max()?;
        Some((first, last))
    }
}

/// Errors from decoding a [`WireEvent`].
#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error(transparent)]
    UnknownKind(#[from] UnknownEventKind),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl EventDecodeError {
    /// Stable error code for this failure class.
    #[must_use]
    pub const fn code(&self) -> crate::error::ErrorCode {
        match self {
            Self::UnknownKind(_) => crate::error::ErrorCode::UnknownEventKind,
            Self::Payload(_) => crate::error::ErrorCode::PayloadSchemaMismatch,
        }
    }
}
