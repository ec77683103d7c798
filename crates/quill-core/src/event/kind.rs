//! Event kind enum covering all 16 captured student actions.
//!
//! The string form is the snake_case `type` column of the wire schema.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The 16 event kinds captured during a logging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// Coalesced burst of content changes carrying the full file content.
    Edit,
    /// Sampled cursor position.
    Cursor,
    /// Clipboard paste into the editor.
    Paste,
    /// Code run request.
    Run,
    /// Prompt sent to the AI assistant.
    AiPrompt,
    /// Response received from the AI assistant.
    AiResponse,
    /// File added to a multi-file project.
    FileCreate,
    /// File removed from a multi-file project.
    FileDelete,
    /// Active editor tab changed.
    FileSwitch,
    /// Student asked for a hint.
    HintRequested,
    /// Hint shown to the student.
    HintReceived,
    /// Exercise technique changed (e.g. parsons → free coding).
    TechniqueTransition,
    /// Parsons block picked up.
    ParsonsDrag,
    /// Parsons block dropped.
    ParsonsDrop,
    /// Answer submitted for grading.
    AnswerSubmitted,
    /// Grading feedback shown.
    AnswerFeedback,
}

/// Error returned when parsing an unknown event kind string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind '{raw}'")]
pub struct UnknownEventKind {
    /// The unrecognised input string.
    pub raw: String,
}

impl EventKind {
    /// All known kinds in catalog order.
    pub const ALL: [Self; 16] = [
        Self::Edit,
        Self::Cursor,
        Self::Paste,
        Self::Run,
        Self::AiPrompt,
        Self::AiResponse,
        Self::FileCreate,
        Self::FileDelete,
        Self::FileSwitch,
        Self::HintRequested,
        Self::HintReceived,
        Self::TechniqueTransition,
        Self::ParsonsDrag,
        Self::ParsonsDrop,
        Self::AnswerSubmitted,
        Self::AnswerFeedback,
    ];

    /// Return the wire `type` string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Edit => "edit",
            Self::Cursor => "cursor",
            Self::Paste => "paste",
            Self::Run => "run",
            Self::AiPrompt => "ai_prompt",
            Self::AiResponse => "ai_response",
            Self::FileCreate => "file_create",
            Self::FileDelete => "file_delete",
            Self::FileSwitch => "file_switch",
            Self::HintRequested => "hint_requested",
            Self::HintReceived => "hint_received",
            Self::TechniqueTransition => "technique_transition",
            Self::ParsonsDrag => "parsons_drag",
            Self::ParsonsDrop => "parsons_drop",
            Self::AnswerSubmitted => "answer_submitted",
            Self::AnswerFeedback => "answer_feedback",
        }
    }

    /// True for the two halves of an AI exchange.
    #[must_use]
    pub const fn is_ai(self) -> bool {
        matches!(self, Self::AiPrompt | Self::AiResponse)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind { raw: s.to_string() })
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}
