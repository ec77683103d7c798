//! Typed payload structs for each event kind.
//!
//! Payload JSON uses camelCase keys. Unknown keys are preserved via
//! `#[serde(flatten)]` so that newer clients never lose data when an older
//! server re-serializes a payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::kind::EventKind;

/// Unknown payload keys, kept verbatim.
pub type Extra = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Typed payload for an event. The discriminant is the wire `type` column,
/// not a key inside the JSON, so deserialization goes through
/// [`EventPayload::deserialize_for`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Edit(EditData),
    Cursor(CursorData),
    Paste(PasteData),
    Run(RunData),
    AiPrompt(AiPromptData),
    AiResponse(AiResponseData),
    FileCreate(FileCreateData),
    FileDelete(FileDeleteData),
    FileSwitch(FileSwitchData),
    HintRequested(HintRequestedData),
    HintReceived(HintReceivedData),
    TechniqueTransition(TechniqueTransitionData),
    ParsonsDrag(ParsonsDragData),
    ParsonsDrop(ParsonsDropData),
    AnswerSubmitted(AnswerSubmittedData),
    AnswerFeedback(AnswerFeedbackData),
}

impl EventPayload {
    /// Deserialize a payload JSON string into the variant declared by `kind`.
    ///
    /// # Errors
    ///
    /// Returns a [`PayloadError`] if the JSON is malformed or does not match
    /// the schema of `kind`.
    pub fn deserialize_for(kind: EventKind, json: &str) -> Result<Self, PayloadError> {
        let result = match kind {
            EventKind::Edit => serde_json::from_str(json).map(Self::Edit),
            EventKind::Cursor => serde_json::from_str(json).map(Self::Cursor),
            EventKind::Paste => serde_json::from_str(json).map(Self::Paste),
            EventKind::Run => serde_json::from_str(json).map(Self::Run),
            EventKind::AiPrompt => serde_json::from_str(json).map(Self::AiPrompt),
            EventKind::AiResponse => serde_json::from_str(json).map(Self::AiResponse),
            EventKind::FileCreate => serde_json::from_str(json).map(Self::FileCreate),
            EventKind::FileDelete => serde_json::from_str(json).map(Self::FileDelete),
            EventKind::FileSwitch => serde_json::from_str(json).map(Self::FileSwitch),
            EventKind::HintRequested => serde_json::from_str(json).map(Self::HintRequested),
            EventKind::HintReceived => serde_json::from_str(json).map(Self::HintReceived),
            EventKind::TechniqueTransition => {
                serde_json::from_str(json).map(Self::TechniqueTransition)
            }
            EventKind::ParsonsDrag => serde_json::from_str(json).map(Self::ParsonsDrag),
            EventKind::ParsonsDrop => serde_json::from_str(json).map(Self::ParsonsDrop),
            EventKind::AnswerSubmitted => serde_json::from_str(json).map(Self::AnswerSubmitted),
            EventKind::AnswerFeedback => serde_json::from_str(json).map(Self::AnswerFeedback),
        };

        result.map_err(|source| PayloadError { kind, source })
    }

    /// The kind this payload belongs to.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Edit(_) => EventKind::Edit,
            Self::Cursor(_) => EventKind::Cursor,
            Self::Paste(_) => EventKind::Paste,
            Self::Run(_) => EventKind::Run,
            Self::AiPrompt(_) => EventKind::AiPrompt,
            Self::AiResponse(_) => EventKind::AiResponse,
            Self::FileCreate(_) => EventKind::FileCreate,
            Self::FileDelete(_) => EventKind::FileDelete,
            Self::FileSwitch(_) => EventKind::FileSwitch,
            Self::HintRequested(_) => EventKind::HintRequested,
            Self::HintReceived(_) => EventKind::HintReceived,
            Self::TechniqueTransition(_) => EventKind::TechniqueTransition,
            Self::ParsonsDrag(_) => EventKind::ParsonsDrag,
            Self::ParsonsDrop(_) => EventKind::ParsonsDrop,
            Self::AnswerSubmitted(_) => EventKind::AnswerSubmitted,
            Self::AnswerFeedback(_) => EventKind::AnswerFeedback,
        }
    }

    /// Serialize the payload to its compact JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the inner struct fails to serialize (only possible
    /// with non-string map keys in `extra`, which the types rule out).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Borrow the edit payload, if this is one.
    #[must_use]
    pub const fn as_edit(&self) -> Option<&EditData> {
        match self {
            Self::Edit(d) => Some(d),
            _ => None,
        }
    }
}

impl Serialize for EventPayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Edit(d) => d.serialize(serializer),
            Self::Cursor(d) => d.serialize(serializer),
            Self::Paste(d) => d.serialize(serializer),
            Self::Run(d) => d.serialize(serializer),
            Self::AiPrompt(d) => d.serialize(serializer),
            Self::AiResponse(d) => d.serialize(serializer),
            Self::FileCreate(d) => d.serialize(serializer),
            Self::FileDelete(d) => d.serialize(serializer),
            Self::FileSwitch(d) => d.serialize(serializer),
            Self::HintRequested(d) => d.serialize(serializer),
            Self::HintReceived(d) => d.serialize(serializer),
            Self::TechniqueTransition(d) => d.serialize(serializer),
            Self::ParsonsDrag(d) => d.serialize(serializer),
            Self::ParsonsDrop(d) => d.serialize(serializer),
            Self::AnswerSubmitted(d) => d.serialize(serializer),
            Self::AnswerFeedback(d) => d.serialize(serializer),
        }
    }
}

/// Error returned when a payload does not decode as its declared kind.
#[derive(Debug, thiserror::Error)]
#[error("invalid {kind} payload: {source}")]
pub struct PayloadError {
    /// The declared kind.
    pub kind: EventKind,
    /// The underlying JSON error.
    #[source]
    pub source: serde_json::Error,
}

// ---------------------------------------------------------------------------
// Per-kind payloads
// ---------------------------------------------------------------------------

/// Payload for `edit`: the collapsed result of one typing burst.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditData {
    #[serde(default)]
    pub previous_length: usize,
    #[serde(default)]
    pub new_length: usize,
    #[serde(default)]
    pub chars_added: usize,
    #[serde(default)]
    pub chars_removed: usize,
    /// Number of raw change notifications collapsed into this event.
    #[serde(default)]
    pub change_count: usize,
    /// Milliseconds between the first and last change in the burst.
    #[serde(default)]
    pub duration: u64,
    /// Full file content after the burst.
    pub full_code: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorData {
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_length: Option<u32>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Payload for `paste`. `size` is the pasted length in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasteData {
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiPromptData {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResponseData {
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCreateData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_content: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDeleteData {
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSwitchData {
    /// File that was active before the switch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintRequestedData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintReceivedData {
    pub hint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechniqueTransitionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsonsDragData {
    pub block_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_index: Option<u32>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsonsDropData {
    pub block_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_index: Option<u32>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Payload for `answer_submitted`. The answer shape depends on the
/// question type, so it is kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSubmittedData {
    pub answer: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerFeedbackData {
    pub correct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn edit_payload_uses_camel_case_keys() {
        let payload = EventPayload::Edit(EditData {
            previous_length: 11,
            new_length: 14,
            chars_added: 3,
            chars_removed: 0,
            change_count: 3,
            duration: 420,
            full_code: "print('hello')".into(),
            extra: Extra::new(),
        });

        let value: Value = serde_json::from_str(&payload.to_json().expect("serialize"))
            .expect("valid json");
        assert_eq!(value["fullCode"], "print('hello')");
        assert_eq!(value["charsAdded"], 3);
        assert_eq!(value["changeCount"], 3);
        assert!(value.get("full_code").is_none());
    }

    #[test]
    fn edit_requires_full_code() {
        let err = EventPayload::deserialize_for(EventKind::Edit, r#"{"charsAdded":1}"#)
            .unwrap_err();
        assert_eq!(err.kind, EventKind::Edit);
        assert!(err.to_string().contains("invalid edit payload"));
    }

    #[test]
    fn edit_counters_default_to_zero() {
        let payload =
            EventPayload::deserialize_for(EventKind::Edit, r#"{"fullCode":"x = 1"}"#)
                .expect("minimal edit");
        let edit = payload.as_edit().expect("edit variant");
        assert_eq!(edit.full_code, "x = 1");
        assert_eq!(edit.change_count, 0);
        assert_eq!(edit.duration, 0);
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let raw = json!({"size": 150, "source": "clipboard"}).to_string();
        let payload = EventPayload::deserialize_for(EventKind::Paste, &raw).expect("paste");
        let EventPayload::Paste(paste) = &payload else {
            panic!("expected paste");
        };
        assert_eq!(paste.size, 150);
        assert_eq!(paste.extra.get("source"), Some(&json!("clipboard")));

        let back: Value = serde_json::from_str(&payload.to_json().expect("serialize"))
            .expect("valid json");
        assert_eq!(back["source"], "clipboard");
    }

    #[test]
    fn payload_must_match_declared_kind() {
        let paste = json!({"size": 10}).to_string();
        assert!(EventPayload::deserialize_for(EventKind::Paste, &paste).is_ok());
        assert!(EventPayload::deserialize_for(EventKind::AiPrompt, &paste).is_err());
        assert!(EventPayload::deserialize_for(EventKind::Cursor, "not json").is_err());
    }

    #[test]
    fn empty_object_is_valid_for_kinds_without_required_fields() {
        for kind in [
            EventKind::Run,
            EventKind::FileCreate,
            EventKind::FileDelete,
            EventKind::FileSwitch,
            EventKind::HintRequested,
        ] {
            let payload = EventPayload::deserialize_for(kind, "{}").expect("empty payload");
            assert_eq!(payload.kind(), kind);
        }
    }

    #[test]
    fn answer_keeps_arbitrary_json() {
        let raw = json!({"answer": {"choice": [1, 3]}, "questionId": "q7"}).to_string();
        let payload =
            EventPayload::deserialize_for(EventKind::AnswerSubmitted, &raw).expect("answer");
        let EventPayload::AnswerSubmitted(answer) = payload else {
            panic!("expected answer");
        };
        assert_eq!(answer.answer, json!({"choice": [1, 3]}));
        assert_eq!(answer.question_id.as_deref(), Some("q7"));
    }
}
