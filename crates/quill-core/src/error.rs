use std::fmt;

/// Machine-readable error codes surfaced by the CLI and HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    InvalidLoggingSettings,
    AttemptNotFound,
    AttemptFinished,
    UnknownEventKind,
    PayloadSchemaMismatch,
    SequenceCollision,
    SequenceGap,
    FinalStateMismatch,
    StoreWriteFailed,
    CorruptStore,
    UploadFailed,
    InvalidRequest,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::InvalidLoggingSettings => "E1003",
            Self::AttemptNotFound => "E2001",
            Self::AttemptFinished => "E2002",
            Self::UnknownEventKind => "E2003",
            Self::PayloadSchemaMismatch => "E2004",
            Self::SequenceCollision => "E3001",
            Self::SequenceGap => "E3002",
            Self::FinalStateMismatch => "E3003",
            Self::StoreWriteFailed => "E5001",
            Self::CorruptStore => "E5002",
            Self::UploadFailed => "E5003",
            Self::InvalidRequest => "E6001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Project not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::InvalidLoggingSettings => "Invalid logging settings",
            Self::AttemptNotFound => "Attempt not found",
            Self::AttemptFinished => "Attempt already finished",
            Self::UnknownEventKind => "Unknown event kind",
            Self::PayloadSchemaMismatch => "Payload does not match its event kind",
            Self::SequenceCollision => "Sequence number reused with different content",
            Self::SequenceGap => "Sequence gap in ledger",
            Self::FinalStateMismatch => "Final state differs from full replay",
            Self::StoreWriteFailed => "Event store write failed",
            Self::CorruptStore => "Corrupt event store",
            Self::UploadFailed => "Event upload failed",
            Self::InvalidRequest => "Invalid request",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `quill init` to initialize this directory."),
            Self::ConfigParseError => Some("Fix syntax in .quill/config.toml and retry."),
            Self::InvalidLoggingSettings => Some(
                "cursor_tracking_interval must be 1000-10000 ms and batch_interval 3-30 s.",
            ),
            Self::AttemptNotFound => Some("List attempts with `quill attempt list`."),
            Self::AttemptFinished => None,
            Self::UnknownEventKind | Self::PayloadSchemaMismatch => {
                Some("The event is kept in the ledger and shown as unparsable in replay.")
            }
            Self::SequenceCollision | Self::SequenceGap => {
                Some("The ledger is flagged for manual review; inspect with `quill verify`.")
            }
            Self::FinalStateMismatch => {
                Some("Trust the replayed state; the saved snapshot is only a cache.")
            }
            Self::StoreWriteFailed => Some("Check disk space and write permissions."),
            Self::CorruptStore => Some("Restore the store from backup; the ledger is authoritative."),
            Self::UploadFailed => Some("Events stay queued and are retried on the next flush."),
            Self::InvalidRequest => None,
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::NotInitialized,
            ErrorCode::ConfigParseError,
            ErrorCode::InvalidLoggingSettings,
            ErrorCode::AttemptNotFound,
            ErrorCode::AttemptFinished,
            ErrorCode::UnknownEventKind,
            ErrorCode::PayloadSchemaMismatch,
            ErrorCode::SequenceCollision,
            ErrorCode::SequenceGap,
            ErrorCode::FinalStateMismatch,
            ErrorCode::StoreWriteFailed,
            ErrorCode::CorruptStore,
            ErrorCode::UploadFailed,
            ErrorCode::InvalidRequest,
            ErrorCode::InternalUnexpected,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::SequenceCollision.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }
}
