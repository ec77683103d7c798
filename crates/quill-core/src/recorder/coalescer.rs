//! Debounced collapsing of raw content changes into single `edit` events.
//!
//! The coalescer only buffers and collapses; the owning recorder arms the
//! debounce timer and decides when to flush.

use crate::clock::Millis;
use crate::event::{EditData, Extra};

/// One raw content-change notification. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditChange {
    pub timestamp: Millis,
    pub file_path: Option<String>,
    pub previous_content: String,
    pub new_content: String,
}

/// Result of collapsing a burst: the file it applies to and the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescedEdit {
    pub file_path: Option<String>,
    pub data: EditData,
}

#[derive(Debug, Default)]
pub struct EditCoalescer {
    buffer: Vec<EditChange>,
}

impl EditCoalescer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a change.
    ///
    /// If the change targets a different file than the buffered burst, the
    /// burst is collapsed first and returned so each edit covers one file.
    pub fn push(&mut self, change: EditChange) -> Option<CoalescedEdit> {
        let flushed = match self.buffer.first() {
            Some(first) if first.file_path != change.file_path => self.flush(),
            _ => None,
        };
        self.buffer.push(change);
        flushed
    }

    /// Collapse and clear the buffer.
    ///
    /// Returns `None` when the buffer is empty or the burst's net content
    /// is unchanged.
    pub fn flush(&mut self) -> Option<CoalescedEdit> {
        let buffer = std::mem::take(&mut self.buffer);
        let (first, last) = (buffer.first()?, buffer.last()?);

        if first.previous_content == last.new_content {
            tracing::debug!(
                changes = buffer.len(),
                "burst restored original content; no edit emitted"
            );
            return None;
        }

        let previous_length = first.previous_content.chars().count();
        let new_length = last.new_content.chars().count();

        Some(CoalescedEdit {
            file_path: first.file_path.clone(),
            data: EditData {
                previous_length,
                new_length,
                chars_added: new_length.saturating_sub(previous_length),
                chars_removed: previous_length.saturating_sub(new_length),
                change_count: buffer.len(),
                duration: last.timestamp.saturating_sub(first.timestamp),
                full_code: last.new_content.clone(),
                extra: Extra::new(),
            },
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of raw changes waiting to be collapsed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// File targeted by the buffered burst, if any changes are buffered.
    #[must_use]
    pub fn buffered_file(&self) -> Option<Option<&str>> {
        self.buffer.first().map(|c| c.file_path.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(ts: Millis, file: Option<&str>, prev: &str, next: &str) -> EditChange {
        EditChange {
            timestamp: ts,
            file_path: file.map(str::to_string),
            previous_content: prev.to_string(),
            new_content: next.to_string(),
        }
    }

    #[test]
    fn burst_collapses_to_one_edit() {
        let mut c = EditCoalescer::new();
        assert!(c.push(change(0, None, "print('hi')", "print('hil')")).is_none());
        assert!(c.push(change(120, None, "print('hil')", "print('hill')")).is_none());
        assert!(c.push(change(250, None, "print('hill')", "print('hello')")).is_none());

        let edit = c.flush().expect("edit");
        assert_eq!(edit.data.previous_length, 11);
        assert_eq!(edit.data.new_length, 14);
        assert_eq!(edit.data.chars_added, 3);
        assert_eq!(edit.data.chars_removed, 0);
        assert_eq!(edit.data.change_count, 3);
        assert_eq!(edit.data.duration, 250);
        assert_eq!(edit.data.full_code, "print('hello')");
        assert!(c.is_empty());
    }

    #[test]
    fn type_then_undo_emits_nothing() {
        let mut c = EditCoalescer::new();
        c.push(change(0, None, "x = 1", "x = 12"));
        c.push(change(50, None, "x = 12", "x = 1"));
        assert!(c.flush().is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn deletion_counts_removed_chars() {
        let mut c = EditCoalescer::new();
        c.push(change(0, None, "abcdef", "abc"));
        let edit = c.flush().expect("edit");
        assert_eq!(edit.data.chars_added, 0);
        assert_eq!(edit.data.chars_removed, 3);
    }

    #[test]
    fn lengths_count_unicode_scalars() {
        let mut c = EditCoalescer::new();
        c.push(change(0, None, "", "héllo"));
        let edit = c.flush().expect("edit");
        assert_eq!(edit.data.new_length, 5);
        assert_eq!(edit.data.chars_added, 5);
    }

    #[test]
    fn switching_file_flushes_previous_burst() {
        let mut c = EditCoalescer::new();
        c.push(change(0, Some("a.py"), "", "a"));
        let flushed = c
            .push(change(10, Some("b.py"), "", "b"))
            .expect("a.py burst flushed");
        assert_eq!(flushed.file_path.as_deref(), Some("a.py"));
        assert_eq!(flushed.data.full_code, "a");
        assert_eq!(c.buffered_file(), Some(Some("b.py")));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn flushing_empty_buffer_is_noop() {
        let mut c = EditCoalescer::new();
        assert!(c.flush().is_none());
        assert_eq!(c.buffered_file(), None);
    }
}
