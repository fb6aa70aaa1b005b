//! Note model

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::now_millis;

use super::id::uuid_id;

/// Maximum note body length in characters
pub const MAX_NOTE_CONTENT_CHARS: usize = 100_000;

uuid_id! {
    /// A unique identifier for a note, using UUID v7 (time-sortable)
    NoteId
}

/// A note in the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Unique identifier
    pub id: NoteId,
    /// Plain text content
    pub content: String,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last modification timestamp (Unix ms)
    pub modified_at: i64,
    /// Tombstone timestamp (Unix ms)
    pub deleted_at: Option<i64>,
}

impl Note {
    /// Create a new note with the given content
    pub fn new(content: impl Into<String>) -> Result<Self> {
        let content = content.into();
        validate_content(&content)?;
        let now = now_millis();
        Ok(Self {
            id: NoteId::new(),
            content,
            created_at: now,
            modified_at: now,
            deleted_at: None,
        })
    }

    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Short single-line preview used by list views
    pub fn preview(&self, max_chars: usize) -> String {
        let first_line = self.content.lines().next().unwrap_or_default().trim();
        if first_line.chars().count() > max_chars {
            let truncated: String = first_line.chars().take(max_chars).collect();
            format!("{truncated}...")
        } else {
            first_line.to_string()
        }
    }
}

pub(crate) fn validate_content(content: &str) -> Result<()> {
    if content.chars().count() > MAX_NOTE_CONTENT_CHARS {
        return Err(Error::validation(
            "content",
            format!("note content exceeds {MAX_NOTE_CONTENT_CHARS} characters"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_creation() {
        let note = Note::new("Hello world").unwrap();
        assert_eq!(note.content, "Hello world");
        assert_eq!(note.created_at, note.modified_at);
        assert!(!note.is_deleted());
    }

    #[test]
    fn test_note_rejects_oversized_content() {
        let content = "a".repeat(MAX_NOTE_CONTENT_CHARS + 1);
        assert!(matches!(
            Note::new(content),
            Err(Error::Validation { ref field, .. }) if field == "content"
        ));
    }

    #[test]
    fn test_preview_uses_first_line() {
        let note = Note::new("first line that is long\nsecond").unwrap();
        assert_eq!(note.preview(10), "first line...");
        assert_eq!(note.preview(100), "first line that is long");
    }

    #[test]
    fn test_note_id_unique() {
        let id1 = NoteId::new();
        let id2 = NoteId::new();
        assert_ne!(id1, id2);
    }
}
