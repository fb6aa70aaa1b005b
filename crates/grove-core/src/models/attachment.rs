//! Attachment model

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{normalize_text_option, now_millis};

use super::id::uuid_id;
use super::note::NoteId;

uuid_id! {
    /// A unique identifier for an attachment, using UUID v7.
    AttachmentId
}

/// Attachment metadata persisted for a note.
///
/// Only metadata is synchronized; file bodies stay with the device that imported them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Unique attachment identifier.
    pub id: AttachmentId,
    /// Parent note identifier.
    pub note_id: NoteId,
    /// Original file name.
    pub filename: String,
    /// Content MIME type.
    pub mime_type: String,
    /// Attachment size in bytes.
    pub size_bytes: i64,
    /// Free-form summary (e.g. a transcript excerpt).
    pub summary: Option<String>,
    /// Creation timestamp (Unix ms).
    pub created_at: i64,
    /// Last modification timestamp (Unix ms).
    pub modified_at: i64,
    /// Tombstone timestamp (Unix ms).
    pub deleted_at: Option<i64>,
}

impl Attachment {
    /// Create a new attachment metadata record.
    pub fn new(
        note_id: NoteId,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        size_bytes: i64,
        summary: Option<String>,
    ) -> Result<Self> {
        let now = now_millis();
        let attachment = Self {
            id: AttachmentId::new(),
            note_id,
            filename: filename.into().trim().to_string(),
            mime_type: mime_type.into().trim().to_string(),
            size_bytes,
            summary: normalize_text_option(summary),
            created_at: now,
            modified_at: now,
            deleted_at: None,
        };
        attachment.validate()?;
        Ok(attachment)
    }

    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.filename.trim().is_empty() {
            return Err(Error::validation(
                "filename",
                "attachment filename cannot be empty",
            ));
        }
        if self.mime_type.trim().is_empty() {
            return Err(Error::validation(
                "mime_type",
                "attachment mime_type cannot be empty",
            ));
        }
        if self.size_bytes < 0 {
            return Err(Error::validation(
                "size_bytes",
                "attachment size_bytes cannot be negative",
            ));
        }
        Ok(())
    }
}
