//! Tag model
//!
//! Tags form a forest through `parent_id`. Cycle checks need the stored
//! ancestors, so they live with the repository rather than here.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::now_millis;

use super::id::uuid_id;
use super::note::NoteId;

/// Maximum tag name length in characters
pub const MAX_TAG_NAME_CHARS: usize = 100;

/// Maximum ancestor chain walked when checking for cycles
pub const MAX_TAG_DEPTH: usize = 50;

uuid_id! {
    /// A unique identifier for a tag
    TagId
}

/// A tag for organizing notes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Unique identifier
    pub id: TagId,
    /// Display name
    pub name: String,
    /// Parent tag, `None` for roots
    pub parent_id: Option<TagId>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last modification timestamp (Unix ms)
    pub modified_at: i64,
    /// Tombstone timestamp (Unix ms)
    pub deleted_at: Option<i64>,
}

impl Tag {
    /// Create a new tag; the name is trimmed and validated.
    pub fn new(name: impl AsRef<str>, parent_id: Option<TagId>) -> Result<Self> {
        let name = normalize_tag_name(name.as_ref())?;
        let now = now_millis();
        Ok(Self {
            id: TagId::new(),
            name,
            parent_id,
            created_at: now,
            modified_at: now,
            deleted_at: None,
        })
    }

    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Association between a note and a tag.
///
/// Keyed by the `(note_id, tag_id)` pair so the same association created on two
/// devices converges to one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteTag {
    pub note_id: NoteId,
    pub tag_id: TagId,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last modification timestamp (Unix ms)
    pub modified_at: i64,
    /// Tombstone timestamp (Unix ms)
    pub deleted_at: Option<i64>,
}

impl NoteTag {
    pub fn new(note_id: NoteId, tag_id: TagId) -> Self {
        let now = now_millis();
        Self {
            note_id,
            tag_id,
            created_at: now,
            modified_at: now,
            deleted_at: None,
        }
    }

    /// Wire identifier: `<note_id>:<tag_id>`
    pub fn key(&self) -> String {
        note_tag_key(&self.note_id, &self.tag_id)
    }

    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

pub fn note_tag_key(note_id: &NoteId, tag_id: &TagId) -> String {
    format!("{note_id}:{tag_id}")
}

/// Trim and validate a tag name
pub fn normalize_tag_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation("name", "tag name cannot be empty"));
    }
    if name.chars().count() > MAX_TAG_NAME_CHARS {
        return Err(Error::validation(
            "name",
            format!("tag name exceeds {MAX_TAG_NAME_CHARS} characters"),
        ));
    }
    if name.contains('/') {
        return Err(Error::validation("name", "tag name cannot contain '/'"));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_creation_trims_name() {
        let tag = Tag::new("  work  ", None).unwrap();
        assert_eq!(tag.name, "work");
        assert_eq!(tag.parent_id, None);
    }

    #[test]
    fn test_tag_name_validation() {
        assert!(Tag::new("", None).is_err());
        assert!(Tag::new("a/b", None).is_err());
        assert!(Tag::new("x".repeat(MAX_TAG_NAME_CHARS + 1), None).is_err());
        assert!(Tag::new("x".repeat(MAX_TAG_NAME_CHARS), None).is_ok());
    }

    #[test]
    fn test_note_tag_key() {
        let link = NoteTag::new(NoteId::new(), TagId::new());
        assert_eq!(link.key(), format!("{}:{}", link.note_id, link.tag_id));
        assert_eq!(link.key().len(), 65);
    }
}
