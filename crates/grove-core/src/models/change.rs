//! Change records: the unit exchanged between peers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

use super::attachment::Attachment;
use super::device::DeviceId;
use super::note::{validate_content, Note};
use super::tag::{normalize_tag_name, NoteTag, Tag};

/// Version of the per-entity snapshot schema carried in every change record.
pub const CHANGE_SCHEMA_VERSION: u32 = 1;

/// Kinds of syncable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Note,
    Tag,
    NoteTag,
    Attachment,
}

impl EntityType {
    /// Every entity type, in dependency order (referenced types first).
    pub const ALL: [Self; 4] = [Self::Note, Self::Tag, Self::NoteTag, Self::Attachment];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Tag => "tag",
            Self::NoteTag => "note_tag",
            Self::Attachment => "attachment",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "note" => Ok(Self::Note),
            "tag" => Ok(Self::Tag),
            "note_tag" => Ok(Self::NoteTag),
            "attachment" => Ok(Self::Attachment),
            other => Err(Error::Protocol(format!("unknown entity type: {other}"))),
        }
    }
}

/// Full field snapshot of one entity, tagged by entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "data", rename_all = "snake_case")]
pub enum EntitySnapshot {
    Note(Note),
    Tag(Tag),
    NoteTag(NoteTag),
    Attachment(Attachment),
}

impl EntitySnapshot {
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::Note(_) => EntityType::Note,
            Self::Tag(_) => EntityType::Tag,
            Self::NoteTag(_) => EntityType::NoteTag,
            Self::Attachment(_) => EntityType::Attachment,
        }
    }

    pub fn entity_id(&self) -> String {
        match self {
            Self::Note(note) => note.id.to_string(),
            Self::Tag(tag) => tag.id.to_string(),
            Self::NoteTag(link) => link.key(),
            Self::Attachment(attachment) => attachment.id.to_string(),
        }
    }

    pub const fn modified_at(&self) -> i64 {
        match self {
            Self::Note(note) => note.modified_at,
            Self::Tag(tag) => tag.modified_at,
            Self::NoteTag(link) => link.modified_at,
            Self::Attachment(attachment) => attachment.modified_at,
        }
    }

    pub const fn deleted_at(&self) -> Option<i64> {
        match self {
            Self::Note(note) => note.deleted_at,
            Self::Tag(tag) => tag.deleted_at,
            Self::NoteTag(link) => link.deleted_at,
            Self::Attachment(attachment) => attachment.deleted_at,
        }
    }

    pub const fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }

    /// Same snapshot with `modified_at` replaced.
    #[must_use]
    pub fn with_modified_at(mut self, modified_at: i64) -> Self {
        match &mut self {
            Self::Note(note) => note.modified_at = modified_at,
            Self::Tag(tag) => tag.modified_at = modified_at,
            Self::NoteTag(link) => link.modified_at = modified_at,
            Self::Attachment(attachment) => attachment.modified_at = modified_at,
        }
        self
    }

    /// Whether two snapshots carry the same user-visible state.
    ///
    /// Timestamps are ignored; only whether the entity is tombstoned matters.
    pub fn same_content(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }

    fn normalized(&self) -> Self {
        let mut copy = self.clone().with_modified_at(0);
        match &mut copy {
            Self::Note(note) => {
                note.created_at = 0;
                note.deleted_at = note.deleted_at.map(|_| 0);
            }
            Self::Tag(tag) => {
                tag.created_at = 0;
                tag.deleted_at = tag.deleted_at.map(|_| 0);
            }
            Self::NoteTag(link) => {
                link.created_at = 0;
                link.deleted_at = link.deleted_at.map(|_| 0);
            }
            Self::Attachment(attachment) => {
                attachment.created_at = 0;
                attachment.deleted_at = attachment.deleted_at.map(|_| 0);
            }
        }
        copy
    }

    /// Field-level validation applied to every incoming snapshot.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Note(note) => validate_content(&note.content),
            Self::Tag(tag) => {
                normalize_tag_name(&tag.name)?;
                if tag.parent_id == Some(tag.id) {
                    return Err(Error::validation("parent_id", "tag cannot be its own parent"));
                }
                Ok(())
            }
            Self::NoteTag(_) => Ok(()),
            Self::Attachment(attachment) => attachment.validate(),
        }
    }
}

/// One entity snapshot as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Device that sent the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_device: Option<DeviceId>,
    pub entity: EntitySnapshot,
}

const fn default_schema_version() -> u32 {
    CHANGE_SCHEMA_VERSION
}

impl ChangeRecord {
    pub const fn new(entity: EntitySnapshot, origin_device: Option<DeviceId>) -> Self {
        Self {
            schema_version: CHANGE_SCHEMA_VERSION,
            origin_device,
            entity,
        }
    }

    pub const fn entity_type(&self) -> EntityType {
        self.entity.entity_type()
    }

    pub fn entity_id(&self) -> String {
        self.entity.entity_id()
    }

    pub const fn modified_at(&self) -> i64 {
        self.entity.modified_at()
    }

    /// Reject records written by a newer schema than this build understands.
    pub fn check_schema(&self) -> Result<()> {
        if self.schema_version == 0 || self.schema_version > CHANGE_SCHEMA_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported change schema version {} for {} {}",
                self.schema_version,
                self.entity_type(),
                self.entity_id()
            )));
        }
        Ok(())
    }
}

/// Per-record result of running an incoming change through the merge engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Incoming snapshot written locally
    Applied,
    /// Local state already matches or supersedes the snapshot
    Unchanged,
    /// Both sides diverged; a conflict record holds both snapshots
    Conflicted,
    /// Snapshot failed validation and was not written
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordResult {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub outcome: ApplyOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RecordResult {
    pub fn new(record: &ChangeRecord, outcome: ApplyOutcome) -> Self {
        Self {
            entity_type: record.entity_type(),
            entity_id: record.entity_id(),
            outcome,
            reason: None,
        }
    }

    pub fn rejected(record: &ChangeRecord, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new(record, ApplyOutcome::Rejected)
        }
    }
}
