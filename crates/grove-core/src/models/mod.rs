//! Data models for Grove

mod attachment;
mod change;
mod conflict;
mod device;
mod id;
mod note;
mod peer;
mod tag;

pub use attachment::{Attachment, AttachmentId};
pub use change::{
    ApplyOutcome, ChangeRecord, EntitySnapshot, EntityType, RecordResult, CHANGE_SCHEMA_VERSION,
};
pub use conflict::{Conflict, ConflictId, ConflictStatus, ResolutionChoice};
pub use device::{Device, DeviceId};
pub(crate) use note::validate_content;
pub use note::{Note, NoteId, MAX_NOTE_CONTENT_CHARS};
pub use peer::{Peer, PeerRegistration};
pub use tag::{
    normalize_tag_name, note_tag_key, NoteTag, Tag, TagId, MAX_TAG_DEPTH, MAX_TAG_NAME_CHARS,
};
