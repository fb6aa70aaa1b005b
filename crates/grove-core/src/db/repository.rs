//! Local mutation paths for notes, tags, associations and attachments
//!
//! Every mutating method writes its fields and then calls
//! [`ChangeLedger::record_touch`] exactly once, inside one transaction.
//! Inserted rows start with `modified_at = 0` so the touch is what stamps them.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use libsql::params::Params;
use libsql::{Connection, Value};

use super::{begin, finish, nullable_text};
use crate::error::{Error, Result};
use crate::ledger::{parse_attachment, parse_note, parse_tag, ChangeLedger};
use crate::models::{
    normalize_tag_name, note_tag_key, validate_content, Attachment, AttachmentId, EntitySnapshot,
    EntityType, Note, NoteId, NoteTag, Tag, TagId, MAX_TAG_DEPTH,
};
use crate::util::now_millis;

/// Whether making `parent_id` the parent of `tag_id` would close a loop.
///
/// Walks the stored ancestor chain of `parent_id`, tombstoned tags included.
pub async fn would_create_cycle(
    conn: &Connection,
    tag_id: &TagId,
    parent_id: &TagId,
) -> Result<bool> {
    let target = tag_id.to_string();
    let mut current = Some(parent_id.to_string());
    let mut depth = 0;

    while let Some(id) = current {
        if id == target {
            return Ok(true);
        }
        depth += 1;
        if depth > MAX_TAG_DEPTH {
            return Err(Error::validation(
                "parent_id",
                format!("tag hierarchy deeper than {MAX_TAG_DEPTH} levels"),
            ));
        }
        let mut rows = conn
            .query("SELECT parent_id FROM tags WHERE id = ?", [id.as_str()])
            .await?;
        current = match rows.next().await? {
            Some(row) => row.get::<Option<String>>(0)?,
            None => None,
        };
    }

    Ok(false)
}

/// Trait for local note-store operations
#[allow(async_fn_in_trait)]
pub trait NoteRepository {
    /// Create a new note
    async fn create(&self, content: &str) -> Result<Note>;

    /// Get a note by ID (tombstoned notes included)
    async fn get(&self, id: &NoteId) -> Result<Option<Note>>;

    /// List live notes, most recently modified first
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Note>>;

    /// Update a note's content
    async fn update(&self, id: &NoteId, content: &str) -> Result<Note>;

    /// Tombstone a note
    async fn delete(&self, id: &NoteId) -> Result<()>;

    /// Create a tag, optionally under a parent
    async fn create_tag(&self, name: &str, parent_id: Option<TagId>) -> Result<Tag>;

    /// Get a tag by ID (tombstoned tags included)
    async fn get_tag(&self, id: &TagId) -> Result<Option<Tag>>;

    /// Rename a tag
    async fn rename_tag(&self, id: &TagId, name: &str) -> Result<Tag>;

    /// Move a tag under another parent, or to the root with `None`
    async fn set_tag_parent(&self, id: &TagId, parent_id: Option<TagId>) -> Result<Tag>;

    /// Tombstone a tag
    async fn delete_tag(&self, id: &TagId) -> Result<()>;

    /// List live tags ordered by name
    async fn list_tags(&self) -> Result<Vec<Tag>>;

    /// Attach a tag to a note, reviving a tombstoned association
    async fn tag_note(&self, note_id: &NoteId, tag_id: &TagId) -> Result<NoteTag>;

    /// Tombstone a note/tag association
    async fn untag_note(&self, note_id: &NoteId, tag_id: &TagId) -> Result<()>;

    /// Live tags attached to a note
    async fn tags_for_note(&self, note_id: &NoteId) -> Result<Vec<Tag>>;

    /// Store attachment metadata for a note
    async fn add_attachment(&self, attachment: &Attachment) -> Result<Attachment>;

    /// Tombstone an attachment
    async fn delete_attachment(&self, id: &AttachmentId) -> Result<()>;

    /// Live attachments of a note
    async fn list_attachments(&self, note_id: &NoteId) -> Result<Vec<Attachment>>;
}

/// libSQL implementation of `NoteRepository`
pub struct LibSqlNoteRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlNoteRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    const fn ledger(&self) -> ChangeLedger<'a> {
        ChangeLedger::new(self.conn)
    }

    async fn require_note(&self, id: &NoteId) -> Result<Note> {
        self.get(id)
            .await?
            .filter(|note| !note.is_deleted())
            .ok_or_else(|| Error::NotFound(format!("note {id}")))
    }

    async fn require_tag(&self, id: &TagId) -> Result<Tag> {
        self.get_tag(id)
            .await?
            .filter(|tag| !tag.is_deleted())
            .ok_or_else(|| Error::NotFound(format!("tag {id}")))
    }

    async fn insert_note(&self, note: &Note) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO notes (id, content, created_at, modified_at, deleted_at)
                 VALUES (?, ?, ?, 0, NULL)",
                libsql::params![note.id.to_string(), note.content.clone(), note.created_at],
            )
            .await?;
        self.ledger()
            .record_touch(EntityType::Note, &note.id.to_string())
            .await?;
        Ok(())
    }

    async fn insert_tag(&self, tag: &Tag) -> Result<()> {
        if let Some(parent_id) = &tag.parent_id {
            self.require_tag(parent_id).await?;
        }
        self.conn
            .execute(
                "INSERT INTO tags (id, name, parent_id, created_at, modified_at, deleted_at)
                 VALUES (?, ?, ?, ?, 0, NULL)",
                libsql::params![
                    tag.id.to_string(),
                    tag.name.clone(),
                    nullable_text(tag.parent_id.map(|id| id.to_string())),
                    tag.created_at,
                ],
            )
            .await?;
        self.ledger()
            .record_touch(EntityType::Tag, &tag.id.to_string())
            .await?;
        Ok(())
    }

    async fn reparent(&self, id: &TagId, parent_id: Option<TagId>) -> Result<()> {
        self.require_tag(id).await?;
        if let Some(parent_id) = &parent_id {
            self.require_tag(parent_id).await?;
            if would_create_cycle(self.conn, id, parent_id).await? {
                return Err(Error::validation(
                    "parent_id",
                    format!("tag {parent_id} is a descendant of {id}"),
                ));
            }
        }
        self.conn
            .execute(
                "UPDATE tags SET parent_id = ? WHERE id = ?",
                libsql::params![
                    nullable_text(parent_id.map(|parent| parent.to_string())),
                    id.to_string()
                ],
            )
            .await?;
        self.ledger()
            .record_touch(EntityType::Tag, &id.to_string())
            .await?;
        Ok(())
    }

    async fn link(&self, note_id: &NoteId, tag_id: &TagId) -> Result<()> {
        self.require_note(note_id).await?;
        self.require_tag(tag_id).await?;
        self.conn
            .execute(
                "INSERT INTO note_tags (note_id, tag_id, created_at, modified_at, deleted_at)
                 VALUES (?, ?, ?, 0, NULL)
                 ON CONFLICT(note_id, tag_id) DO UPDATE SET deleted_at = NULL",
                libsql::params![note_id.to_string(), tag_id.to_string(), now_millis()],
            )
            .await?;
        self.ledger()
            .record_touch(EntityType::NoteTag, &note_tag_key(note_id, tag_id))
            .await?;
        Ok(())
    }

    async fn tombstone(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        sql: &str,
        key: Vec<Value>,
    ) -> Result<()> {
        let mut params = vec![Value::Integer(now_millis())];
        params.extend(key);
        let updated = self.conn.execute(sql, Params::Positional(params)).await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("{entity_type} {entity_id}")));
        }
        self.ledger().record_touch(entity_type, entity_id).await?;
        Ok(())
    }

    async fn insert_attachment(&self, attachment: &Attachment) -> Result<()> {
        self.require_note(&attachment.note_id).await?;
        self.conn
            .execute(
                "INSERT INTO attachments
                    (id, note_id, filename, mime_type, size_bytes, summary,
                     created_at, modified_at, deleted_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 0, NULL)",
                libsql::params![
                    attachment.id.to_string(),
                    attachment.note_id.to_string(),
                    attachment.filename.clone(),
                    attachment.mime_type.clone(),
                    attachment.size_bytes,
                    nullable_text(attachment.summary.clone()),
                    attachment.created_at,
                ],
            )
            .await?;
        self.ledger()
            .record_touch(EntityType::Attachment, &attachment.id.to_string())
            .await?;
        Ok(())
    }
}

impl NoteRepository for LibSqlNoteRepository<'_> {
    async fn create(&self, content: &str) -> Result<Note> {
        let note = Note::new(content)?;
        begin(self.conn).await?;
        let result = self.insert_note(&note).await;
        finish(self.conn, result).await?;
        self.require_note(&note.id).await
    }

    async fn get(&self, id: &NoteId) -> Result<Option<Note>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, content, created_at, modified_at, deleted_at FROM notes WHERE id = ?",
                [id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_note(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Note>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, content, created_at, modified_at, deleted_at FROM notes
                 WHERE deleted_at IS NULL
                 ORDER BY modified_at DESC
                 LIMIT ? OFFSET ?",
                libsql::params![limit as i64, offset as i64],
            )
            .await?;

        let mut notes = Vec::new();
        while let Some(row) = rows.next().await? {
            notes.push(parse_note(&row)?);
        }
        Ok(notes)
    }

    async fn update(&self, id: &NoteId, content: &str) -> Result<Note> {
        validate_content(content)?;
        self.require_note(id).await?;
        begin(self.conn).await?;
        let result = async {
            self.conn
                .execute(
                    "UPDATE notes SET content = ? WHERE id = ?",
                    libsql::params![content.to_string(), id.to_string()],
                )
                .await?;
            self.ledger()
                .record_touch(EntityType::Note, &id.to_string())
                .await
        }
        .await;
        finish(self.conn, result).await?;
        self.require_note(id).await
    }

    async fn delete(&self, id: &NoteId) -> Result<()> {
        self.require_note(id).await?;
        begin(self.conn).await?;
        let result = self
            .tombstone(
                EntityType::Note,
                &id.to_string(),
                "UPDATE notes SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
                vec![Value::Text(id.to_string())],
            )
            .await;
        finish(self.conn, result).await
    }

    async fn create_tag(&self, name: &str, parent_id: Option<TagId>) -> Result<Tag> {
        let tag = Tag::new(name, parent_id)?;
        begin(self.conn).await?;
        let result = self.insert_tag(&tag).await;
        finish(self.conn, result).await?;
        self.require_tag(&tag.id).await
    }

    async fn get_tag(&self, id: &TagId) -> Result<Option<Tag>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, parent_id, created_at, modified_at, deleted_at
                 FROM tags WHERE id = ?",
                [id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_tag(&row)?)),
            None => Ok(None),
        }
    }

    async fn rename_tag(&self, id: &TagId, name: &str) -> Result<Tag> {
        let name = normalize_tag_name(name)?;
        self.require_tag(id).await?;
        begin(self.conn).await?;
        let result = async {
            self.conn
                .execute(
                    "UPDATE tags SET name = ? WHERE id = ?",
                    libsql::params![name, id.to_string()],
                )
                .await?;
            self.ledger()
                .record_touch(EntityType::Tag, &id.to_string())
                .await
        }
        .await;
        finish(self.conn, result).await?;
        self.require_tag(id).await
    }

    async fn set_tag_parent(&self, id: &TagId, parent_id: Option<TagId>) -> Result<Tag> {
        begin(self.conn).await?;
        let result = self.reparent(id, parent_id).await;
        finish(self.conn, result).await?;
        self.require_tag(id).await
    }

    async fn delete_tag(&self, id: &TagId) -> Result<()> {
        begin(self.conn).await?;
        let result = self
            .tombstone(
                EntityType::Tag,
                &id.to_string(),
                "UPDATE tags SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
                vec![Value::Text(id.to_string())],
            )
            .await;
        finish(self.conn, result).await
    }

    async fn list_tags(&self) -> Result<Vec<Tag>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, parent_id, created_at, modified_at, deleted_at
                 FROM tags WHERE deleted_at IS NULL
                 ORDER BY name COLLATE NOCASE",
                (),
            )
            .await?;
        let mut tags = Vec::new();
        while let Some(row) = rows.next().await? {
            tags.push(parse_tag(&row)?);
        }
        Ok(tags)
    }

    async fn tag_note(&self, note_id: &NoteId, tag_id: &TagId) -> Result<NoteTag> {
        begin(self.conn).await?;
        let result = self.link(note_id, tag_id).await;
        finish(self.conn, result).await?;

        match self
            .ledger()
            .load(EntityType::NoteTag, &note_tag_key(note_id, tag_id))
            .await?
        {
            Some(EntitySnapshot::NoteTag(link)) => Ok(link),
            _ => Err(Error::NotFound(format!(
                "note_tag {}",
                note_tag_key(note_id, tag_id)
            ))),
        }
    }

    async fn untag_note(&self, note_id: &NoteId, tag_id: &TagId) -> Result<()> {
        let key = note_tag_key(note_id, tag_id);
        begin(self.conn).await?;
        let result = self
            .tombstone(
                EntityType::NoteTag,
                &key,
                "UPDATE note_tags SET deleted_at = ?
                 WHERE note_id = ? AND tag_id = ? AND deleted_at IS NULL",
                vec![
                    Value::Text(note_id.to_string()),
                    Value::Text(tag_id.to_string()),
                ],
            )
            .await;
        finish(self.conn, result).await
    }

    async fn tags_for_note(&self, note_id: &NoteId) -> Result<Vec<Tag>> {
        let mut rows = self
            .conn
            .query(
                "SELECT t.id, t.name, t.parent_id, t.created_at, t.modified_at, t.deleted_at
                 FROM tags t
                 INNER JOIN note_tags nt ON nt.tag_id = t.id
                 WHERE nt.note_id = ? AND nt.deleted_at IS NULL AND t.deleted_at IS NULL
                 ORDER BY t.name COLLATE NOCASE",
                [note_id.to_string()],
            )
            .await?;
        let mut tags = Vec::new();
        while let Some(row) = rows.next().await? {
            tags.push(parse_tag(&row)?);
        }
        Ok(tags)
    }

    async fn add_attachment(&self, attachment: &Attachment) -> Result<Attachment> {
        attachment.validate()?;
        begin(self.conn).await?;
        let result = self.insert_attachment(attachment).await;
        finish(self.conn, result).await?;

        match self
            .ledger()
            .load(EntityType::Attachment, &attachment.id.to_string())
            .await?
        {
            Some(EntitySnapshot::Attachment(stored)) => Ok(stored),
            _ => Err(Error::NotFound(format!("attachment {}", attachment.id))),
        }
    }

    async fn delete_attachment(&self, id: &AttachmentId) -> Result<()> {
        begin(self.conn).await?;
        let result = self
            .tombstone(
                EntityType::Attachment,
                &id.to_string(),
                "UPDATE attachments SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
                vec![Value::Text(id.to_string())],
            )
            .await;
        finish(self.conn, result).await
    }

    async fn list_attachments(&self, note_id: &NoteId) -> Result<Vec<Attachment>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, note_id, filename, mime_type, size_bytes, summary,
                        created_at, modified_at, deleted_at
                 FROM attachments
                 WHERE note_id = ? AND deleted_at IS NULL
                 ORDER BY created_at ASC",
                [note_id.to_string()],
            )
            .await?;
        let mut attachments = Vec::new();
        while let Some(row) = rows.next().await? {
            attachments.push(parse_attachment(&row)?);
        }
        Ok(attachments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_and_get() {
        let db = setup().await;
        let repo = LibSqlNoteRepository::new(db.connection());

        let note = repo.create("Hello world").await.unwrap();
        assert!(note.modified_at >= note.created_at);

        let fetched = repo.get(&note.id).await.unwrap().unwrap();
        assert_eq!(fetched, note);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_skips_tombstones() {
        let db = setup().await;
        let repo = LibSqlNoteRepository::new(db.connection());

        let keep = repo.create("keep").await.unwrap();
        let gone = repo.create("gone").await.unwrap();
        repo.delete(&gone.id).await.unwrap();

        let notes = repo.list(10, 0).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, keep.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_touches_modified_at() {
        let db = setup().await;
        let repo = LibSqlNoteRepository::new(db.connection());

        let note = repo.create("Original").await.unwrap();
        let updated = repo.update(&note.id, "Updated").await.unwrap();

        assert_eq!(updated.content, "Updated");
        assert!(updated.modified_at > note.modified_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_is_a_tombstone() {
        let db = setup().await;
        let repo = LibSqlNoteRepository::new(db.connection());

        let note = repo.create("To delete").await.unwrap();
        repo.delete(&note.id).await.unwrap();

        let stored = repo.get(&note.id).await.unwrap().unwrap();
        assert!(stored.is_deleted());
        assert!(stored.modified_at > note.modified_at);
        assert!(matches!(repo.delete(&note.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tag_hierarchy_rejects_cycles() {
        let db = setup().await;
        let repo = LibSqlNoteRepository::new(db.connection());

        let root = repo.create_tag("projects", None).await.unwrap();
        let child = repo.create_tag("grove", Some(root.id)).await.unwrap();
        let grandchild = repo.create_tag("sync", Some(child.id)).await.unwrap();

        let result = repo.set_tag_parent(&root.id, Some(grandchild.id)).await;
        assert!(matches!(result, Err(Error::Validation { .. })));

        let self_parent = repo.set_tag_parent(&child.id, Some(child.id)).await;
        assert!(matches!(self_parent, Err(Error::Validation { .. })));

        let unchanged = repo.get_tag(&root.id).await.unwrap().unwrap();
        assert_eq!(unchanged.parent_id, None);

        let moved = repo.set_tag_parent(&grandchild.id, None).await.unwrap();
        assert_eq!(moved.parent_id, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_tag_requires_live_parent() {
        let db = setup().await;
        let repo = LibSqlNoteRepository::new(db.connection());

        let missing = repo.create_tag("orphan", Some(TagId::new())).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tag_and_untag_note() {
        let db = setup().await;
        let repo = LibSqlNoteRepository::new(db.connection());

        let note = repo.create("tagged").await.unwrap();
        let tag = repo.create_tag("inbox", None).await.unwrap();

        let link = repo.tag_note(&note.id, &tag.id).await.unwrap();
        assert!(!link.is_deleted());
        assert_eq!(repo.tags_for_note(&note.id).await.unwrap().len(), 1);

        repo.untag_note(&note.id, &tag.id).await.unwrap();
        assert!(repo.tags_for_note(&note.id).await.unwrap().is_empty());

        let revived = repo.tag_note(&note.id, &tag.id).await.unwrap();
        assert!(!revived.is_deleted());
        assert!(revived.modified_at > link.modified_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attachments() {
        let db = setup().await;
        let repo = LibSqlNoteRepository::new(db.connection());

        let note = repo.create("with audio").await.unwrap();
        let attachment = Attachment::new(note.id, "memo.m4a", "audio/mp4", 10, None).unwrap();
        let stored = repo.add_attachment(&attachment).await.unwrap();
        assert_eq!(stored.id, attachment.id);
        assert_eq!(repo.list_attachments(&note.id).await.unwrap().len(), 1);

        repo.delete_attachment(&attachment.id).await.unwrap();
        assert!(repo.list_attachments(&note.id).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rename_tag_validates_name() {
        let db = setup().await;
        let repo = LibSqlNoteRepository::new(db.connection());

        let tag = repo.create_tag("old", None).await.unwrap();
        assert!(repo.rename_tag(&tag.id, "a/b").await.is_err());
        let renamed = repo.rename_tag(&tag.id, "new").await.unwrap();
        assert_eq!(renamed.name, "new");
    }
}
