//! Change ledger
//!
//! Every syncable table carries `modified_at` and a `deleted_at` tombstone, so
//! "what changed since T" is a range scan over `modified_at`. Local mutations
//! stamp rows through [`ChangeLedger::record_touch`]; remote snapshots keep the
//! timestamp they were sent with.

use libsql::params::Params;
use libsql::{Connection, Row, Value};

use crate::db::{nullable_int, nullable_text, parse_column};
use crate::error::{Error, Result};
use crate::models::{
    Attachment, ChangeRecord, DeviceId, EntitySnapshot, EntityType, Note, NoteTag, Tag,
};
use crate::util::now_millis;

const NOTE_COLUMNS: &str = "id, content, created_at, modified_at, deleted_at";
const TAG_COLUMNS: &str = "id, name, parent_id, created_at, modified_at, deleted_at";
const NOTE_TAG_COLUMNS: &str = "note_id, tag_id, created_at, modified_at, deleted_at";
const ATTACHMENT_COLUMNS: &str =
    "id, note_id, filename, mime_type, size_bytes, summary, created_at, modified_at, deleted_at";

const fn table(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Note => "notes",
        EntityType::Tag => "tags",
        EntityType::NoteTag => "note_tags",
        EntityType::Attachment => "attachments",
    }
}

const fn columns(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Note => NOTE_COLUMNS,
        EntityType::Tag => TAG_COLUMNS,
        EntityType::NoteTag => NOTE_TAG_COLUMNS,
        EntityType::Attachment => ATTACHMENT_COLUMNS,
    }
}

const fn order_key(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::NoteTag => "note_id, tag_id",
        _ => "id",
    }
}

/// `WHERE` clause and parameters selecting one entity by its wire id.
fn key_clause(entity_type: EntityType, entity_id: &str) -> Result<(&'static str, Vec<Value>)> {
    match entity_type {
        EntityType::NoteTag => {
            let (note_id, tag_id) = entity_id.split_once(':').ok_or_else(|| {
                Error::validation("entity_id", format!("malformed note_tag key: {entity_id}"))
            })?;
            Ok((
                "note_id = ? AND tag_id = ?",
                vec![
                    Value::Text(note_id.to_string()),
                    Value::Text(tag_id.to_string()),
                ],
            ))
        }
        _ => Ok(("id = ?", vec![Value::Text(entity_id.to_string())])),
    }
}

pub(crate) fn parse_note(row: &Row) -> Result<Note> {
    let id: String = row.get(0)?;
    Ok(Note {
        id: parse_column(&id, "notes.id")?,
        content: row.get(1)?,
        created_at: row.get(2)?,
        modified_at: row.get(3)?,
        deleted_at: row.get::<Option<i64>>(4)?,
    })
}

pub(crate) fn parse_tag(row: &Row) -> Result<Tag> {
    let id: String = row.get(0)?;
    let parent_id = row
        .get::<Option<String>>(2)?
        .map(|raw| parse_column(&raw, "tags.parent_id"))
        .transpose()?;
    Ok(Tag {
        id: parse_column(&id, "tags.id")?,
        name: row.get(1)?,
        parent_id,
        created_at: row.get(3)?,
        modified_at: row.get(4)?,
        deleted_at: row.get::<Option<i64>>(5)?,
    })
}

pub(crate) fn parse_note_tag(row: &Row) -> Result<NoteTag> {
    let note_id: String = row.get(0)?;
    let tag_id: String = row.get(1)?;
    Ok(NoteTag {
        note_id: parse_column(&note_id, "note_tags.note_id")?,
        tag_id: parse_column(&tag_id, "note_tags.tag_id")?,
        created_at: row.get(2)?,
        modified_at: row.get(3)?,
        deleted_at: row.get::<Option<i64>>(4)?,
    })
}

pub(crate) fn parse_attachment(row: &Row) -> Result<Attachment> {
    let id: String = row.get(0)?;
    let note_id: String = row.get(1)?;
    Ok(Attachment {
        id: parse_column(&id, "attachments.id")?,
        note_id: parse_column(&note_id, "attachments.note_id")?,
        filename: row.get(2)?,
        mime_type: row.get(3)?,
        size_bytes: row.get(4)?,
        summary: row.get::<Option<String>>(5)?,
        created_at: row.get(6)?,
        modified_at: row.get(7)?,
        deleted_at: row.get::<Option<i64>>(8)?,
    })
}

fn parse_snapshot(entity_type: EntityType, row: &Row) -> Result<EntitySnapshot> {
    Ok(match entity_type {
        EntityType::Note => EntitySnapshot::Note(parse_note(row)?),
        EntityType::Tag => EntitySnapshot::Tag(parse_tag(row)?),
        EntityType::NoteTag => EntitySnapshot::NoteTag(parse_note_tag(row)?),
        EntityType::Attachment => EntitySnapshot::Attachment(parse_attachment(row)?),
    })
}

/// One page of changes for a single entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePage {
    pub records: Vec<ChangeRecord>,
    /// Highest `modified_at` in the page, or the requested `since` when empty
    pub next_since: i64,
    /// No changes exist beyond `next_since`
    pub is_complete: bool,
}

/// Read and write access to entity snapshots and their timestamps.
pub struct ChangeLedger<'a> {
    conn: &'a Connection,
    origin: Option<DeviceId>,
}

impl<'a> ChangeLedger<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn, origin: None }
    }

    /// Stamp outgoing change records with this device id.
    #[must_use]
    pub const fn with_origin(mut self, device_id: DeviceId) -> Self {
        self.origin = Some(device_id);
        self
    }

    /// Every entity of `entity_type` with `modified_at > since`, oldest first.
    ///
    /// Tombstones are included. Nothing changed yields an empty vector.
    pub async fn changes_since(
        &self,
        entity_type: EntityType,
        since: i64,
    ) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE modified_at > ? ORDER BY modified_at ASC, {}",
            columns(entity_type),
            table(entity_type),
            order_key(entity_type)
        );
        self.collect(entity_type, &sql, Params::Positional(vec![Value::Integer(since)]))
            .await
    }

    /// At most `limit` changes after `since`, extended so that a run of equal
    /// `modified_at` values is never split across pages.
    pub async fn changes_page(
        &self,
        entity_type: EntityType,
        since: i64,
        limit: usize,
    ) -> Result<ChangePage> {
        let offset = i64::try_from(limit.max(1) - 1).unwrap_or(i64::MAX);
        let table = table(entity_type);
        let sql = format!(
            "SELECT {} FROM {table}
             WHERE modified_at > ?1 AND modified_at <= COALESCE(
                (SELECT modified_at FROM {table} WHERE modified_at > ?1
                 ORDER BY modified_at ASC LIMIT 1 OFFSET ?2),
                ?3)
             ORDER BY modified_at ASC, {}",
            columns(entity_type),
            order_key(entity_type)
        );
        let params = vec![
            Value::Integer(since),
            Value::Integer(offset),
            Value::Integer(i64::MAX),
        ];
        let records = self
            .collect(entity_type, &sql, Params::Positional(params))
            .await?;

        let next_since = records.last().map_or(since, ChangeRecord::modified_at);
        let mut rows = self
            .conn
            .query(
                &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE modified_at > ?)"),
                [next_since],
            )
            .await?;
        let has_more = match rows.next().await? {
            Some(row) => row.get::<i64>(0)? != 0,
            None => false,
        };

        Ok(ChangePage {
            records,
            next_since,
            is_complete: !has_more,
        })
    }

    /// Every entity of `entity_type`, regardless of timestamp, oldest first.
    pub async fn full_snapshot(&self, entity_type: EntityType) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY modified_at ASC, {}",
            columns(entity_type),
            table(entity_type),
            order_key(entity_type)
        );
        self.collect(entity_type, &sql, Params::None).await
    }

    /// Changes across every entity type in dependency order.
    ///
    /// `None` means everything, as for a first sync with a peer.
    pub async fn outgoing_changes(&self, since: Option<i64>) -> Result<Vec<ChangeRecord>> {
        let mut records = Vec::new();
        for entity_type in EntityType::ALL {
            let batch = match since {
                Some(since) => self.changes_since(entity_type, since).await?,
                None => self.full_snapshot(entity_type).await?,
            };
            records.extend(batch);
        }
        Ok(records)
    }

    async fn collect(
        &self,
        entity_type: EntityType,
        sql: &str,
        params: Params,
    ) -> Result<Vec<ChangeRecord>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(ChangeRecord::new(
                parse_snapshot(entity_type, &row)?,
                self.origin,
            ));
        }
        Ok(records)
    }

    /// Load the current local snapshot of one entity.
    pub async fn load(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>> {
        let (clause, params) = key_clause(entity_type, entity_id)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {clause}",
            columns(entity_type),
            table(entity_type)
        );
        let mut rows = self.conn.query(&sql, Params::Positional(params)).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_snapshot(entity_type, &row)?)),
            None => Ok(None),
        }
    }

    /// Stamp one entity as modified now; returns the new `modified_at`.
    ///
    /// Local mutation paths call this exactly once per logical change. The new
    /// value is always greater than the previous one, even under clock drift.
    pub async fn record_touch(&self, entity_type: EntityType, entity_id: &str) -> Result<i64> {
        let (clause, key_params) = key_clause(entity_type, entity_id)?;
        let now = now_millis();
        let sql = format!(
            "UPDATE {} SET modified_at = CASE WHEN ? > modified_at THEN ? ELSE modified_at + 1 END
             WHERE {clause}",
            table(entity_type)
        );
        let mut params = vec![Value::Integer(now), Value::Integer(now)];
        params.extend(key_params.iter().cloned());
        let updated = self.conn.execute(&sql, Params::Positional(params)).await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("{entity_type} {entity_id}")));
        }

        let sql = format!(
            "SELECT modified_at FROM {} WHERE {clause}",
            table(entity_type)
        );
        let mut rows = self.conn.query(&sql, Params::Positional(key_params)).await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| Error::NotFound(format!("{entity_type} {entity_id}")))?;
        Ok(row.get(0)?)
    }

    /// Insert or overwrite one entity with exactly the given snapshot.
    pub(crate) async fn write(&self, snapshot: &EntitySnapshot) -> Result<()> {
        match snapshot {
            EntitySnapshot::Note(note) => {
                self.conn
                    .execute(
                        "INSERT INTO notes (id, content, created_at, modified_at, deleted_at)
                         VALUES (?, ?, ?, ?, ?)
                         ON CONFLICT(id) DO UPDATE SET
                            content = excluded.content,
                            created_at = excluded.created_at,
                            modified_at = excluded.modified_at,
                            deleted_at = excluded.deleted_at",
                        libsql::params![
                            note.id.to_string(),
                            note.content.clone(),
                            note.created_at,
                            note.modified_at,
                            nullable_int(note.deleted_at),
                        ],
                    )
                    .await?;
            }
            EntitySnapshot::Tag(tag) => {
                self.conn
                    .execute(
                        "INSERT INTO tags (id, name, parent_id, created_at, modified_at, deleted_at)
                         VALUES (?, ?, ?, ?, ?, ?)
                         ON CONFLICT(id) DO UPDATE SET
                            name = excluded.name,
                            parent_id = excluded.parent_id,
                            created_at = excluded.created_at,
                            modified_at = excluded.modified_at,
                            deleted_at = excluded.deleted_at",
                        libsql::params![
                            tag.id.to_string(),
                            tag.name.clone(),
                            nullable_text(tag.parent_id.map(|id| id.to_string())),
                            tag.created_at,
                            tag.modified_at,
                            nullable_int(tag.deleted_at),
                        ],
                    )
                    .await?;
            }
            EntitySnapshot::NoteTag(link) => {
                self.conn
                    .execute(
                        "INSERT INTO note_tags (note_id, tag_id, created_at, modified_at, deleted_at)
                         VALUES (?, ?, ?, ?, ?)
                         ON CONFLICT(note_id, tag_id) DO UPDATE SET
                            created_at = excluded.created_at,
                            modified_at = excluded.modified_at,
                            deleted_at = excluded.deleted_at",
                        libsql::params![
                            link.note_id.to_string(),
                            link.tag_id.to_string(),
                            link.created_at,
                            link.modified_at,
                            nullable_int(link.deleted_at),
                        ],
                    )
                    .await?;
            }
            EntitySnapshot::Attachment(attachment) => {
                self.conn
                    .execute(
                        "INSERT INTO attachments
                            (id, note_id, filename, mime_type, size_bytes, summary,
                             created_at, modified_at, deleted_at)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                         ON CONFLICT(id) DO UPDATE SET
                            note_id = excluded.note_id,
                            filename = excluded.filename,
                            mime_type = excluded.mime_type,
                            size_bytes = excluded.size_bytes,
                            summary = excluded.summary,
                            created_at = excluded.created_at,
                            modified_at = excluded.modified_at,
                            deleted_at = excluded.deleted_at",
                        libsql::params![
                            attachment.id.to_string(),
                            attachment.note_id.to_string(),
                            attachment.filename.clone(),
                            attachment.mime_type.clone(),
                            attachment.size_bytes,
                            nullable_text(attachment.summary.clone()),
                            attachment.created_at,
                            attachment.modified_at,
                            nullable_int(attachment.deleted_at),
                        ],
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
