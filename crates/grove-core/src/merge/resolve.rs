//! Operator resolution of recorded conflicts.

use crate::db::{begin, finish};
use crate::error::{Error, Result};
use crate::ledger::ChangeLedger;
use crate::models::{Conflict, ConflictId, EntitySnapshot, ResolutionChoice, MAX_TAG_NAME_CHARS};

use super::text::merge_text;
use super::{ConflictRepository, MergeEngine};

/// Combine two snapshots of the same entity; the result is always live.
///
/// Timestamps come from `local`; the caller stamps the result afterwards.
pub fn merge_snapshots(local: &EntitySnapshot, remote: &EntitySnapshot) -> Result<EntitySnapshot> {
    let merged = match (local, remote) {
        (EntitySnapshot::Note(local), EntitySnapshot::Note(remote)) => {
            let mut note = local.clone();
            note.content = merge_text(&local.content, &remote.content);
            note.created_at = local.created_at.min(remote.created_at);
            note.deleted_at = None;
            EntitySnapshot::Note(note)
        }
        (EntitySnapshot::Tag(local), EntitySnapshot::Tag(remote)) => {
            let mut tag = local.clone();
            if local.name != remote.name {
                tag.name = format!("{} | {}", local.name, remote.name)
                    .chars()
                    .take(MAX_TAG_NAME_CHARS)
                    .collect::<String>()
                    .trim_end()
                    .to_string();
            }
            tag.created_at = local.created_at.min(remote.created_at);
            tag.deleted_at = None;
            EntitySnapshot::Tag(tag)
        }
        (EntitySnapshot::NoteTag(local), EntitySnapshot::NoteTag(remote)) => {
            let mut link = local.clone();
            link.created_at = local.created_at.min(remote.created_at);
            link.deleted_at = None;
            EntitySnapshot::NoteTag(link)
        }
        (EntitySnapshot::Attachment(local), EntitySnapshot::Attachment(remote)) => {
            let mut attachment = local.clone();
            attachment.summary = match (&local.summary, &remote.summary) {
                (Some(ours), Some(theirs)) if ours != theirs => Some(format!("{ours}\n\n{theirs}")),
                (Some(ours), _) => Some(ours.clone()),
                (None, theirs) => theirs.clone(),
            };
            attachment.created_at = local.created_at.min(remote.created_at);
            attachment.deleted_at = None;
            EntitySnapshot::Attachment(attachment)
        }
        _ => {
            return Err(Error::validation(
                "entity_type",
                format!(
                    "cannot merge {} with {}",
                    local.entity_type(),
                    remote.entity_type()
                ),
            ))
        }
    };
    if merged.entity_id() != remote.entity_id() {
        return Err(Error::validation(
            "entity_id",
            "snapshots belong to different entities",
        ));
    }
    merged.validate()?;
    Ok(merged)
}

impl MergeEngine<'_> {
    /// Resolve an open conflict, writing the chosen state and stamping it so
    /// the result propagates to peers on the next round.
    pub async fn resolve(&self, conflict_id: &ConflictId, choice: ResolutionChoice) -> Result<Conflict> {
        let conflicts = ConflictRepository::new(self.conn);
        let conflict = conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        if !conflict.status.is_open() {
            return Err(Error::ConflictResolved(conflict_id.to_string()));
        }

        begin(self.conn).await?;
        let result = self.write_resolution(&conflict, choice).await;
        finish(self.conn, result).await?;

        tracing::info!(
            conflict_id = %conflict_id,
            entity_type = %conflict.entity_type,
            entity_id = %conflict.entity_id,
            choice = ?choice,
            "Resolved sync conflict"
        );
        conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))
    }

    async fn write_resolution(&self, conflict: &Conflict, choice: ResolutionChoice) -> Result<()> {
        let ledger = ChangeLedger::new(self.conn);
        let current = ledger
            .load(conflict.entity_type, &conflict.entity_id)
            .await?
            .unwrap_or_else(|| conflict.local_snapshot.clone());

        let resolved = match choice {
            ResolutionChoice::Local => current,
            ResolutionChoice::Remote => conflict.remote_snapshot.clone(),
            ResolutionChoice::Merge => merge_snapshots(&current, &conflict.remote_snapshot)?,
        };
        if let Some(reason) = self.check_references(&resolved).await? {
            return Err(Error::validation("resolution", reason));
        }

        ledger.write(&resolved).await?;
        ledger
            .record_touch(conflict.entity_type, &conflict.entity_id)
            .await?;
        ConflictRepository::new(self.conn)
            .mark_resolved(&conflict.id, choice.resulting_status())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::merge::MergeContext;
    use crate::models::{
        Attachment, ChangeRecord, ConflictStatus, EntityType, Note, NoteId, NoteTag, Tag, TagId,
    };
    use pretty_assertions::assert_eq;

    async fn conflicted_note(db: &Database) -> (Note, ConflictId) {
        let ledger = ChangeLedger::new(db.connection());
        let local = Note {
            id: NoteId::new(),
            content: "shared\nlocal".into(),
            created_at: 1,
            modified_at: 30,
            deleted_at: None,
        };
        ledger.write(&EntitySnapshot::Note(local.clone())).await.unwrap();

        let mut remote = local.clone();
        remote.content = "shared\nremote".into();
        remote.modified_at = 40;
        MergeEngine::new(db.connection())
            .apply_batch(
                vec![ChangeRecord::new(EntitySnapshot::Note(remote), None)],
                &MergeContext {
                    watermark: Some(20),
                    ..MergeContext::default()
                },
            )
            .await
            .unwrap();

        let conflicts = ConflictRepository::new(db.connection()).list(false).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        (local, conflicts[0].id)
    }

    async fn stored_note(db: &Database, id: &NoteId) -> Note {
        match ChangeLedger::new(db.connection())
            .load(EntityType::Note, &id.to_string())
            .await
            .unwrap()
        {
            Some(EntitySnapshot::Note(note)) => note,
            other => panic!("expected note, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_local_keeps_content_and_touches() {
        let db = Database::open_in_memory().await.unwrap();
        let (local, conflict_id) = conflicted_note(&db).await;

        let conflict = MergeEngine::new(db.connection())
            .resolve(&conflict_id, ResolutionChoice::Local)
            .await
            .unwrap();
        assert_eq!(conflict.status, ConflictStatus::ResolvedLocal);

        let stored = stored_note(&db, &local.id).await;
        assert_eq!(stored.content, "shared\nlocal");
        assert!(stored.modified_at > local.modified_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_remote_overwrites() {
        let db = Database::open_in_memory().await.unwrap();
        let (local, conflict_id) = conflicted_note(&db).await;

        MergeEngine::new(db.connection())
            .resolve(&conflict_id, ResolutionChoice::Remote)
            .await
            .unwrap();
        assert_eq!(stored_note(&db, &local.id).await.content, "shared\nremote");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_merge_marks_both_sides() {
        let db = Database::open_in_memory().await.unwrap();
        let (local, conflict_id) = conflicted_note(&db).await;

        let conflict = MergeEngine::new(db.connection())
            .resolve(&conflict_id, ResolutionChoice::Merge)
            .await
            .unwrap();
        assert_eq!(conflict.status, ConflictStatus::ResolvedMerge);
        assert_eq!(
            stored_note(&db, &local.id).await.content,
            "shared\n<<<<<<< LOCAL\nlocal\n=======\nremote\n>>>>>>> REMOTE"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolving_twice_is_an_error() {
        let db = Database::open_in_memory().await.unwrap();
        let (_, conflict_id) = conflicted_note(&db).await;
        let engine = MergeEngine::new(db.connection());

        engine
            .resolve(&conflict_id, ResolutionChoice::Local)
            .await
            .unwrap();
        let again = engine.resolve(&conflict_id, ResolutionChoice::Remote).await;
        assert!(matches!(again, Err(Error::ConflictResolved(_))));

        let missing = engine
            .resolve(&ConflictId::new(), ResolutionChoice::Local)
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[test]
    fn merge_tag_joins_names_under_local_parent() {
        let parent = TagId::new();
        let local = Tag::new("work", Some(parent)).unwrap();
        let mut remote = local.clone();
        remote.name = "job".into();
        remote.parent_id = None;
        remote.deleted_at = Some(5);

        match merge_snapshots(&EntitySnapshot::Tag(local), &EntitySnapshot::Tag(remote)).unwrap() {
            EntitySnapshot::Tag(tag) => {
                assert_eq!(tag.name, "work | job");
                assert_eq!(tag.parent_id, Some(parent));
                assert!(!tag.is_deleted());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn merge_note_tag_is_a_union() {
        let mut local = NoteTag::new(NoteId::new(), TagId::new());
        local.deleted_at = Some(10);
        let remote = local.clone();

        let merged =
            merge_snapshots(&EntitySnapshot::NoteTag(local), &EntitySnapshot::NoteTag(remote))
                .unwrap();
        assert!(!merged.is_deleted());
    }

    #[test]
    fn merge_attachment_joins_summaries() {
        let local =
            Attachment::new(NoteId::new(), "memo.m4a", "audio/mp4", 10, Some("ours".into()))
                .unwrap();
        let mut remote = local.clone();
        remote.summary = Some("theirs".into());
        remote.filename = "renamed.m4a".into();

        match merge_snapshots(
            &EntitySnapshot::Attachment(local),
            &EntitySnapshot::Attachment(remote),
        )
        .unwrap()
        {
            EntitySnapshot::Attachment(attachment) => {
                assert_eq!(attachment.filename, "memo.m4a");
                assert_eq!(attachment.summary.as_deref(), Some("ours\n\ntheirs"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn merge_rejects_mismatched_types() {
        let note = EntitySnapshot::Note(Note::new("n").unwrap());
        let tag = EntitySnapshot::Tag(Tag::new("t", None).unwrap());
        assert!(merge_snapshots(&note, &tag).is_err());
    }
}
