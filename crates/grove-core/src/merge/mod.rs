//! Merge & conflict engine
//!
//! Decides, per incoming change record, whether to apply it, ignore it, or
//! record a conflict. A batch is applied inside a single transaction.

mod conflicts;
mod resolve;
mod text;

use libsql::Connection;
use serde::{Deserialize, Serialize};

use crate::db::{begin, finish, would_create_cycle};
use crate::error::{Error, Result};
use crate::ledger::ChangeLedger;
use crate::models::{ApplyOutcome, ChangeRecord, DeviceId, EntitySnapshot, EntityType, RecordResult};

pub use conflicts::ConflictRepository;
pub use resolve::merge_snapshots;
pub use text::merge_text;

/// What to do with one incoming snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Apply,
    Unchanged,
    Conflict,
}

/// Classify an incoming snapshot against local state.
///
/// `watermark` is the last successful sync with the sending peer; without one,
/// both sides are treated as changed.
pub fn classify(
    local: Option<&EntitySnapshot>,
    incoming: &EntitySnapshot,
    watermark: Option<i64>,
) -> Decision {
    let Some(local) = local else {
        return Decision::Apply;
    };
    if local.same_content(incoming) {
        return Decision::Unchanged;
    }

    let changed_since =
        |snapshot: &EntitySnapshot| watermark.is_none_or(|w| snapshot.modified_at() > w);
    let incoming_newer = incoming.modified_at() > local.modified_at();

    match (local.is_deleted(), incoming.is_deleted()) {
        (true, true) => {
            if incoming_newer {
                Decision::Apply
            } else {
                Decision::Unchanged
            }
        }
        (true, false) | (false, true) => {
            if incoming_newer {
                Decision::Apply
            } else if changed_since(incoming) {
                Decision::Conflict
            } else {
                // A stale copy the sender has not touched since the last sync
                Decision::Unchanged
            }
        }
        (false, false) => {
            let local_changed = changed_since(local);
            if local_changed && changed_since(incoming) {
                Decision::Conflict
            } else if incoming_newer && !local_changed {
                Decision::Apply
            } else {
                Decision::Unchanged
            }
        }
    }
}

/// Who sent a batch and what the pair last agreed on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeContext {
    pub watermark: Option<i64>,
    pub remote_device_id: Option<DeviceId>,
    pub remote_device_name: Option<String>,
}

/// Outcome totals for one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub applied: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub rejected: usize,
}

impl OutcomeCounts {
    pub fn tally(results: &[RecordResult]) -> Self {
        results.iter().fold(Self::default(), |mut counts, result| {
            match result.outcome {
                ApplyOutcome::Applied => counts.applied += 1,
                ApplyOutcome::Unchanged => counts.unchanged += 1,
                ApplyOutcome::Conflicted => counts.conflicts += 1,
                ApplyOutcome::Rejected => counts.rejected += 1,
            }
            counts
        })
    }
}

pub struct MergeEngine<'a> {
    conn: &'a Connection,
}

impl<'a> MergeEngine<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Apply a batch of incoming records in one transaction.
    ///
    /// Records are processed in dependency order, then by `modified_at`.
    /// Rejections and conflicts are per-record outcomes; only storage errors
    /// or an unsupported schema fail the batch.
    pub async fn apply_batch(
        &self,
        records: Vec<ChangeRecord>,
        context: &MergeContext,
    ) -> Result<Vec<RecordResult>> {
        for record in &records {
            record.check_schema()?;
        }
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut ordered = records;
        ordered.sort_by_key(|record| (record.entity_type(), record.modified_at()));

        begin(self.conn).await?;
        let result = self.apply_ordered(&ordered, context).await;
        let results = finish(self.conn, result).await?;

        let counts = OutcomeCounts::tally(&results);
        tracing::info!(
            remote = ?context.remote_device_id,
            applied = counts.applied,
            unchanged = counts.unchanged,
            conflicts = counts.conflicts,
            rejected = counts.rejected,
            "Applied change batch"
        );
        Ok(results)
    }

    async fn apply_ordered(
        &self,
        records: &[ChangeRecord],
        context: &MergeContext,
    ) -> Result<Vec<RecordResult>> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            results.push(self.apply_one(record, context).await?);
        }
        Ok(results)
    }

    async fn apply_one(&self, record: &ChangeRecord, context: &MergeContext) -> Result<RecordResult> {
        let incoming = &record.entity;
        let rejection = match incoming.validate() {
            Ok(()) => self.check_references(incoming).await?,
            Err(error) => Some(error.to_string()),
        };
        if let Some(reason) = rejection {
            tracing::warn!(
                entity_type = %record.entity_type(),
                entity_id = %record.entity_id(),
                "Rejected incoming change: {reason}"
            );
            return Ok(RecordResult::rejected(record, reason));
        }

        let ledger = ChangeLedger::new(self.conn);
        let local = ledger
            .load(incoming.entity_type(), &incoming.entity_id())
            .await?;

        let outcome = match classify(local.as_ref(), incoming, context.watermark) {
            Decision::Apply => {
                ledger.write(incoming).await?;
                ApplyOutcome::Applied
            }
            Decision::Unchanged => ApplyOutcome::Unchanged,
            Decision::Conflict => {
                let local = local.ok_or_else(|| {
                    Error::Database(format!("conflict without local state: {}", record.entity_id()))
                })?;
                ConflictRepository::new(self.conn)
                    .record(
                        &local,
                        incoming,
                        context.remote_device_id,
                        context.remote_device_name.as_deref(),
                    )
                    .await?;
                ApplyOutcome::Conflicted
            }
        };
        Ok(RecordResult::new(record, outcome))
    }

    /// Reasons a structurally valid snapshot cannot be stored here.
    async fn check_references(&self, snapshot: &EntitySnapshot) -> Result<Option<String>> {
        let ledger = ChangeLedger::new(self.conn);
        let reason = match snapshot {
            EntitySnapshot::Note(_) => None,
            EntitySnapshot::Tag(tag) => match tag.parent_id {
                Some(parent_id) => match would_create_cycle(self.conn, &tag.id, &parent_id).await {
                    Ok(true) => Some(format!("parent {parent_id} would create a tag cycle")),
                    Ok(false) => None,
                    Err(Error::Validation { message, .. }) => Some(message),
                    Err(error) => return Err(error),
                },
                None => None,
            },
            EntitySnapshot::NoteTag(link) => {
                if ledger
                    .load(EntityType::Note, &link.note_id.to_string())
                    .await?
                    .is_none()
                {
                    Some(format!("unknown note {}", link.note_id))
                } else if ledger
                    .load(EntityType::Tag, &link.tag_id.to_string())
                    .await?
                    .is_none()
                {
                    Some(format!("unknown tag {}", link.tag_id))
                } else {
                    None
                }
            }
            EntitySnapshot::Attachment(attachment) => ledger
                .load(EntityType::Note, &attachment.note_id.to_string())
                .await?
                .is_none()
                .then(|| format!("unknown note {}", attachment.note_id)),
        };
        Ok(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{Attachment, Note, NoteId, NoteTag, Tag, TagId};
    use pretty_assertions::assert_eq;

    fn note(content: &str, modified_at: i64) -> Note {
        Note {
            id: NoteId::new(),
            content: content.to_string(),
            created_at: 1,
            modified_at,
            deleted_at: None,
        }
    }

    fn edited(base: &Note, content: &str, modified_at: i64) -> EntitySnapshot {
        let mut copy = base.clone();
        copy.content = content.to_string();
        copy.modified_at = modified_at;
        EntitySnapshot::Note(copy)
    }

    fn deleted(base: &Note, at: i64) -> EntitySnapshot {
        let mut copy = base.clone();
        copy.modified_at = at;
        copy.deleted_at = Some(at);
        EntitySnapshot::Note(copy)
    }

    fn record(snapshot: EntitySnapshot) -> ChangeRecord {
        ChangeRecord::new(snapshot, None)
    }

    #[test]
    fn classify_absent_local_applies() {
        let incoming = EntitySnapshot::Note(note("new", 10));
        assert_eq!(classify(None, &incoming, Some(100)), Decision::Apply);
    }

    #[test]
    fn classify_identical_is_unchanged() {
        let base = note("same", 10);
        let local = EntitySnapshot::Note(base.clone());
        let incoming = edited(&base, "same", 50);
        assert_eq!(classify(Some(&local), &incoming, Some(5)), Decision::Unchanged);
    }

    #[test]
    fn classify_lww_when_only_remote_changed() {
        let base = note("v1", 10);
        let local = EntitySnapshot::Note(base.clone());
        let incoming = edited(&base, "v2", 30);
        assert_eq!(classify(Some(&local), &incoming, Some(20)), Decision::Apply);
    }

    #[test]
    fn classify_keeps_local_when_only_local_changed() {
        let base = note("v1", 10);
        let local = edited(&base, "local edit", 30);
        let incoming = EntitySnapshot::Note(base);
        assert_eq!(classify(Some(&local), &incoming, Some(20)), Decision::Unchanged);
    }

    #[test]
    fn classify_both_changed_conflicts() {
        let base = note("v1", 10);
        let local = edited(&base, "local", 30);
        let incoming = edited(&base, "remote", 40);
        assert_eq!(classify(Some(&local), &incoming, Some(20)), Decision::Conflict);
        assert_eq!(classify(Some(&local), &incoming, None), Decision::Conflict);
    }

    #[test]
    fn classify_newer_tombstone_applies() {
        let base = note("v1", 10);
        let local = EntitySnapshot::Note(base.clone());
        assert_eq!(
            classify(Some(&local), &deleted(&base, 30), Some(5)),
            Decision::Apply
        );
    }

    #[test]
    fn classify_stale_live_copy_does_not_resurrect() {
        let base = note("v1", 10);
        let local = deleted(&base, 30);
        let incoming = EntitySnapshot::Note(base);
        assert_eq!(classify(Some(&local), &incoming, Some(20)), Decision::Unchanged);
    }

    #[test]
    fn classify_older_edit_against_tombstone_conflicts() {
        let base = note("v1", 10);
        let local = deleted(&base, 40);
        let incoming = edited(&base, "edited", 30);
        assert_eq!(classify(Some(&local), &incoming, Some(20)), Decision::Conflict);
    }

    #[test]
    fn tally_counts_outcomes() {
        let r = record(EntitySnapshot::Note(note("x", 1)));
        let results = vec![
            RecordResult::new(&r, ApplyOutcome::Applied),
            RecordResult::new(&r, ApplyOutcome::Applied),
            RecordResult::new(&r, ApplyOutcome::Conflicted),
            RecordResult::rejected(&r, "bad"),
        ];
        let counts = OutcomeCounts::tally(&results);
        assert_eq!(
            counts,
            OutcomeCounts {
                applied: 2,
                unchanged: 0,
                conflicts: 1,
                rejected: 1
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_batch_preserves_remote_timestamp() {
        let db = Database::open_in_memory().await.unwrap();
        let engine = MergeEngine::new(db.connection());
        let incoming = note("remote", 12_345);

        let results = engine
            .apply_batch(
                vec![record(EntitySnapshot::Note(incoming.clone()))],
                &MergeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(results[0].outcome, ApplyOutcome::Applied);

        let stored = ChangeLedger::new(db.connection())
            .load(EntityType::Note, &incoming.id.to_string())
            .await
            .unwrap();
        assert_eq!(stored, Some(EntitySnapshot::Note(incoming)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_batch_is_idempotent() {
        let db = Database::open_in_memory().await.unwrap();
        let engine = MergeEngine::new(db.connection());
        let context = MergeContext {
            watermark: Some(20),
            ..MergeContext::default()
        };

        let base = note("v1", 10);
        ChangeLedger::new(db.connection())
            .write(&edited(&base, "local", 30))
            .await
            .unwrap();
        let batch = vec![
            record(EntitySnapshot::Note(note("fresh", 40))),
            record(edited(&base, "remote", 35)),
        ];

        let first = engine.apply_batch(batch.clone(), &context).await.unwrap();
        let second = engine.apply_batch(batch, &context).await.unwrap();

        let outcomes: Vec<ApplyOutcome> = first.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![ApplyOutcome::Conflicted, ApplyOutcome::Applied]);
        let outcomes: Vec<ApplyOutcome> = second.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![ApplyOutcome::Conflicted, ApplyOutcome::Unchanged]);

        let open = ConflictRepository::new(db.connection()).count_open().await.unwrap();
        assert_eq!(open, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_batch_orders_by_dependency() {
        let db = Database::open_in_memory().await.unwrap();
        let engine = MergeEngine::new(db.connection());

        let n = note("tagged", 10);
        let mut tag = Tag::new("work", None).unwrap();
        tag.modified_at = 20;
        let mut link = NoteTag::new(n.id, tag.id);
        link.modified_at = 5;
        let mut attachment = Attachment::new(n.id, "a.png", "image/png", 3, None).unwrap();
        attachment.modified_at = 1;

        let results = engine
            .apply_batch(
                vec![
                    record(EntitySnapshot::Attachment(attachment)),
                    record(EntitySnapshot::NoteTag(link)),
                    record(EntitySnapshot::Tag(tag)),
                    record(EntitySnapshot::Note(n)),
                ],
                &MergeContext::default(),
            )
            .await
            .unwrap();

        let types: Vec<EntityType> = results.iter().map(|r| r.entity_type).collect();
        assert_eq!(types, EntityType::ALL.to_vec());
        assert!(results.iter().all(|r| r.outcome == ApplyOutcome::Applied));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_batch_rejects_without_failing() {
        let db = Database::open_in_memory().await.unwrap();
        let engine = MergeEngine::new(db.connection());

        let orphan_link = NoteTag::new(NoteId::new(), TagId::new());
        let mut bad_tag = Tag::new("ok", None).unwrap();
        bad_tag.name = "a/b".into();
        let good = note("fine", 10);

        let results = engine
            .apply_batch(
                vec![
                    record(EntitySnapshot::NoteTag(orphan_link)),
                    record(EntitySnapshot::Tag(bad_tag)),
                    record(EntitySnapshot::Note(good)),
                ],
                &MergeContext::default(),
            )
            .await
            .unwrap();

        let counts = OutcomeCounts::tally(&results);
        assert_eq!(counts.applied, 1);
        assert_eq!(counts.rejected, 2);
        assert!(results
            .iter()
            .filter(|r| r.outcome == ApplyOutcome::Rejected)
            .all(|r| r.reason.is_some()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_batch_rejects_tag_cycles() {
        let db = Database::open_in_memory().await.unwrap();
        let engine = MergeEngine::new(db.connection());
        let ledger = ChangeLedger::new(db.connection());

        let parent = Tag::new("parent", None).unwrap();
        let child = Tag::new("child", Some(parent.id)).unwrap();
        ledger.write(&EntitySnapshot::Tag(parent.clone())).await.unwrap();
        ledger.write(&EntitySnapshot::Tag(child.clone())).await.unwrap();

        let mut looped = parent;
        looped.parent_id = Some(child.id);
        looped.modified_at += 1_000;

        let results = engine
            .apply_batch(
                vec![record(EntitySnapshot::Tag(looped))],
                &MergeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(results[0].outcome, ApplyOutcome::Rejected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_schema_fails_whole_batch() {
        let db = Database::open_in_memory().await.unwrap();
        let engine = MergeEngine::new(db.connection());

        let mut future = record(EntitySnapshot::Note(note("future", 10)));
        future.schema_version = 99;
        let ok = record(EntitySnapshot::Note(note("ok", 10)));

        let result = engine
            .apply_batch(vec![ok, future], &MergeContext::default())
            .await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(ChangeLedger::new(db.connection())
            .full_snapshot(EntityType::Note)
            .await
            .unwrap()
            .is_empty());
    }
}
