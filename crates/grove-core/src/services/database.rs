//! Shared database service wrapper used by the sync engine, the responder and the CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::db::{Database, LibSqlNoteRepository, NoteRepository};
use crate::identity::{Fingerprint, TrustDecision, TrustStore};
use crate::ledger::{ChangeLedger, ChangePage};
use crate::merge::{ConflictRepository, MergeContext, MergeEngine};
use crate::models::{
    Attachment, AttachmentId, ChangeRecord, Conflict, ConflictId, DeviceId, EntityType, Note,
    NoteId, NoteTag, Peer, PeerRegistration, RecordResult, ResolutionChoice, Tag, TagId,
};
use crate::peers::PeerRegistry;
use crate::{Error, Result};

/// Thread-safe service for DB and repository operations.
///
/// All writes go through one connection behind an async mutex, so they are
/// serialized per database.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl DatabaseService {
    /// Open a database service at the given filesystem path.
    ///
    /// A file that is not a database is moved aside and a fresh one created.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local DB at {} is unreadable: {}. Moving it aside and starting fresh.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path).await?
            }
            Err(error) => return Err(error),
        };
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory database service (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Exclusive access to the database for multi-step work.
    pub async fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().await
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        error
            .to_string()
            .to_ascii_lowercase()
            .contains("file is not a database")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        if db_path.exists() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let base_name = db_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("grove.db");
            let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local DB file from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        for suffix in ["-wal", "-shm"] {
            let Some(name) = db_path.file_name().and_then(|name| name.to_str()) else {
                break;
            };
            let sidecar = db_path.with_file_name(format!("{name}{suffix}"));
            if sidecar.exists() {
                std::fs::remove_file(&sidecar)?;
                tracing::warn!("Removed stale DB sidecar {}", sidecar.display());
            }
        }

        Ok(())
    }

    // Notes, tags and attachments

    /// List live notes, most recently modified first.
    pub async fn list_notes(&self, limit: usize, offset: usize) -> Result<Vec<Note>> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .list(limit, offset)
            .await
    }

    pub async fn get_note(&self, id: &NoteId) -> Result<Option<Note>> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection()).get(id).await
    }

    pub async fn create_note(&self, content: &str) -> Result<Note> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .create(content)
            .await
    }

    pub async fn update_note(&self, id: &NoteId, content: &str) -> Result<Note> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .update(id, content)
            .await
    }

    /// Tombstone a note.
    pub async fn delete_note(&self, id: &NoteId) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection()).delete(id).await
    }

    pub async fn create_tag(&self, name: &str, parent_id: Option<TagId>) -> Result<Tag> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .create_tag(name, parent_id)
            .await
    }

    pub async fn list_tags(&self) -> Result<Vec<Tag>> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection()).list_tags().await
    }

    pub async fn tag_note(&self, note_id: &NoteId, tag_id: &TagId) -> Result<NoteTag> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .tag_note(note_id, tag_id)
            .await
    }

    pub async fn untag_note(&self, note_id: &NoteId, tag_id: &TagId) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .untag_note(note_id, tag_id)
            .await
    }

    pub async fn add_attachment(&self, attachment: &Attachment) -> Result<Attachment> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .add_attachment(attachment)
            .await
    }

    pub async fn delete_attachment(&self, id: &AttachmentId) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .delete_attachment(id)
            .await
    }

    // Change ledger and merge engine

    pub async fn changes_page(
        &self,
        entity_type: EntityType,
        since: i64,
        limit: usize,
        origin: DeviceId,
    ) -> Result<ChangePage> {
        let db = self.db.lock().await;
        ChangeLedger::new(db.connection())
            .with_origin(origin)
            .changes_page(entity_type, since, limit)
            .await
    }

    /// Changes across all entity types since `since`, or everything for `None`.
    pub async fn outgoing_changes(
        &self,
        since: Option<i64>,
        origin: DeviceId,
    ) -> Result<Vec<ChangeRecord>> {
        let db = self.db.lock().await;
        ChangeLedger::new(db.connection())
            .with_origin(origin)
            .outgoing_changes(since)
            .await
    }

    pub async fn apply_batch(
        &self,
        records: Vec<ChangeRecord>,
        context: &MergeContext,
    ) -> Result<Vec<RecordResult>> {
        let db = self.db.lock().await;
        MergeEngine::new(db.connection())
            .apply_batch(records, context)
            .await
    }

    /// Apply a batch on a spawned task.
    ///
    /// The transaction always commits or rolls back, even if the caller's
    /// future is dropped mid-apply.
    pub async fn apply_batch_detached(
        &self,
        records: Vec<ChangeRecord>,
        context: MergeContext,
    ) -> Result<Vec<RecordResult>> {
        let service = self.clone();
        tokio::spawn(async move { service.apply_batch(records, &context).await })
            .await
            .map_err(|error| Error::Database(format!("apply task failed: {error}")))?
    }

    pub async fn list_conflicts(&self, include_resolved: bool) -> Result<Vec<Conflict>> {
        let db = self.db.lock().await;
        ConflictRepository::new(db.connection())
            .list(include_resolved)
            .await
    }

    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        choice: ResolutionChoice,
    ) -> Result<Conflict> {
        let db = self.db.lock().await;
        MergeEngine::new(db.connection()).resolve(id, choice).await
    }

    // Peer registry

    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        let db = self.db.lock().await;
        PeerRegistry::new(db.connection()).list().await
    }

    pub async fn get_peer(&self, peer_id: &DeviceId) -> Result<Option<Peer>> {
        let db = self.db.lock().await;
        PeerRegistry::new(db.connection()).get(peer_id).await
    }

    pub async fn require_peer(&self, peer_id: &DeviceId) -> Result<Peer> {
        let db = self.db.lock().await;
        PeerRegistry::new(db.connection()).require(peer_id).await
    }

    pub async fn register_peer(
        &self,
        registration: PeerRegistration,
        local_device: Option<DeviceId>,
    ) -> Result<Peer> {
        let db = self.db.lock().await;
        PeerRegistry::new(db.connection())
            .register(registration, local_device)
            .await
    }

    pub async fn seed_peers(
        &self,
        seeds: &[PeerRegistration],
        local_device: Option<DeviceId>,
    ) -> Result<usize> {
        let db = self.db.lock().await;
        PeerRegistry::new(db.connection())
            .seed(seeds, local_device)
            .await
    }

    pub async fn remove_peer(&self, peer_id: &DeviceId) -> Result<()> {
        let db = self.db.lock().await;
        PeerRegistry::new(db.connection()).remove(peer_id).await
    }

    pub async fn advance_watermark(&self, peer_id: &DeviceId, round_started_at: i64) -> Result<()> {
        let db = self.db.lock().await;
        PeerRegistry::new(db.connection())
            .advance_watermark(peer_id, round_started_at)
            .await
    }

    /// Note that `device_id` finished a round it started against this device.
    pub async fn record_inbound_round(
        &self,
        device_id: &DeviceId,
        device_name: &str,
        round_started_at: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        PeerRegistry::new(db.connection())
            .record_inbound_round(device_id, device_name, round_started_at)
            .await
    }

    pub async fn reset_watermark(&self, peer_id: &DeviceId) -> Result<()> {
        let db = self.db.lock().await;
        PeerRegistry::new(db.connection())
            .reset_watermark(peer_id)
            .await
    }

    /// Check a presented certificate against the peer's pin, pinning on first contact.
    pub async fn verify_peer(&self, peer: &Peer, presented: &Fingerprint) -> Result<TrustDecision> {
        let db = self.db.lock().await;
        TrustStore::new(db.connection())
            .verify_peer(peer, presented)
            .await
    }
}
