//! Sync rounds against registered peers.
//!
//! A round is handshake, pull, local apply, push, then the watermark moves to
//! the round's start time. Any failure before the last step leaves the
//! watermark untouched, so the next round re-sends everything since the last
//! fully successful one.

mod session;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::{DeviceIdentity, TrustDecision};
use crate::merge::{MergeContext, OutcomeCounts};
use crate::models::{ApplyOutcome, ChangeRecord, DeviceId, EntityType, Peer, RecordResult};
use crate::services::DatabaseService;
use crate::transport::{
    is_compatible, ApplyRequest, HandshakeRequest, HandshakeResponse, PeerSession,
    PeerTransport, StatusResponse, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, PROTOCOL_VERSION,
};
use crate::util::now_millis;

pub use session::{SessionState, SyncSession};

/// Clock difference beyond which a handshake logs a warning
pub const CLOCK_SKEW_WARNING_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Exchange changes since the pair's watermark
    Incremental,
    /// Exchange everything, ignoring the watermark
    Full,
}

/// What one round moved in each direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub peer_id: DeviceId,
    pub mode: SyncMode,
    pub started_at: i64,
    pub finished_at: i64,
    pub pulled: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub rejected: usize,
    pub pushed: usize,
    pub remote_applied: usize,
    pub remote_unchanged: usize,
    pub remote_conflicts: usize,
    pub remote_rejected: usize,
    pub trust: TrustDecision,
}

/// One async lock per peer, so rounds with the same peer never interleave.
#[derive(Debug, Clone, Default)]
pub struct PeerLocks {
    locks: Arc<Mutex<HashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PeerLocks {
    pub fn lock_for(&self, peer_id: DeviceId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(peer_id)
            .or_default()
            .clone()
    }

    /// Drop the lock of a peer that is gone from the registry.
    pub fn forget(&self, peer_id: &DeviceId) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer_id);
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs sync rounds for this device over transport `T`.
#[derive(Clone)]
pub struct SyncEngine<T> {
    db: DatabaseService,
    identity: Arc<DeviceIdentity>,
    transport: T,
    locks: PeerLocks,
    page_size: usize,
}

impl<T: PeerTransport> SyncEngine<T> {
    pub fn new(db: DatabaseService, identity: Arc<DeviceIdentity>, transport: T) -> Self {
        Self {
            db,
            identity,
            transport,
            locks: PeerLocks::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Records per pulled page and per pushed apply batch.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub const fn database(&self) -> &DatabaseService {
        &self.db
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn shared_identity(&self) -> Arc<DeviceIdentity> {
        self.identity.clone()
    }

    /// Run one round with `peer_id`, waiting for any round already in flight.
    pub async fn sync_peer(&self, peer_id: &DeviceId, mode: SyncMode) -> Result<SyncReport> {
        let lock = self.locks.lock_for(*peer_id);
        let _guard = lock.lock().await;

        let peer = self.db.require_peer(peer_id).await?;
        let mut session = SyncSession::new(peer.peer_id);
        match self.run_round(&peer, mode, &mut session).await {
            Ok(report) => {
                tracing::info!(
                    peer_id = %peer.peer_id,
                    peer_name = %peer.peer_name,
                    mode = ?mode,
                    pulled = report.pulled,
                    applied = report.applied,
                    conflicts = report.conflicts,
                    rejected = report.rejected,
                    pushed = report.pushed,
                    remote_conflicts = report.remote_conflicts,
                    "Sync round complete"
                );
                Ok(report)
            }
            Err(error) => {
                let failed_in = session.state();
                session.fail();
                tracing::warn!(
                    peer_id = %peer.peer_id,
                    peer_name = %peer.peer_name,
                    state = %failed_in,
                    error = %error,
                    "Sync round failed"
                );
                Err(error)
            }
        }
    }

    /// Sync every registered peer concurrently; one result per peer.
    pub async fn sync_all(&self, mode: SyncMode) -> Result<Vec<(Peer, Result<SyncReport>)>> {
        let peers = self.db.list_peers().await?;
        let rounds = peers.into_iter().map(|peer| async move {
            let result = self.sync_peer(&peer.peer_id, mode).await;
            (peer, result)
        });
        Ok(join_all(rounds).await)
    }

    /// Exchange everything with `peer_id` right away.
    pub async fn full_resync(&self, peer_id: &DeviceId) -> Result<SyncReport> {
        self.sync_peer(peer_id, SyncMode::Full).await
    }

    /// Forget the pair's watermark; the next round is a full exchange.
    pub async fn reset_watermark(&self, peer_id: &DeviceId) -> Result<()> {
        let lock = self.locks.lock_for(*peer_id);
        let _guard = lock.lock().await;
        self.db.reset_watermark(peer_id).await
    }

    /// Remove `peer_id` from the registry once any round with it has finished.
    pub async fn remove_peer(&self, peer_id: &DeviceId) -> Result<()> {
        let lock = self.locks.lock_for(*peer_id);
        let guard = lock.lock().await;
        let result = self.db.remove_peer(peer_id).await;
        drop(guard);
        self.locks.forget(peer_id);
        result
    }

    /// Ask a registered peer for its status without touching any state.
    pub async fn peer_status(&self, peer_id: &DeviceId) -> Result<StatusResponse> {
        let peer = self.db.require_peer(peer_id).await?;
        let remote = self.transport.open(&peer).await?;
        remote.status().await
    }

    async fn run_round(
        &self,
        peer: &Peer,
        mode: SyncMode,
        session: &mut SyncSession,
    ) -> Result<SyncReport> {
        let started_at = now_millis();
        let watermark = peer.last_sync_at;

        session.advance(SessionState::Handshaking)?;
        let remote = self.transport.open(peer).await?;
        let hello = remote
            .handshake(&HandshakeRequest {
                device_id: self.identity.device_id(),
                device_name: self.identity.device_name().to_string(),
                protocol_version: PROTOCOL_VERSION.to_string(),
            })
            .await?;
        check_handshake(peer, &hello, started_at)?;
        let trust = self.verify_trust(peer, &remote).await?;

        session.advance(SessionState::ExchangingChanges)?;
        let incoming = match (mode, watermark) {
            (SyncMode::Incremental, Some(since)) => self.pull_changes(&remote, since).await?,
            _ => remote.full().await?.changes,
        };
        let pulled = incoming.len();
        let keys: Vec<_> = incoming.iter().map(record_key).collect();

        session.advance(SessionState::Applying)?;
        let context = MergeContext {
            watermark,
            remote_device_id: Some(peer.peer_id),
            remote_device_name: Some(hello.device_name.clone()),
        };
        let results = self.db.apply_batch_detached(incoming, context).await?;
        let local = OutcomeCounts::tally(&results);
        log_rejections(peer, &results);

        session.advance(SessionState::ExchangingChanges)?;
        let echoed = applied_keys(keys, &results);
        let since = match mode {
            SyncMode::Incremental => watermark,
            SyncMode::Full => None,
        };
        let outgoing: Vec<ChangeRecord> = self
            .db
            .outgoing_changes(since, self.identity.device_id())
            .await?
            .into_iter()
            .filter(|record| !echoed.contains(&record_key(record)))
            .collect();
        let remote_counts = self
            .push_changes(&remote, &outgoing, watermark, started_at)
            .await?;

        self.db.advance_watermark(&peer.peer_id, started_at).await?;
        session.advance(SessionState::Idle)?;

        Ok(SyncReport {
            peer_id: peer.peer_id,
            mode,
            started_at,
            finished_at: now_millis(),
            pulled,
            applied: local.applied,
            unchanged: local.unchanged,
            conflicts: local.conflicts,
            rejected: local.rejected,
            pushed: outgoing.len(),
            remote_applied: remote_counts.applied,
            remote_unchanged: remote_counts.unchanged,
            remote_conflicts: remote_counts.conflicts,
            remote_rejected: remote_counts.rejected,
            trust,
        })
    }

    async fn verify_trust(&self, peer: &Peer, remote: &T::Session) -> Result<TrustDecision> {
        if !peer.uses_tls() {
            return Ok(TrustDecision::Plaintext);
        }
        let presented = remote.presented_fingerprint().ok_or_else(|| {
            Error::Protocol(format!(
                "peer {} completed TLS without presenting a certificate",
                peer.peer_id
            ))
        })?;
        self.db.verify_peer(peer, &presented).await
    }

    async fn pull_changes(&self, remote: &T::Session, since: i64) -> Result<Vec<ChangeRecord>> {
        let mut records = Vec::new();
        for entity_type in EntityType::ALL {
            let mut cursor = since;
            loop {
                let page = remote.changes(entity_type, cursor, self.page_size).await?;
                if page.entity_type != entity_type {
                    return Err(Error::Protocol(format!(
                        "asked for {entity_type} changes, received {}",
                        page.entity_type
                    )));
                }
                let is_complete = page.is_complete;
                if !is_complete && page.next_since <= cursor {
                    return Err(Error::Protocol(format!(
                        "{entity_type} paging made no progress past {cursor}"
                    )));
                }
                cursor = page.next_since;
                records.extend(page.changes);
                if is_complete {
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Push `outgoing` in pages. The last request, sent even when there is
    /// nothing to push, closes the round on the responder's side.
    async fn push_changes(
        &self,
        remote: &T::Session,
        outgoing: &[ChangeRecord],
        base_watermark: Option<i64>,
        started_at: i64,
    ) -> Result<OutcomeCounts> {
        let mut totals = OutcomeCounts::default();
        let mut chunks: Vec<&[ChangeRecord]> = outgoing.chunks(self.page_size).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let last = chunks.len() - 1;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let response = remote
                .apply(&ApplyRequest {
                    device_id: self.identity.device_id(),
                    device_name: self.identity.device_name().to_string(),
                    base_watermark,
                    changes: chunk.to_vec(),
                    round_started_at: (index == last).then_some(started_at),
                })
                .await?;
            totals.applied += response.counts.applied;
            totals.unchanged += response.counts.unchanged;
            totals.conflicts += response.counts.conflicts;
            totals.rejected += response.counts.rejected;
        }
        Ok(totals)
    }
}

fn check_handshake(peer: &Peer, hello: &HandshakeResponse, now: i64) -> Result<()> {
    if hello.device_id != peer.peer_id {
        return Err(Error::Protocol(format!(
            "peer at {} identified as {}, expected {}",
            peer.peer_url, hello.device_id, peer.peer_id
        )));
    }
    if !is_compatible(&hello.protocol_version) {
        return Err(Error::Protocol(format!(
            "peer {} speaks protocol {}, this device speaks {PROTOCOL_VERSION}",
            peer.peer_id, hello.protocol_version
        )));
    }
    let skew = (hello.server_time - now).abs();
    if skew > CLOCK_SKEW_WARNING_MS {
        tracing::warn!(
            peer_id = %peer.peer_id,
            skew_ms = skew,
            "Peer clock differs from local clock; last-writer-wins may pick surprising winners"
        );
    }
    Ok(())
}

type RecordKey = (EntityType, String, i64);

fn record_key(record: &ChangeRecord) -> RecordKey {
    (record.entity_type(), record.entity_id(), record.modified_at())
}

/// Keys of pulled records that were written locally and need not be pushed back.
fn applied_keys(keys: Vec<RecordKey>, results: &[RecordResult]) -> HashSet<RecordKey> {
    let applied: HashSet<(EntityType, &str)> = results
        .iter()
        .filter(|result| result.outcome == ApplyOutcome::Applied)
        .map(|result| (result.entity_type, result.entity_id.as_str()))
        .collect();
    keys.into_iter()
        .filter(|(entity_type, entity_id, _)| applied.contains(&(*entity_type, entity_id.as_str())))
        .collect()
}

fn log_rejections(peer: &Peer, results: &[RecordResult]) {
    for result in results
        .iter()
        .filter(|result| result.outcome == ApplyOutcome::Rejected)
    {
        tracing::warn!(
            peer_id = %peer.peer_id,
            entity_type = %result.entity_type,
            entity_id = %result.entity_id,
            reason = result.reason.as_deref().unwrap_or("unspecified"),
            "Rejected incoming change"
        );
    }
}
