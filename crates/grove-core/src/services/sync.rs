//! Front-end surface over the sync engine and peer registry.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::GroveConfig;
use crate::identity::DeviceIdentity;
use crate::models::{Conflict, ConflictId, DeviceId, Peer, PeerRegistration, ResolutionChoice};
use crate::sync::{SyncEngine, SyncMode, SyncReport};
use crate::transport::{HttpTransport, PeerTransport, StatusResponse, SyncResponder};
use crate::Result;

use super::DatabaseService;

/// Which peers `sync_now` talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    Peer(DeviceId),
    All,
}

/// Outcome of one peer's round within a multi-peer sync.
#[derive(Debug)]
pub struct PeerSyncResult {
    pub peer: Peer,
    pub result: Result<SyncReport>,
}

/// Sync operations for one device, keeping `config.json` peer seeds in step
/// with the registry when a config directory is attached.
#[derive(Clone)]
pub struct SyncService<T = HttpTransport> {
    engine: SyncEngine<T>,
    config_dir: Option<PathBuf>,
}

impl SyncService<HttpTransport> {
    /// Build the HTTP(S) service described by `config`, seeding the registry
    /// from its peer list.
    pub async fn from_config(
        db: DatabaseService,
        identity: Arc<DeviceIdentity>,
        config: &GroveConfig,
        config_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let seeded = db
            .seed_peers(&config.sync.peers, Some(identity.device_id()))
            .await?;
        if seeded > 0 {
            tracing::debug!(count = seeded, "Seeded peer registry from config");
        }
        let transport = HttpTransport::new(identity.device_id(), config.transport_options());
        let engine =
            SyncEngine::new(db, identity, transport).with_page_size(config.sync.page_size);
        Ok(Self::new(engine).with_config_dir(config_dir))
    }
}

impl<T: PeerTransport> SyncService<T> {
    pub const fn new(engine: SyncEngine<T>) -> Self {
        Self {
            engine,
            config_dir: None,
        }
    }

    /// Mirror registry changes and pinned fingerprints into `config.json` under `dir`.
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub const fn engine(&self) -> &SyncEngine<T> {
        &self.engine
    }

    fn db(&self) -> &DatabaseService {
        self.engine.database()
    }

    /// Sync one peer or every peer.
    ///
    /// A single-peer round's failure is returned as the error; with
    /// [`SyncTarget::All`] every peer gets its own result.
    pub async fn sync_now(&self, target: SyncTarget, mode: SyncMode) -> Result<Vec<PeerSyncResult>> {
        let results = match target {
            SyncTarget::Peer(peer_id) => {
                let report = self.engine.sync_peer(&peer_id, mode).await;
                self.persist_pins().await;
                let report = report?;
                let peer = self.db().require_peer(&peer_id).await?;
                vec![PeerSyncResult {
                    peer,
                    result: Ok(report),
                }]
            }
            SyncTarget::All => {
                let rounds = self.engine.sync_all(mode).await?;
                self.persist_pins().await;
                rounds
                    .into_iter()
                    .map(|(peer, result)| PeerSyncResult { peer, result })
                    .collect()
            }
        };
        Ok(results)
    }

    pub async fn full_resync(&self, peer_id: &DeviceId) -> Result<SyncReport> {
        let report = self.engine.full_resync(peer_id).await;
        self.persist_pins().await;
        report
    }

    pub async fn reset_watermark(&self, peer_id: &DeviceId) -> Result<()> {
        self.engine.reset_watermark(peer_id).await
    }

    pub async fn peer_status(&self, peer_id: &DeviceId) -> Result<StatusResponse> {
        self.engine.peer_status(peer_id).await
    }

    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        self.db().list_peers().await
    }

    /// Register (or update) a peer. Invalid input fails before anything is stored.
    pub async fn add_peer(&self, registration: PeerRegistration) -> Result<Peer> {
        let peer = self
            .db()
            .register_peer(registration, Some(self.engine.identity().device_id()))
            .await?;
        self.update_seeds(|config| {
            config.upsert_peer_seed(&peer);
            true
        });
        Ok(peer)
    }

    pub async fn remove_peer(&self, peer_id: &DeviceId) -> Result<()> {
        self.engine.remove_peer(peer_id).await?;
        self.update_seeds(|config| config.remove_peer_seed(&peer_id.to_string()));
        Ok(())
    }

    pub async fn list_conflicts(&self, include_resolved: bool) -> Result<Vec<Conflict>> {
        self.db().list_conflicts(include_resolved).await
    }

    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        choice: ResolutionChoice,
    ) -> Result<Conflict> {
        let conflict = self.db().resolve_conflict(id, choice).await?;
        tracing::info!(
            conflict_id = %id,
            status = conflict.status.as_str(),
            "Resolved conflict"
        );
        Ok(conflict)
    }

    /// Responder answering peers on behalf of this device.
    pub fn responder(&self, config: &GroveConfig) -> SyncResponder {
        SyncResponder::new(
            self.db().clone(),
            self.engine.shared_identity(),
            config.responder_options(),
        )
    }

    async fn persist_pins(&self) {
        if self.config_dir.is_none() {
            return;
        }
        match self.db().list_peers().await {
            Ok(peers) => self.update_seeds(|config| config.record_pinned_fingerprints(&peers)),
            Err(error) => {
                tracing::warn!(error = %error, "Failed to read peers for config write-back");
            }
        }
    }

    /// Reload `config.json`, apply `edit`, and save when it reports a change.
    ///
    /// The file is re-read so environment overrides never leak into it.
    fn update_seeds(&self, edit: impl FnOnce(&mut GroveConfig) -> bool) {
        let Some(dir) = &self.config_dir else {
            return;
        };
        let path = GroveConfig::path_in(dir);
        let result = GroveConfig::load_from_path(&path).and_then(|mut config| {
            if edit(&mut config) {
                config.save_to_path(&path)?;
            }
            Ok(())
        });
        if let Err(error) = result {
            tracing::warn!(path = %path.display(), error = %error, "Failed to update peer seeds");
        }
    }
}
