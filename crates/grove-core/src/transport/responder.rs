//! Responder side of the sync protocol, independent of HTTP.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::identity::DeviceIdentity;
use crate::merge::MergeContext;
use crate::models::DeviceId;
use crate::services::DatabaseService;
use crate::util::now_millis;

use super::{
    is_compatible, ApplyRequest, ApplyResponse, ChangesPage, ChangesQuery, FullSnapshot,
    HandshakeRequest, HandshakeResponse, StatusResponse, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
    PROTOCOL_VERSION,
};

/// Admission policy for incoming sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponderOptions {
    /// When false, only `status` answers
    pub accepting: bool,
    /// Page size used when a `changes` request names none
    pub page_size: usize,
    /// Refuse devices that are not in the peer registry
    pub require_known_peers: bool,
}

impl Default for ResponderOptions {
    fn default() -> Self {
        Self {
            accepting: true,
            page_size: DEFAULT_PAGE_SIZE,
            require_known_peers: false,
        }
    }
}

/// Answers protocol verbs from the local ledger and merge engine.
#[derive(Clone)]
pub struct SyncResponder {
    db: DatabaseService,
    identity: Arc<DeviceIdentity>,
    options: ResponderOptions,
}

impl SyncResponder {
    pub const fn new(
        db: DatabaseService,
        identity: Arc<DeviceIdentity>,
        options: ResponderOptions,
    ) -> Self {
        Self {
            db,
            identity,
            options,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub const fn database(&self) -> &DatabaseService {
        &self.db
    }

    pub const fn options(&self) -> &ResponderOptions {
        &self.options
    }

    /// Liveness and version report; never mutates state.
    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            status: "ok".to_string(),
            device_id: self.identity.device_id(),
            device_name: self.identity.device_name().to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            accepting: self.options.accepting,
            server_time: now_millis(),
        }
    }

    pub async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse> {
        if !is_compatible(&request.protocol_version) {
            return Err(Error::Protocol(format!(
                "incompatible protocol version {} (this device speaks {PROTOCOL_VERSION})",
                request.protocol_version
            )));
        }
        self.admit(&request.device_id).await?;

        tracing::info!(
            device_id = %request.device_id,
            device_name = %request.device_name,
            "Accepted sync handshake"
        );
        Ok(HandshakeResponse {
            device_id: self.identity.device_id(),
            device_name: self.identity.device_name().to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            server_time: now_millis(),
        })
    }

    pub async fn changes(&self, caller: &DeviceId, query: &ChangesQuery) -> Result<ChangesPage> {
        self.admit(caller).await?;
        let limit = query
            .limit
            .unwrap_or(self.options.page_size)
            .clamp(1, MAX_PAGE_SIZE);

        let page = self
            .db
            .changes_page(query.entity_type, query.since, limit, self.identity.device_id())
            .await?;
        tracing::debug!(
            caller = %caller,
            entity_type = %query.entity_type,
            since = query.since,
            count = page.records.len(),
            "Served change page"
        );
        Ok(ChangesPage {
            entity_type: query.entity_type,
            since: query.since,
            next_since: page.next_since,
            is_complete: page.is_complete,
            changes: page.records,
            device_id: self.identity.device_id(),
        })
    }

    pub async fn apply(&self, request: ApplyRequest) -> Result<ApplyResponse> {
        self.admit(&request.device_id).await?;
        let caller = request.device_id;
        let context = MergeContext {
            watermark: request.base_watermark,
            remote_device_id: Some(caller),
            remote_device_name: Some(request.device_name.clone()),
        };
        let results = self
            .db
            .apply_batch_detached(request.changes, context)
            .await?;

        // The closing batch: both sides now hold everything changed before the
        // round started.
        if let Some(round_started_at) = request.round_started_at {
            let advanced = self
                .db
                .record_inbound_round(&caller, &request.device_name, round_started_at)
                .await?;
            tracing::debug!(
                caller = %caller,
                round_started_at,
                advanced,
                "Recorded completed round"
            );
        }
        Ok(ApplyResponse::from_results(results))
    }

    pub async fn full(&self, caller: &DeviceId) -> Result<FullSnapshot> {
        self.admit(caller).await?;
        let changes = self
            .db
            .outgoing_changes(None, self.identity.device_id())
            .await?;
        tracing::info!(caller = %caller, count = changes.len(), "Served full snapshot");
        Ok(FullSnapshot {
            device_id: self.identity.device_id(),
            device_name: self.identity.device_name().to_string(),
            server_time: now_millis(),
            changes,
        })
    }

    async fn admit(&self, caller: &DeviceId) -> Result<()> {
        if !self.options.accepting {
            return Err(Error::Transport(
                "this device is not accepting sync connections".to_string(),
            ));
        }
        if *caller == self.identity.device_id() {
            return Err(Error::Refused(format!(
                "device id {caller} belongs to this device"
            )));
        }
        if self.options.require_known_peers && self.db.get_peer(caller).await?.is_none() {
            tracing::warn!(caller = %caller, "Refused sync from unregistered device");
            return Err(Error::Refused(format!("device {caller} is not a registered peer")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApplyOutcome, ChangeRecord, EntitySnapshot, EntityType, Note, PeerRegistration};
    use pretty_assertions::assert_eq;

    async fn responder(options: ResponderOptions) -> SyncResponder {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let identity = Arc::new(DeviceIdentity::ephemeral("responder").unwrap());
        SyncResponder::new(db, identity, options)
    }

    fn hello(device_id: DeviceId, version: &str) -> HandshakeRequest {
        HandshakeRequest {
            device_id,
            device_name: "caller".into(),
            protocol_version: version.into(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_reports_accepting_flag() {
        let closed = responder(ResponderOptions {
            accepting: false,
            ..ResponderOptions::default()
        })
        .await;
        let status = closed.status();
        assert!(!status.accepting);
        assert_eq!(status.protocol_version, PROTOCOL_VERSION);
        assert_eq!(status.device_id, closed.identity().device_id());

        let result = closed.handshake(&hello(DeviceId::new(), "1.0")).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handshake_checks_version_and_identity() {
        let responder = responder(ResponderOptions::default()).await;

        let ok = responder.handshake(&hello(DeviceId::new(), "1.3")).await.unwrap();
        assert_eq!(ok.device_id, responder.identity().device_id());

        let old = responder.handshake(&hello(DeviceId::new(), "2.0")).await;
        assert!(matches!(old, Err(Error::Protocol(_))));

        let own = responder.identity().device_id();
        let spoofed = responder.handshake(&hello(own, "1.0")).await;
        assert!(matches!(spoofed, Err(Error::Refused(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_peers_refused_when_required() {
        let responder = responder(ResponderOptions {
            require_known_peers: true,
            ..ResponderOptions::default()
        })
        .await;
        let stranger = DeviceId::new();
        assert!(matches!(
            responder.full(&stranger).await,
            Err(Error::Refused(_))
        ));

        responder
            .db
            .register_peer(
                PeerRegistration {
                    peer_id: stranger.to_string(),
                    peer_name: "Friend".into(),
                    peer_url: "https://friend.local:8384".into(),
                    certificate_fingerprint: None,
                },
                None,
            )
            .await
            .unwrap();
        assert!(responder.full(&stranger).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn changes_clamp_limit_and_stamp_origin() {
        let responder = responder(ResponderOptions::default()).await;
        responder.db.create_note("one").await.unwrap();
        responder.db.create_note("two").await.unwrap();

        let page = responder
            .changes(
                &DeviceId::new(),
                &ChangesQuery {
                    since: 0,
                    entity_type: EntityType::Note,
                    limit: Some(0),
                },
            )
            .await
            .unwrap();
        assert!(!page.changes.is_empty());
        assert!(page
            .changes
            .iter()
            .all(|c| c.origin_device == Some(responder.identity().device_id())));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_reports_outcomes() {
        let responder = responder(ResponderOptions::default()).await;
        let note = Note::new("pushed").unwrap();
        let request = ApplyRequest {
            device_id: DeviceId::new(),
            device_name: "caller".into(),
            base_watermark: None,
            changes: vec![ChangeRecord::new(EntitySnapshot::Note(note.clone()), None)],
            round_started_at: None,
        };

        let response = responder.apply(request).await.unwrap();
        assert_eq!(response.counts.applied, 1);
        assert_eq!(response.results[0].outcome, ApplyOutcome::Applied);
        assert_eq!(
            responder.db.get_note(&note.id).await.unwrap().map(|n| n.content),
            Some("pushed".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closing_apply_records_round_for_caller() {
        let responder = responder(ResponderOptions::default()).await;
        let caller = DeviceId::new();
        let closing = |round_started_at| ApplyRequest {
            device_id: caller,
            device_name: "caller".into(),
            base_watermark: None,
            changes: Vec::new(),
            round_started_at: Some(round_started_at),
        };
        let registration = PeerRegistration {
            peer_id: caller.to_string(),
            peer_name: "Caller".into(),
            peer_url: "http://caller.local:8384".into(),
            certificate_fingerprint: None,
        };

        // Before registration the round is remembered, then seeds the watermark.
        responder.apply(closing(1_000)).await.unwrap();
        assert!(responder.db.get_peer(&caller).await.unwrap().is_none());
        let peer = responder
            .db
            .register_peer(registration, None)
            .await
            .unwrap();
        assert_eq!(peer.last_sync_at, Some(1_000));

        responder.apply(closing(2_000)).await.unwrap();
        let peer = responder.db.get_peer(&caller).await.unwrap().unwrap();
        assert_eq!(peer.last_sync_at, Some(2_000));

        // Never moves back.
        responder.apply(closing(1_500)).await.unwrap();
        let peer = responder.db.get_peer(&caller).await.unwrap().unwrap();
        assert_eq!(peer.last_sync_at, Some(2_000));

        // Batches that do not close a round leave it alone.
        let mut open = closing(9_000);
        open.round_started_at = None;
        responder.apply(open).await.unwrap();
        let peer = responder.db.get_peer(&caller).await.unwrap().unwrap();
        assert_eq!(peer.last_sync_at, Some(2_000));
    }
}
