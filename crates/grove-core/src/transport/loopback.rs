//! In-process transport that hands requests straight to a [`SyncResponder`].
//!
//! Used by tests and embedders running several devices in one process. TLS is
//! simulated: an `https` peer "presents" the responder's certificate
//! fingerprint and the pin is checked exactly where a handshake would check it.

use crate::error::{Error, Result};
use crate::identity::{check_pinned, Fingerprint};
use crate::models::{DeviceId, EntityType, Peer};

use super::{
    ApplyRequest, ApplyResponse, ChangesPage, ChangesQuery, FullSnapshot, HandshakeRequest,
    HandshakeResponse, PeerSession, PeerTransport, StatusResponse, SyncResponder,
};

#[derive(Clone)]
pub struct LoopbackTransport {
    device_id: DeviceId,
    responder: SyncResponder,
    presented: Option<Fingerprint>,
}

impl LoopbackTransport {
    /// Route every peer opened by `device_id` to `responder`.
    pub const fn new(device_id: DeviceId, responder: SyncResponder) -> Self {
        Self {
            device_id,
            responder,
            presented: None,
        }
    }

    /// Present `fingerprint` instead of the responder's own certificate.
    pub fn presenting(mut self, fingerprint: Fingerprint) -> Self {
        self.presented = Some(fingerprint);
        self
    }

    fn presented_fingerprint(&self) -> Fingerprint {
        self.presented
            .clone()
            .unwrap_or_else(|| self.responder.identity().fingerprint().clone())
    }
}

impl PeerTransport for LoopbackTransport {
    type Session = LoopbackSession;

    async fn open(&self, peer: &Peer) -> Result<LoopbackSession> {
        let peer_id = peer.peer_id.to_string();
        let presented = if peer.uses_tls() {
            let presented = self.presented_fingerprint();
            check_pinned(&peer_id, peer.certificate_fingerprint.as_ref(), &presented)?;
            Some(presented)
        } else {
            if let Some(pinned) = &peer.certificate_fingerprint {
                return Err(Error::TrustViolation {
                    peer_id,
                    expected: pinned.to_string(),
                    presented: "none (plain HTTP)".to_string(),
                });
            }
            None
        };

        Ok(LoopbackSession {
            device_id: self.device_id,
            responder: self.responder.clone(),
            presented,
        })
    }
}

#[derive(Clone)]
pub struct LoopbackSession {
    device_id: DeviceId,
    responder: SyncResponder,
    presented: Option<Fingerprint>,
}

impl PeerSession for LoopbackSession {
    fn presented_fingerprint(&self) -> Option<Fingerprint> {
        self.presented.clone()
    }

    async fn status(&self) -> Result<StatusResponse> {
        Ok(self.responder.status())
    }

    async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse> {
        self.responder.handshake(request).await
    }

    async fn changes(
        &self,
        entity_type: EntityType,
        since: i64,
        limit: usize,
    ) -> Result<ChangesPage> {
        let query = ChangesQuery {
            since,
            entity_type,
            limit: Some(limit),
        };
        self.responder.changes(&self.device_id, &query).await
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyResponse> {
        self.responder.apply(request.clone()).await
    }

    async fn full(&self) -> Result<FullSnapshot> {
        self.responder.full(&self.device_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::identity::DeviceIdentity;
    use crate::services::DatabaseService;
    use crate::transport::ResponderOptions;
    use pretty_assertions::assert_eq;

    async fn responder() -> SyncResponder {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let identity = Arc::new(DeviceIdentity::ephemeral("remote").unwrap());
        SyncResponder::new(db, identity, ResponderOptions::default())
    }

    fn peer_for(responder: &SyncResponder, url: &str, pinned: Option<Fingerprint>) -> Peer {
        Peer {
            peer_id: responder.identity().device_id(),
            peer_name: "Remote".into(),
            peer_url: url.into(),
            certificate_fingerprint: pinned,
            last_sync_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn https_session_presents_responder_certificate() {
        let responder = responder().await;
        let expected = responder.identity().fingerprint().clone();
        let transport = LoopbackTransport::new(DeviceId::new(), responder.clone());

        let session = transport
            .open(&peer_for(&responder, "https://remote.local:8384", None))
            .await
            .unwrap();
        assert_eq!(session.presented_fingerprint(), Some(expected));
        assert_eq!(session.status().await.unwrap().status, "ok");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn impostor_certificate_fails_pin() {
        let responder = responder().await;
        let pinned = responder.identity().fingerprint().clone();
        let transport = LoopbackTransport::new(DeviceId::new(), responder.clone())
            .presenting(Fingerprint::of_der(b"someone else"));

        let result = transport
            .open(&peer_for(&responder, "https://remote.local:8384", Some(pinned)))
            .await;
        assert!(matches!(result, Err(Error::TrustViolation { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plain_http_presents_nothing() {
        let responder = responder().await;
        let transport = LoopbackTransport::new(DeviceId::new(), responder.clone());

        let session = transport
            .open(&peer_for(&responder, "http://remote.local:8384", None))
            .await
            .unwrap();
        assert!(session.presented_fingerprint().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn changes_are_served_for_the_calling_device() {
        let responder = responder().await;
        responder.database().create_note("remote note").await.unwrap();
        let transport = LoopbackTransport::new(DeviceId::new(), responder.clone());
        let session = transport
            .open(&peer_for(&responder, "http://remote.local:8384", None))
            .await
            .unwrap();

        let page = session.changes(EntityType::Note, 0, 10).await.unwrap();
        assert_eq!(page.changes.len(), 1);
        assert!(page.is_complete);
    }
}
