//! Trust-on-first-use verification of peer certificates

use libsql::Connection;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::Peer;
use crate::peers::PeerRegistry;

use super::Fingerprint;

/// How a peer's certificate was accepted for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustDecision {
    /// First contact: the presented fingerprint is now pinned
    Pinned,
    /// Presented fingerprint matched the pin
    Verified,
    /// Plain HTTP peer, no certificate involved
    Plaintext,
}

/// Compare a presented fingerprint against an optional pin.
///
/// Used inside the TLS handshake, before any protocol bytes are read.
pub fn check_pinned(
    peer_id: &str,
    pinned: Option<&Fingerprint>,
    presented: &Fingerprint,
) -> Result<()> {
    match pinned {
        Some(expected) if expected != presented => Err(Error::TrustViolation {
            peer_id: peer_id.to_string(),
            expected: expected.to_string(),
            presented: presented.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Peer fingerprint bookkeeping backed by the peer registry.
pub struct TrustStore<'a> {
    conn: &'a Connection,
}

impl<'a> TrustStore<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Accept `presented` for `peer`, pinning it on first contact.
    ///
    /// A mismatch never touches the stored fingerprint.
    pub async fn verify_peer(&self, peer: &Peer, presented: &Fingerprint) -> Result<TrustDecision> {
        let peer_id = peer.peer_id.to_string();
        if let Some(pinned) = &peer.certificate_fingerprint {
            return check_pinned(&peer_id, Some(pinned), presented).map(|()| TrustDecision::Verified);
        }

        let registry = PeerRegistry::new(self.conn);
        if registry.pin_fingerprint(&peer.peer_id, presented).await? {
            tracing::info!(peer_id = %peer_id, fingerprint = %presented, "Pinned peer certificate");
            return Ok(TrustDecision::Pinned);
        }

        // Pinned by a concurrent session since `peer` was loaded.
        let current = registry
            .get(&peer.peer_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("peer {peer_id}")))?;
        check_pinned(&peer_id, current.certificate_fingerprint.as_ref(), presented)
            .map(|()| TrustDecision::Verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::PeerRegistration;

    async fn registered_peer(db: &Database) -> Peer {
        PeerRegistry::new(db.connection())
            .register(
                PeerRegistration {
                    peer_id: crate::models::DeviceId::new().to_string(),
                    peer_name: "Desk".into(),
                    peer_url: "https://desk.local:8384".into(),
                    certificate_fingerprint: None,
                },
                None,
            )
            .await
            .unwrap()
    }

    #[test]
    fn check_pinned_accepts_unpinned_and_matching() {
        let fingerprint = Fingerprint::of_der(b"cert-a");
        assert!(check_pinned("p", None, &fingerprint).is_ok());
        assert!(check_pinned("p", Some(&fingerprint), &fingerprint).is_ok());
    }

    #[test]
    fn check_pinned_rejects_mismatch() {
        let pinned = Fingerprint::of_der(b"cert-a");
        let presented = Fingerprint::of_der(b"cert-b");
        let error = check_pinned("p", Some(&pinned), &presented).unwrap_err();
        assert!(matches!(error, Error::TrustViolation { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_contact_pins_then_enforces() {
        let db = Database::open_in_memory().await.unwrap();
        let peer = registered_peer(&db).await;
        let trust = TrustStore::new(db.connection());
        let registry = PeerRegistry::new(db.connection());

        let first = Fingerprint::of_der(b"cert-a");
        assert_eq!(trust.verify_peer(&peer, &first).await.unwrap(), TrustDecision::Pinned);

        let pinned_peer = registry.get(&peer.peer_id).await.unwrap().unwrap();
        assert_eq!(pinned_peer.certificate_fingerprint.as_ref(), Some(&first));
        assert_eq!(
            trust.verify_peer(&pinned_peer, &first).await.unwrap(),
            TrustDecision::Verified
        );

        let other = Fingerprint::of_der(b"cert-b");
        let error = trust.verify_peer(&pinned_peer, &other).await.unwrap_err();
        assert!(matches!(error, Error::TrustViolation { .. }));

        let after = registry.get(&peer.peer_id).await.unwrap().unwrap();
        assert_eq!(after.certificate_fingerprint, Some(first));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_unpinned_snapshot_still_enforces_pin() {
        let db = Database::open_in_memory().await.unwrap();
        let stale = registered_peer(&db).await;
        let trust = TrustStore::new(db.connection());

        let first = Fingerprint::of_der(b"cert-a");
        trust.verify_peer(&stale, &first).await.unwrap();

        let other = Fingerprint::of_der(b"cert-b");
        assert!(matches!(
            trust.verify_peer(&stale, &other).await,
            Err(Error::TrustViolation { .. })
        ));
    }
}
