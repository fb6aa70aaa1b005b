//! Sync wire protocol
//!
//! JSON over HTTPS. The initiator side is abstracted behind [`PeerTransport`]
//! so rounds can run against a real server or an in-process responder.

mod http;
pub mod loopback;
mod responder;
mod server;
mod tls;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::Fingerprint;
use crate::merge::OutcomeCounts;
use crate::models::{ChangeRecord, DeviceId, EntityType, Peer, RecordResult};

pub use http::{HttpSession, HttpTransport, TransportOptions};
pub use responder::{ResponderOptions, SyncResponder};
pub use server::{serve, spawn_server, sync_router, RunningServer, ServerOptions};
pub use tls::{client_config, server_config, PinnedCertVerifier};

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: &str = "1.0";

/// Header identifying the calling device on every request
pub const DEVICE_ID_HEADER: &str = "X-Grove-Device-Id";

pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const MAX_PAGE_SIZE: usize = 10_000;

/// Peers interoperate when their major protocol versions match.
pub fn is_compatible(version: &str) -> bool {
    fn major(version: &str) -> Option<&str> {
        version.trim().split('.').next().filter(|m| !m.is_empty())
    }
    major(version).is_some_and(|theirs| Some(theirs) == major(PROTOCOL_VERSION))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub device_id: DeviceId,
    pub device_name: String,
    pub protocol_version: String,
    pub accepting: bool,
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub device_id: DeviceId,
    pub device_name: String,
    pub protocol_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub device_id: DeviceId,
    pub device_name: String,
    pub protocol_version: String,
    pub server_time: i64,
}

/// Query string of `GET /sync/changes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesQuery {
    #[serde(default)]
    pub since: i64,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesPage {
    pub entity_type: EntityType,
    pub since: i64,
    pub next_since: i64,
    pub is_complete: bool,
    pub changes: Vec<ChangeRecord>,
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub device_id: DeviceId,
    pub device_name: String,
    /// The pair's last sync watermark as the initiator knows it
    #[serde(default)]
    pub base_watermark: Option<i64>,
    pub changes: Vec<ChangeRecord>,
    /// Set on the last batch of a round: the initiator's round start, which
    /// becomes the responder's watermark for this pair
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_started_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub results: Vec<RecordResult>,
    #[serde(flatten)]
    pub counts: OutcomeCounts,
}

impl ApplyResponse {
    pub fn from_results(results: Vec<RecordResult>) -> Self {
        Self {
            counts: OutcomeCounts::tally(&results),
            results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSnapshot {
    pub device_id: DeviceId,
    pub device_name: String,
    pub server_time: i64,
    pub changes: Vec<ChangeRecord>,
}

/// Opens sessions to registered peers.
#[allow(async_fn_in_trait)]
pub trait PeerTransport {
    type Session: PeerSession;

    async fn open(&self, peer: &Peer) -> Result<Self::Session>;
}

/// One connection's worth of protocol verbs against a single peer.
#[allow(async_fn_in_trait)]
pub trait PeerSession {
    /// Certificate fingerprint seen during the TLS handshake, `None` over plain HTTP
    fn presented_fingerprint(&self) -> Option<Fingerprint>;

    async fn status(&self) -> Result<StatusResponse>;

    async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse>;

    async fn changes(
        &self,
        entity_type: EntityType,
        since: i64,
        limit: usize,
    ) -> Result<ChangesPage>;

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyResponse>;

    async fn full(&self) -> Result<FullSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn compatible_when_major_matches() {
        assert!(is_compatible("1.0"));
        assert!(is_compatible("1.7"));
        assert!(!is_compatible("2.0"));
        assert!(!is_compatible(""));
    }

    #[test]
    fn apply_response_flattens_counts() {
        let response = ApplyResponse::from_results(Vec::new());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["applied"], 0);
        assert_eq!(value["conflicts"], 0);
        assert!(value["results"].as_array().unwrap().is_empty());
    }

    #[test]
    fn changes_query_defaults_since() {
        let query: ChangesQuery =
            serde_json::from_value(serde_json::json!({"entity_type": "tag"})).unwrap();
        assert_eq!(query.since, 0);
        assert_eq!(query.entity_type, EntityType::Tag);
        assert_eq!(query.limit, None);
    }
}
