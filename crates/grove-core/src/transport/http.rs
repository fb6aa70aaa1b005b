//! reqwest-backed initiator side of the sync protocol.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::identity::Fingerprint;
use crate::models::{DeviceId, EntityType, Peer};
use crate::util::compact_text;

use super::tls::{client_config, PinnedCertVerifier};
use super::{
    ApplyRequest, ApplyResponse, ChangesPage, ChangesQuery, FullSnapshot, HandshakeRequest,
    HandshakeResponse, PeerSession, PeerTransport, StatusResponse, DEVICE_ID_HEADER,
};

/// Per-request limits applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Opens HTTP(S) sessions to peers, pinning their certificates.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    device_id: DeviceId,
    options: TransportOptions,
}

impl HttpTransport {
    pub const fn new(device_id: DeviceId, options: TransportOptions) -> Self {
        Self { device_id, options }
    }
}

impl PeerTransport for HttpTransport {
    type Session = HttpSession;

    async fn open(&self, peer: &Peer) -> Result<HttpSession> {
        let peer_id = peer.peer_id.to_string();
        let builder = Client::builder()
            .timeout(self.options.request_timeout)
            .connect_timeout(self.options.connect_timeout);

        let (client, verifier) = if peer.uses_tls() {
            let verifier = Arc::new(PinnedCertVerifier::new(
                peer_id.clone(),
                peer.certificate_fingerprint.clone(),
            ));
            let client = builder
                .use_preconfigured_tls(client_config(verifier.clone())?)
                .build()
                .map_err(|error| Error::Transport(format!("HTTP client setup failed: {error}")))?;
            (client, Some(verifier))
        } else {
            if let Some(pinned) = &peer.certificate_fingerprint {
                return Err(Error::TrustViolation {
                    peer_id,
                    expected: pinned.to_string(),
                    presented: "none (plain HTTP)".to_string(),
                });
            }
            tracing::warn!(
                peer_id = %peer_id,
                peer_url = %peer.peer_url,
                "Syncing over plain HTTP; traffic is not encrypted"
            );
            let client = builder
                .build()
                .map_err(|error| Error::Transport(format!("HTTP client setup failed: {error}")))?;
            (client, None)
        };

        Ok(HttpSession {
            client,
            base_url: peer.peer_url.clone(),
            device_id: self.device_id,
            verifier,
        })
    }
}

/// One peer's worth of requests over a shared connection pool.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: Client,
    base_url: String,
    device_id: DeviceId,
    verifier: Option<Arc<PinnedCertVerifier>>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

fn status_error(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|parsed| parsed.error)
        .unwrap_or_else(|_| compact_text(body));
    let message = format!("{status}: {message}");
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::Protocol(message),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Error::Refused(message),
        StatusCode::NOT_FOUND => Error::NotFound(message),
        _ => Error::Transport(message),
    }
}

impl HttpSession {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header(DEVICE_ID_HEADER, self.device_id.to_string())
    }

    fn transport_error(&self, path: &str, error: &reqwest::Error) -> Error {
        if let Some(violation) = self.verifier.as_ref().and_then(|v| v.violation()) {
            return violation;
        }
        if error.is_timeout() {
            return Error::Transport(format!("{}{path} timed out", self.base_url));
        }
        Error::Transport(format!("{}{path} failed: {error}", self.base_url))
    }

    async fn send<T: DeserializeOwned>(&self, path: &str, request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|error| self.transport_error(path, &error))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|error| self.transport_error(path, &error))?;
        serde_json::from_slice(&bytes).map_err(|error| {
            tracing::warn!(
                url = %format!("{}{path}", self.base_url),
                body = %compact_text(&String::from_utf8_lossy(&bytes)),
                "Malformed sync response"
            );
            Error::Protocol(format!("malformed response from {path}: {error}"))
        })
    }
}

impl PeerSession for HttpSession {
    fn presented_fingerprint(&self) -> Option<Fingerprint> {
        self.verifier.as_ref().and_then(|verifier| verifier.presented())
    }

    async fn status(&self) -> Result<StatusResponse> {
        let path = "/sync/status";
        self.send(path, self.request(Method::GET, path)).await
    }

    async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse> {
        let path = "/sync/handshake";
        self.send(path, self.request(Method::POST, path).json(request))
            .await
    }

    async fn changes(
        &self,
        entity_type: EntityType,
        since: i64,
        limit: usize,
    ) -> Result<ChangesPage> {
        let path = "/sync/changes";
        let query = ChangesQuery {
            since,
            entity_type,
            limit: Some(limit),
        };
        self.send(path, self.request(Method::GET, path).query(&query))
            .await
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyResponse> {
        let path = "/sync/apply";
        self.send(path, self.request(Method::POST, path).json(request))
            .await
    }

    async fn full(&self) -> Result<FullSnapshot> {
        let path = "/sync/full";
        self.send(path, self.request(Method::GET, path)).await
    }
}
