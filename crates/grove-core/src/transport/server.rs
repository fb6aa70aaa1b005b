//! HTTP(S) front of the sync responder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use serde::Serialize;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::models::DeviceId;

use super::tls::server_config;
use super::{
    ApplyRequest, ApplyResponse, ChangesPage, ChangesQuery, FullSnapshot, HandshakeRequest,
    HandshakeResponse, StatusResponse, SyncResponder, DEVICE_ID_HEADER,
};

/// Upper bound on request bodies; apply batches carry full note bodies.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Where and how to listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    pub bind_addr: SocketAddr,
    pub tls: bool,
}

/// Error wrapper that renders core errors as protocol responses.
#[derive(Debug)]
struct ServerError(Error);

impl From<Error> for ServerError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation { .. } | Error::Protocol(_) | Error::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Refused(_) | Error::TrustViolation { .. } => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Sync request failed: {}", self.0);
        } else {
            tracing::warn!("Sync request rejected: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn caller_id(headers: &HeaderMap) -> std::result::Result<DeviceId, ServerError> {
    let raw = headers
        .get(DEVICE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| Error::Protocol(format!("missing {DEVICE_ID_HEADER} header")))?;
    raw.parse::<DeviceId>()
        .map_err(|_| Error::Protocol(format!("invalid {DEVICE_ID_HEADER} header: {raw}")).into())
}

/// Router exposing the `/sync/*` endpoints.
pub fn sync_router(responder: SyncResponder) -> Router {
    Router::new()
        .route("/sync/status", get(status))
        .route("/sync/handshake", post(handshake))
        .route("/sync/changes", get(changes))
        .route("/sync/apply", post(apply))
        .route("/sync/full", get(full))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(responder)
}

async fn status(State(responder): State<SyncResponder>) -> Json<StatusResponse> {
    Json(responder.status())
}

async fn handshake(
    State(responder): State<SyncResponder>,
    Json(request): Json<HandshakeRequest>,
) -> std::result::Result<Json<HandshakeResponse>, ServerError> {
    Ok(Json(responder.handshake(&request).await?))
}

async fn changes(
    State(responder): State<SyncResponder>,
    headers: HeaderMap,
    Query(query): Query<ChangesQuery>,
) -> std::result::Result<Json<ChangesPage>, ServerError> {
    let caller = caller_id(&headers)?;
    Ok(Json(responder.changes(&caller, &query).await?))
}

async fn apply(
    State(responder): State<SyncResponder>,
    Json(request): Json<ApplyRequest>,
) -> std::result::Result<Json<ApplyResponse>, ServerError> {
    Ok(Json(responder.apply(request).await?))
}

async fn full(
    State(responder): State<SyncResponder>,
    headers: HeaderMap,
) -> std::result::Result<Json<FullSnapshot>, ServerError> {
    let caller = caller_id(&headers)?;
    Ok(Json(responder.full(&caller).await?))
}

/// A server running on a background task.
pub struct RunningServer {
    local_addr: SocketAddr,
    tls: bool,
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL peers on this machine can use to reach the server.
    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        if self.local_addr.ip().is_unspecified() {
            format!("{scheme}://localhost:{}", self.local_addr.port())
        } else {
            format!("{scheme}://{}", self.local_addr)
        }
    }

    /// Stop accepting connections and let in-flight requests finish.
    pub fn shutdown(&self) {
        self.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    }

    /// Wait for the server task to exit.
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|error| Error::Transport(format!("server task failed: {error}")))??;
        Ok(())
    }
}

/// Bind and start serving in the background; returns once the socket is bound.
pub async fn spawn_server(responder: SyncResponder, options: ServerOptions) -> Result<RunningServer> {
    let handle = Handle::new();
    let app = sync_router(responder.clone()).into_make_service();

    let task = if options.tls {
        let config = RustlsConfig::from_config(Arc::new(server_config(responder.identity())?));
        let server = axum_server::bind_rustls(options.bind_addr, config).handle(handle.clone());
        tokio::spawn(async move { server.serve(app).await })
    } else {
        tracing::warn!("Serving sync over plain HTTP");
        let server = axum_server::bind(options.bind_addr).handle(handle.clone());
        tokio::spawn(async move { server.serve(app).await })
    };

    let Some(local_addr) = handle.listening().await else {
        return match task.await {
            Ok(Err(error)) => Err(Error::Transport(format!(
                "failed to bind {}: {error}",
                options.bind_addr
            ))),
            _ => Err(Error::Transport(format!(
                "failed to bind {}",
                options.bind_addr
            ))),
        };
    };

    tracing::info!(
        addr = %local_addr,
        tls = options.tls,
        device_id = %responder.identity().device_id(),
        fingerprint = %responder.identity().fingerprint(),
        "Sync server listening"
    );
    Ok(RunningServer {
        local_addr,
        tls: options.tls,
        handle,
        task,
    })
}

/// Serve until the process is interrupted.
pub async fn serve(responder: SyncResponder, options: ServerOptions) -> Result<()> {
    let server = spawn_server(responder, options).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down sync server");
    server.shutdown();
    server.wait().await
}
