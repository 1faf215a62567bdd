//! HTTP surface of the OpAMP edge: the WebSocket upgrade endpoint and the
//! replica status document. Authentication and tracing middleware belong to
//! the outer layers; requests arriving here are already vetted.

use super::registry::ConnectionRegistry;
use super::session::{Session, SessionConfig, SessionHandle};
use crate::agent::usecase::ReportProcessor;
use crate::command::dispatcher::CommandSink;
use crate::server::identity::ServerIdentityService;
use crate::utils::time::Clock;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub const OPAMP_PATH: &str = "/api/v1/opamp";

const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub processor: Arc<dyn ReportProcessor>,
    pub identity: Arc<ServerIdentityService>,
    /// Entry point for operator commands. The REST controllers that consume
    /// it live outside this crate and mount next to these routes.
    pub command_sink: Arc<dyn CommandSink>,
    pub session_config: SessionConfig,
    pub clock: Arc<dyn Clock>,
    /// Root token; each session derives a child from it so shutdown reaches
    /// every connection.
    pub shutdown: CancellationToken,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(OPAMP_PATH, get(opamp_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

async fn opamp_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(upgrade) => upgrade.on_upgrade(move |socket| handle_socket(socket, state)),
        Err(_) => {
            // Plain GET with the protobuf content type is the HTTP-polling
            // transport, which this server does not speak.
            let is_protobuf = headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.starts_with(PROTOBUF_CONTENT_TYPE))
                .unwrap_or(false);
            if is_protobuf {
                (
                    StatusCode::NOT_IMPLEMENTED,
                    "plain HTTP transport is not supported, connect via WebSocket",
                )
                    .into_response()
            } else {
                (StatusCode::BAD_REQUEST, "WebSocket upgrade required").into_response()
            }
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    let (handle, mailbox) = SessionHandle::new(
        connection_id,
        state.session_config.out_queue_cap,
        state.shutdown.child_token(),
    );
    state.registry.register(handle.clone());
    info!(%connection_id, "agent connection established");

    Session::new(
        handle,
        state.registry.clone(),
        state.processor.clone(),
        state.session_config.clone(),
    )
    .run(socket, mailbox)
    .await;

    state.registry.remove(connection_id);
    debug!(%connection_id, "agent connection torn down");
}

#[derive(Debug, Serialize)]
struct StatusBody {
    server_id: String,
    uptime_seconds: i64,
    connections: usize,
    live_peers: usize,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let live_peers = match state.identity.peers().await {
        Ok(peers) => peers.len(),
        Err(err) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("peer listing unavailable: {err}"),
            )
                .into_response();
        }
    };
    let uptime = state
        .clock
        .now()
        .signed_duration_since(state.identity.boot_epoch());
    axum::Json(StatusBody {
        server_id: state.identity.self_id().to_string(),
        uptime_seconds: uptime.num_seconds(),
        connections: state.registry.connection_count(),
        live_peers,
    })
    .into_response()
}
