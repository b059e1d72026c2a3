use std::{future::Future, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{future, SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{
    handler::ConnectionHandler,
    relay::{ConnectionSnapshot, Relay},
};

const WRITER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_connections: usize,
    connections: Vec<ConnectionSnapshot>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let connections = state.relay.snapshot();
    Json(StatsResponse {
        active_connections: connections.len(),
        connections,
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

async fn ws_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.relay, remote_addr))
}

async fn handle_socket(socket: WebSocket, relay: Relay, remote_addr: SocketAddr) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (tx, mut rx) = relay.outbound_channel();
    let handler = ConnectionHandler::open(relay, remote_addr, tx);
    let connection_id = handler.id();
    info!(connection_id = %connection_id, remote_addr = %remote_addr, "client connected");

    // Dropping the receiver when the socket refuses a write is what marks the
    // connection closed for the relay.
    let mut writer = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if ws_tx.send(Message::Text(packet.to_json())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
        debug!(connection_id = %connection_id, "writer task finished");
    });

    let inbound = ws_rx
        .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
        });

    if let Err(err) = handler.run(inbound).await {
        warn!(connection_id = %connection_id, error = %err, "connection ended with error");
    }

    // The handler and the registry held the only senders, so the writer drains
    // what is queued and then completes the close handshake.
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        debug!(connection_id = %connection_id, "writer did not drain in time");
        writer.abort();
    }

    info!(connection_id = %connection_id, "client disconnected");
}
