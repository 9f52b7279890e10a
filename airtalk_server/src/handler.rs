//! WebSocket and HTTP handlers for the signaling server
//!
//! One task reads frames from each connection and dispatches them against
//! the registry; a second task drains the connection's outbound queue. The
//! connection is torn down as soon as either side stops.

use crate::error::ClientRequestError;
use crate::state::{ConnectionHandle, ConnectionId, Outbound, ServerState};
use airtalk_protocol::{ClientMessage, ProtocolError};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Build the router: WebSocket signaling on `/`, status on `/health` and `/stats`
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(cors_layer(&state))
        .with_state(state)
}

fn cors_layer(state: &ServerState) -> CorsLayer {
    if state.config.any_origin() {
        return CorsLayer::new().allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin.trim()).ok())
        .collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(origins))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    active_connections: usize,
    waiting_users: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    total_connections: usize,
    waiting_users: usize,
    active_matches: usize,
    uptime: f64,
}

async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    let status = state.registry.lock().status();
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
        active_connections: status.active_connections,
        waiting_users: status.waiting_users,
    })
}

async fn stats(State(state): State<ServerState>) -> Json<StatsResponse> {
    let stats = state.registry.lock().stats();
    Json(StatsResponse {
        total_connections: stats.total_connections,
        waiting_users: stats.waiting_users,
        active_matches: stats.active_matches,
        uptime: state.started_at.elapsed().as_secs_f64(),
    })
}

async fn ws_handler(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    State(state): State<ServerState>,
) -> Response {
    let Some(ws) = ws else {
        return info_page();
    };

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if let Some(origin) = origin {
        if !state.config.origin_allowed(origin) {
            warn!(%origin, "Rejected connection from disallowed origin");
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn info_page() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        "AirTalk Signaling Server\n\
         \n\
         Endpoints:\n\
         - GET / (WebSocket upgrade) - Signaling channel\n\
         - GET /health - Connection and waiting-pool counts\n\
         - GET /stats - Connections, waiting users, matches, uptime\n\
         \n\
         Protocol:\n\
         1. Send {\"type\":\"find\",\"id\":\"...\",\"country\":\"...\"}\n\
         2. Receive {\"type\":\"searching\"} or {\"type\":\"match\",...}\n\
         3. Exchange {\"type\":\"signal\",\"data\":...} with your partner\n",
    )
        .into_response()
}

/// Result of reading one frame
#[derive(Debug)]
enum Frame {
    Request(ClientMessage),
    /// Ping or pong frame, proof of life only
    Heartbeat,
    /// Well-formed request of a type we do not know
    Ignored,
}

fn parse_request(frame: Result<Message, axum::Error>) -> Result<Frame, ClientRequestError> {
    let message = frame.map_err(|e| ClientRequestError::WebSocket(e.to_string()))?;
    match message {
        Message::Text(text) => match text.parse::<ClientMessage>() {
            Ok(request) => Ok(Frame::Request(request)),
            Err(ProtocolError::UnknownType(kind)) => {
                warn!(%kind, "Unknown message type");
                Ok(Frame::Ignored)
            }
            Err(e) => Err(e.into()),
        },
        Message::Ping(_) | Message::Pong(_) => Ok(Frame::Heartbeat),
        Message::Binary(_) => Err(ClientRequestError::UnsupportedType),
        Message::Close(_) => Err(ClientRequestError::Close),
    }
}

fn dispatch(state: &ServerState, conn: ConnectionId, request: ClientMessage) {
    let now = Instant::now();
    let mut registry = state.registry.lock();
    registry.mark_alive(conn);
    debug!(%conn, kind = request.kind(), "Request");
    match request {
        ClientMessage::Find { id, country } => {
            registry.join(conn, id, country, now);
        }
        ClientMessage::Signal { data } => {
            registry.relay(conn, data);
        }
        ClientMessage::Reconnect => {
            registry.reconnect(conn, now);
        }
        ClientMessage::Ping => registry.pong(conn, chrono::Utc::now().timestamp_millis()),
    }
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (handle, mut outbound) = ConnectionHandle::channel();
    let conn = state.registry.lock().connect(handle, Instant::now());
    info!(%conn, "New connection");

    let mut writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            let frame = match item {
                Outbound::Message(message) => Message::Text(message.to_string()),
                Outbound::Probe => Message::Ping(Vec::new()),
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = ws_tx.send(frame).await {
                debug!("Failed to send message: {e}");
                break;
            }
        }
    });

    let reader_state = state.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            match parse_request(frame) {
                Ok(Frame::Request(request)) => dispatch(&reader_state, conn, request),
                Ok(Frame::Heartbeat | Frame::Ignored) => {
                    reader_state.registry.lock().mark_alive(conn);
                }
                Err(ClientRequestError::UnsupportedType) => {
                    warn!(%conn, "Ignoring binary frame");
                }
                Err(ClientRequestError::Close) => {
                    info!(%conn, "Connection closed by client");
                    break;
                }
                Err(e) => {
                    error!(%conn, "Tearing down connection: {e}");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    state.registry.lock().disconnect(conn, Instant::now());
}
