//! WebSocket front of the signaling hub
//!
//! Each socket joins one room as broadcaster or viewer. Inbound JSON frames
//! are relayed through [`SignalingHub`], which stamps the sender id; outbound
//! frames go through a bounded buffer and are dropped when a client falls
//! behind.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use livecast_session::config::ServerConfig;
use livecast_session::{Role, RoomId, SignalEnvelope, SignalMessage, SignalingHub, ViewerId};

#[derive(Clone)]
pub struct RelayState {
    hub: SignalingHub,
    limits: Arc<ServerConfig>,
}

impl RelayState {
    pub fn new(hub: SignalingHub, server: &ServerConfig) -> Self {
        Self {
            hub,
            limits: Arc::new(server.clone()),
        }
    }
}

/// Query parameters for a signaling socket
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default = "default_role")]
    pub role: Role,
    /// Stable connection id; a random one is assigned when absent
    pub user: Option<String>,
}

const fn default_role() -> Role {
    Role::Viewer
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/{room_id}", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<RelayState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": state.hub.room_count(),
        "connections": state.hub.connection_count(),
    }))
}

async fn websocket_handler(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let connection_id = query
        .user
        .map_or_else(|| ViewerId::new(nanoid::nanoid!()), ViewerId::new);
    let max_message_size = state.limits.max_message_size;
    ws.max_message_size(max_message_size).on_upgrade(move |socket| {
        handle_socket(socket, state, RoomId::new(room_id), query.role, connection_id)
    })
}

async fn handle_socket(
    socket: WebSocket,
    state: RelayState,
    room_id: RoomId,
    role: Role,
    connection_id: ViewerId,
) {
    let (mut sink, mut stream) = socket.split();

    let mut inbound = match state.hub.subscribe(room_id.clone(), role, connection_id.clone()) {
        Ok(rx) => rx,
        Err(e) => {
            warn!(room_id = %room_id, connection_id = %connection_id, error = %e, "Subscription refused");
            if let Some(frame) = error_frame(&e.to_string()) {
                let _ = sink.send(Message::Text(frame.into())).await;
            }
            let _ = sink.close().await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<String>(state.limits.outbound_buffer.max(1));

    // hub -> bounded buffer
    let forward_tx = tx.clone();
    let forward_id = connection_id.clone();
    let forward = tokio::spawn(async move {
        while let Some(envelope) = inbound.recv().await {
            match envelope.to_json() {
                Ok(frame) => {
                    enqueue(&forward_tx, &forward_id, frame);
                }
                Err(e) => warn!(connection_id = %forward_id, error = %e, "Failed to encode frame"),
            }
        }
    });

    // bounded buffer -> socket
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    info!(room_id = %room_id, connection_id = %connection_id, role = %role, "WebSocket connection established");

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Err(e) = relay_frame(&state.hub, &connection_id, text.as_str()) {
                    warn!(connection_id = %connection_id, error = %e, "Rejected inbound frame");
                    if let Some(frame) = error_frame(&e.to_string()) {
                        enqueue(&tx, &connection_id, frame);
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    state.hub.unsubscribe(&connection_id);
    forward.abort();
    writer.abort();
    info!(room_id = %room_id, connection_id = %connection_id, "WebSocket connection closed");
}

/// Decode a client frame and route it through the hub
fn relay_frame(hub: &SignalingHub, from: &ViewerId, text: &str) -> livecast_session::Result<usize> {
    let envelope = SignalEnvelope::from_json(text)?;
    hub.relay(from, envelope.message)
}

/// Queue a frame for the client; a full buffer drops it
fn enqueue(tx: &mpsc::Sender<String>, connection_id: &ViewerId, frame: String) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(connection_id = %connection_id, "Client too slow, dropping frame");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

fn error_frame(message: &str) -> Option<String> {
    SignalEnvelope::new(SignalMessage::ServerError {
        message: message.to_string(),
    })
    .to_json()
    .ok()
}
