//! HTTP and WebSocket surface of the collaboration server.
//!
//! Each WebSocket connection gets its own outbound queue drained by a send
//! task; a receive task decodes client frames and drives the [`SyncServer`].
//! Binary frames use the framed bincode codec, text frames carry JSON.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::sync::protocol::{
    ClientMessage, ErrorCode, ProtocolError, ServerMessage, SyncProtocol, MAX_MESSAGE_SIZE,
    PROTOCOL_VERSION,
};
use crate::sync::{SyncError, SyncServer};

/// How long a closing connection may take to flush its queue
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// OT synchronization server
    pub sync_server: Arc<SyncServer>,
    /// Server start time
    started_at: Instant,
}

impl AppState {
    pub fn new(sync_server: Arc<SyncServer>) -> Self {
        Self {
            sync_server,
            started_at: Instant::now(),
        }
    }
}

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/channels", get(list_channels))
        .route("/api/channels/:channel_id", get(get_channel))
        .route("/ws/:channel_id", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub protocol_version: u8,
    pub uptime_seconds: u64,
    pub active_channels: usize,
    pub active_peers: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelSummary {
    pub channel_id: String,
    pub revision: u64,
    pub document_chars: u64,
    pub peer_count: usize,
    /// Whether the channel is currently loaded in memory
    pub live: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelListResponse {
    pub channels: Vec<ChannelSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PeerSummary {
    pub peer_id: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelDetailResponse {
    pub channel_id: String,
    pub revision: u64,
    pub document_chars: u64,
    pub peers: Vec<PeerSummary>,
}

/// Outbound frame encoding for a WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Binary,
    Json,
}

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    format: WireFormat,
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sync_server.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_channels: stats.active_channels,
        active_peers: stats.active_peers,
    })
}

/// List persisted and live channels
async fn list_channels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut channels: BTreeMap<String, ChannelSummary> = BTreeMap::new();

    match state.sync_server.storage().list_channels() {
        Ok(persisted) => {
            for meta in persisted {
                channels.insert(
                    meta.channel_id.clone(),
                    ChannelSummary {
                        channel_id: meta.channel_id,
                        revision: meta.revision,
                        document_chars: meta.document_chars,
                        peer_count: 0,
                        live: false,
                    },
                );
            }
        }
        Err(e) => {
            error!("Failed to list persisted channels: {}", e);
        }
    }

    // Live state is always at least as recent as the last snapshot
    for info in state.sync_server.list_channels() {
        channels.insert(
            info.channel_id.clone(),
            ChannelSummary {
                channel_id: info.channel_id,
                revision: info.revision,
                document_chars: info.document_chars as u64,
                peer_count: info.peers.len(),
                live: true,
            },
        );
    }

    let channels: Vec<ChannelSummary> = channels.into_values().collect();
    let total = channels.len();
    Json(ChannelListResponse { channels, total })
}

/// Get channel details
async fn get_channel(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Result<Json<ChannelDetailResponse>, StatusCode> {
    if let Some(info) = state.sync_server.channel_info(&channel_id) {
        let peers = info
            .peers
            .into_iter()
            .map(|peer_id| {
                let name = state
                    .sync_server
                    .get_peer(&peer_id)
                    .map(|p| p.read().name.clone())
                    .unwrap_or_default();
                PeerSummary { peer_id, name }
            })
            .collect();

        return Ok(Json(ChannelDetailResponse {
            channel_id: info.channel_id,
            revision: info.revision,
            document_chars: info.document_chars as u64,
            peers,
        }));
    }

    let meta = state
        .sync_server
        .storage()
        .get_metadata(&channel_id)
        .map_err(|e| {
            error!("Failed to read channel {}: {}", channel_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(ChannelDetailResponse {
        channel_id: meta.channel_id,
        revision: meta.revision,
        document_chars: meta.document_chars,
        peers: Vec::new(),
    }))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(channel_id): Path<String>,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket upgrade request for channel: {}", channel_id);
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_websocket(socket, channel_id, params.format, state))
}

/// Handle WebSocket connection
async fn handle_websocket(
    socket: WebSocket,
    channel_id: String,
    format: WireFormat,
    state: Arc<AppState>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let peer_id = uuid::Uuid::new_v4().to_string();

    info!(
        "New WebSocket connection: peer={}, channel={}, format={:?}",
        peer_id, channel_id, format
    );

    // Create channel for sending messages to this peer
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    if let Err(e) = state
        .sync_server
        .register_peer(&peer_id, "Anonymous", tx.clone())
    {
        error!("Failed to register peer: {}", e);
        return;
    }

    // Welcome is queued before the join so it always precedes Init
    let _ = tx.send(ServerMessage::Welcome {
        protocol_version: PROTOCOL_VERSION,
        peer_id: peer_id.clone(),
        server_time: chrono::Utc::now().timestamp(),
    });

    if let Err(e) = state.sync_server.join_channel(&peer_id, &channel_id) {
        warn!("Peer {} could not join {}: {}", peer_id, channel_id, e);
        send_error(&tx, &e, Some(channel_id.clone()));
    }

    let peer_id_send = peer_id.clone();

    // Task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, ServerMessage::Goodbye { .. });
            match encode_message(&msg, format) {
                Ok(frame) => {
                    if ws_sender.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
            if closing {
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("Send task ended for peer {}", peer_id_send);
    });

    let peer_id_recv = peer_id.clone();
    let state_recv = state.clone();

    // Task to handle incoming WebSocket messages
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            // Any frame, heartbeats included, keeps the session alive
            state_recv.sync_server.touch_peer(&peer_id_recv);

            let decoded = match msg {
                Message::Binary(data) => SyncProtocol::decode_client(&data),
                Message::Text(text) => SyncProtocol::decode_client_json(&text),
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", peer_id_recv);
                    break;
                }
                // Ping/Pong frames are answered by axum
                _ => continue,
            };

            let flow = match decoded {
                Ok(client_msg) => handle_client_message(client_msg, &peer_id_recv, &state_recv, &tx),
                Err(e) => {
                    warn!("Failed to decode message from {}: {}", peer_id_recv, e);
                    let _ = tx.send(protocol_error_response(&e));
                    ControlFlow::Continue(())
                }
            };

            if flow.is_break() {
                break;
            }
        }
        debug!("Receive task ended for peer {}", peer_id_recv);
    });

    // Wait for either task to complete
    let recv_finished = tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            false
        }
        _ = &mut recv_task => true,
    };

    // Cleanup
    state.sync_server.unregister_peer(&peer_id);

    // Unregistering drops the last queue senders; let the send task flush
    if recv_finished && tokio::time::timeout(FLUSH_TIMEOUT, send_task).await.is_err() {
        debug!("Timed out flushing messages for peer {}", peer_id);
    }

    info!("Peer {} disconnected from channel {}", peer_id, channel_id);
}

/// Handle a decoded client message
fn handle_client_message(
    msg: ClientMessage,
    peer_id: &str,
    state: &Arc<AppState>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> ControlFlow<()> {
    let server = &state.sync_server;

    match msg {
        ClientMessage::Hello { client_name } => {
            if let Err(e) = server.rename_peer(peer_id, &client_name) {
                send_error(tx, &e, None);
            }
            debug!("Hello from peer {}: {}", peer_id, client_name);
        }

        ClientMessage::JoinChannel { channel_id } => {
            // Init is queued by the server on success
            if let Err(e) = server.join_channel(peer_id, &channel_id) {
                send_error(tx, &e, Some(channel_id));
            }
        }

        ClientMessage::LeaveChannel { channel_id } => match server.leave_channel(peer_id, &channel_id) {
            Ok(()) => {
                let _ = tx.send(ServerMessage::ChannelLeft { channel_id });
            }
            Err(e) => send_error(tx, &e, Some(channel_id)),
        },

        ClientMessage::Operation {
            channel_id,
            base_revision,
            operation,
        } => match server.submit_operation(peer_id, &channel_id, base_revision, operation) {
            Ok(_) => {}
            // The server already queued a Resync for the sender
            Err(e) if e.requires_resync() => {}
            Err(e) => {
                warn!("Operation from {} rejected: {}", peer_id, e);
                send_error(tx, &e, Some(channel_id));
            }
        },

        ClientMessage::ResyncRequest { channel_id } => {
            if let Err(e) = server.resync_peer(peer_id, &channel_id) {
                send_error(tx, &e, Some(channel_id));
            }
        }

        ClientMessage::Ping { timestamp } => {
            let _ = tx.send(ServerMessage::Pong {
                timestamp,
                server_time: chrono::Utc::now().timestamp(),
            });
        }

        ClientMessage::Goodbye { reason } => {
            info!(
                "Peer {} saying goodbye: {:?}",
                peer_id,
                reason.clone().unwrap_or_default()
            );
            let _ = tx.send(ServerMessage::Goodbye { reason });
            return ControlFlow::Break(());
        }
    }

    ControlFlow::Continue(())
}

fn send_error(
    tx: &mpsc::UnboundedSender<ServerMessage>,
    err: &SyncError,
    channel_id: Option<String>,
) {
    let _ = tx.send(SyncProtocol::error_response(
        ErrorCode::from(err),
        err.to_string(),
        channel_id,
    ));
}

fn protocol_error_response(err: &ProtocolError) -> ServerMessage {
    let code = match err {
        ProtocolError::VersionMismatch(_, _) => ErrorCode::VersionMismatch,
        _ => ErrorCode::InvalidMessage,
    };
    SyncProtocol::error_response(code, err.to_string(), None)
}

/// Encode a server message as a WebSocket frame
fn encode_message(msg: &ServerMessage, format: WireFormat) -> Result<Message, ProtocolError> {
    match format {
        WireFormat::Binary => Ok(Message::Binary(SyncProtocol::encode_server(msg)?.to_vec())),
        WireFormat::Json => Ok(Message::Text(SyncProtocol::encode_server_json(msg)?)),
    }
}
