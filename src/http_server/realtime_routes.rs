//! Realtime HTTP Routes and WebSocket Handler
//!
//! - `GET /realtime/ws`: the session protocol
//! - `POST /realtime/publish`: write path for the hosted backend or trusted clients
//! - `GET /realtime/stats`: counters and sizes

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::config::DEFAULT_MAX_MESSAGE_BYTES;
use crate::realtime::{
    EntityType, Event, EventKind, OutboundFrame, RealtimeError, RealtimeHub, ResyncReason,
    Session, TopicKey,
};

// ==================
// Shared State
// ==================

/// Realtime state shared across handlers
#[derive(Debug, Clone)]
pub struct RealtimeState {
    pub hub: Arc<RealtimeHub>,

    /// Largest client frame accepted on the socket
    pub max_message_bytes: usize,
}

impl RealtimeState {
    pub fn new(hub: Arc<RealtimeHub>) -> Self {
        Self {
            hub,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }
}

// ==================
// Wire Protocol
// ==================

/// WebSocket message from client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first message
    Auth { token: String },

    Subscribe { topic: String },

    Unsubscribe { topic: String },

    /// Replay everything after `cursor`, then continue live
    Resume { topic: String, cursor: u64 },

    Heartbeat,

    /// Fetch a snapshot and restart the topic from its head
    Resync { topic: String },
}

/// WebSocket message to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { session_id: Uuid, user_id: Uuid },

    Subscribed { topic: TopicKey, cursor: u64 },

    Unsubscribed { topic: TopicKey },

    Event { event: Event },

    /// Discard incremental state; `topic: None` means every topic
    ResyncRequired {
        topic: Option<TopicKey>,
        reason: ResyncReason,
    },

    Snapshot {
        topic: TopicKey,
        cursor: u64,
        body: Value,
    },

    Heartbeat { server_time: i64 },

    Error { code: String, message: String },
}

impl ServerMessage {
    fn error(err: &RealtimeError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<OutboundFrame> for ServerMessage {
    fn from(frame: OutboundFrame) -> Self {
        match frame {
            OutboundFrame::Event(event) => ServerMessage::Event { event },
            OutboundFrame::ResyncRequired { topic, reason } => {
                ServerMessage::ResyncRequired { topic, reason }
            }
        }
    }
}

// ==================
// Request/Response Types
// ==================

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub kind: EventKind,
    pub entity_type: EntityType,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(err: RealtimeError) -> (StatusCode, Json<ErrorResponse>) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.code().to_string(),
        }),
    )
}

// ==================
// Realtime Routes
// ==================

/// Create realtime routes with WebSocket support
pub fn realtime_routes(state: RealtimeState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/publish", post(publish_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

async fn publish_handler(
    State(state): State<RealtimeState>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> impl IntoResponse {
    let result = async {
        let credential = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(RealtimeError::Unauthenticated)?;
        let user_id = state.hub.authenticate(credential).await?;
        let topic: TopicKey = request.topic.parse()?;
        state.hub.authorize(user_id, &topic).await?;

        state
            .hub
            .publish(&topic, request.kind, request.entity_type, request.payload)
            .await
    }
    .await;

    match result {
        Ok(event) => (StatusCode::CREATED, Json(event)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn stats_handler(State(state): State<RealtimeState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.hub.stats()))
}

// ==================
// WebSocket Handler
// ==================

type WsSender = SplitSink<WebSocket, Message>;

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<RealtimeState>,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_websocket(socket, state.hub))
}

async fn send(sender: &mut WsSender, message: &ServerMessage) -> Result<(), RealtimeError> {
    let json =
        serde_json::to_string(message).map_err(|e| RealtimeError::Internal(e.to_string()))?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| RealtimeError::TransportError(e.to_string()))
}

async fn close(sender: &mut WsSender, err: &RealtimeError) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: err.close_code(),
            reason: err.to_string().into(),
        })))
        .await;
}

/// Handle individual WebSocket connection
async fn handle_websocket(socket: WebSocket, hub: Arc<RealtimeHub>) {
    let (mut sender, mut receiver) = socket.split();

    // Nothing but `auth` is accepted until a session exists
    let session = loop {
        let Some(Ok(message)) = receiver.next().await else {
            return;
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return,
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Auth { token }) => match hub.connect(&token).await {
                Ok(session) => break session,
                Err(e) => {
                    let _ = send(&mut sender, &ServerMessage::error(&e)).await;
                    close(&mut sender, &e).await;
                    return;
                }
            },
            Ok(_) => {
                let _ = send(&mut sender, &ServerMessage::error(&RealtimeError::Unauthenticated))
                    .await;
            }
            Err(e) => {
                let err = RealtimeError::InvalidMessage(e.to_string());
                let _ = send(&mut sender, &ServerMessage::error(&err)).await;
            }
        }
    };

    let session_id = session.id();
    let connected = ServerMessage::Connected {
        session_id,
        user_id: session.user_id(),
    };
    if send(&mut sender, &connected).await.is_ok() {
        run_session(&hub, &session, &mut sender, &mut receiver).await;
    }

    if let Err(e) = hub.disconnect(session_id).await {
        tracing::debug!(session_id = %session_id, error = %e, "disconnect after close");
    }
}

/// Replies waiting for the socket writer
const REPLY_BUFFER: usize = 32;

/// Drive an authenticated session until either side goes away.
///
/// Outbound frames and command replies share one writer that keeps
/// draining while a command is handled, so a long `resume` never waits on
/// its own frames.
async fn run_session(
    hub: &RealtimeHub,
    session: &Arc<Session>,
    sender: &mut WsSender,
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
) {
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(REPLY_BUFFER);

    let writer = async move {
        let mut frames = Box::pin(session.events());
        loop {
            let message = tokio::select! {
                frame = frames.next() => match frame {
                    Some(frame) => ServerMessage::from(frame),
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };
            if let Err(e) = send(sender, &message).await {
                tracing::info!(session_id = %session.id(), error = %e, "transport failed");
                break;
            }
        }
    };

    let reader = async move {
        while let Some(incoming) = receiver.next().await {
            let text = match incoming {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::info!(session_id = %session.id(), error = %e, "transport failed");
                    break;
                }
            };

            let reply = match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => handle_client_message(hub, session, message).await,
                Err(e) => ServerMessage::error(&RealtimeError::InvalidMessage(e.to_string())),
            };
            if reply_tx.send(reply).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
}

/// Apply one client message to the session
async fn handle_client_message(
    hub: &RealtimeHub,
    session: &Session,
    message: ClientMessage,
) -> ServerMessage {
    let session_id = session.id();

    let result = match message {
        ClientMessage::Auth { .. } => Err(RealtimeError::InvalidMessage(
            "session already authenticated".to_string(),
        )),
        ClientMessage::Subscribe { topic } => match topic.parse::<TopicKey>() {
            Ok(topic) => hub
                .subscribe(session_id, &topic)
                .await
                .map(|sub| ServerMessage::Subscribed {
                    topic: sub.topic,
                    cursor: sub.cursor,
                }),
            Err(e) => Err(e),
        },
        ClientMessage::Unsubscribe { topic } => match topic.parse::<TopicKey>() {
            Ok(topic) => hub
                .unsubscribe(session_id, &topic)
                .map(|()| ServerMessage::Unsubscribed { topic }),
            Err(e) => Err(e),
        },
        ClientMessage::Resume { topic, cursor } => match topic.parse::<TopicKey>() {
            Ok(topic) => match hub.resume_from(session_id, &topic, cursor).await {
                Ok(_) => Ok(ServerMessage::Subscribed { topic, cursor }),
                // The session already carries the resync frame
                Err(e) if e.requires_resync() => Ok(ServerMessage::error(&e)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        },
        ClientMessage::Heartbeat => hub
            .heartbeat(session_id)
            .await
            .map(|()| ServerMessage::Heartbeat {
                server_time: chrono::Utc::now().timestamp_millis(),
            }),
        ClientMessage::Resync { topic } => match topic.parse::<TopicKey>() {
            Ok(topic) => hub
                .resync(session_id, &topic)
                .await
                .map(|snapshot| ServerMessage::Snapshot {
                    topic: snapshot.topic,
                    cursor: snapshot.cursor,
                    body: snapshot.body,
                }),
            Err(e) => Err(e),
        },
    };

    result.unwrap_or_else(|e| ServerMessage::error(&e))
}
