//! WebSocket Transport Tests
//!
//! Drives the `/realtime/ws` protocol over a real socket:
//! - The first frame must authenticate
//! - Subscribe, publish over HTTP, receive the event
//! - Resume replays the missed tail, paced by the socket
//! - Forbidden subscribes are reported without closing the socket

use std::sync::Arc;
use std::time::Duration as StdDuration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use slackline::auth::{InMemoryMembership, JwtConfig, JwtIdentityProvider, JwtManager};
use slackline::http_server::{HttpServer, HttpServerConfig};
use slackline::observability::MetricsRegistry;
use slackline::realtime::{
    Collaborators, EntityType, EventKind, HubConfig, RealtimeHub, TopicKey,
};
use slackline::store::InMemoryRecordStore;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Test Utilities
// =============================================================================

struct Server {
    addr: String,
    hub: Arc<RealtimeHub>,
    jwt: JwtManager,
    membership: Arc<InMemoryMembership>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_server() -> Server {
    let jwt = JwtManager::new(JwtConfig::default());
    let membership = Arc::new(InMemoryMembership::new());
    let hub = RealtimeHub::open(
        HubConfig::default(),
        Collaborators {
            identity: Arc::new(JwtIdentityProvider::new(jwt.clone())),
            membership: membership.clone(),
            records: Arc::new(InMemoryRecordStore::new()),
        },
        Arc::new(MetricsRegistry::new()),
    )
    .await
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let server = HttpServer::with_hub(HttpServerConfig::default(), Arc::clone(&hub));
    tokio::spawn(async move {
        let _ = server
            .serve(listener, async {
                let _ = rx.await;
            })
            .await;
    });

    Server {
        addr,
        hub,
        jwt,
        membership,
        shutdown: Some(tx),
    }
}

async fn open_socket(server: &Server) -> Client {
    let url = format!("ws://{}/realtime/ws", server.addr);
    let (socket, _) = connect_async(url).await.unwrap();
    socket
}

async fn send(client: &mut Client, message: Value) {
    client
        .send(Message::Text(message.to_string()))
        .await
        .unwrap();
}

/// Next JSON frame from the server
async fn recv(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(StdDuration::from_secs(2), client.next())
            .await
            .expect("frame within timeout")
            .expect("socket open")
            .unwrap();
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(frame) => panic!("closed: {:?}", frame),
            _ => continue,
        }
    }
}

async fn authenticated(server: &Server, user: Uuid) -> Client {
    let mut client = open_socket(server).await;
    let token = server.jwt.generate_token(user).unwrap();
    send(&mut client, json!({"type": "auth", "token": token})).await;

    let connected = recv(&mut client).await;
    assert_eq!(connected["type"], "connected");
    assert_eq!(connected["user_id"], user.to_string());
    client
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_bad_token_is_refused_and_closed() {
    let server = start_server().await;
    let mut client = open_socket(&server).await;
    send(&mut client, json!({"type": "auth", "token": "garbage"})).await;

    let error = recv(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "UNAUTHENTICATED");

    let closing = tokio::time::timeout(StdDuration::from_secs(2), client.next())
        .await
        .expect("close within timeout");
    match closing {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 4004),
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_commands_before_auth_are_rejected() {
    let server = start_server().await;
    let mut client = open_socket(&server).await;
    send(&mut client, json!({"type": "heartbeat"})).await;

    let error = recv(&mut client).await;
    assert_eq!(error["code"], "UNAUTHENTICATED");
}

// =============================================================================
// Live delivery
// =============================================================================

#[tokio::test]
async fn test_subscribe_then_receive_published_event() {
    let server = start_server().await;
    let user = Uuid::new_v4();
    let topic = TopicKey::Channel(Uuid::new_v4());
    server.membership.grant(user, &topic);

    let mut client = authenticated(&server, user).await;
    send(
        &mut client,
        json!({"type": "subscribe", "topic": topic.to_string()}),
    )
    .await;
    let subscribed = recv(&mut client).await;
    assert_eq!(subscribed["type"], "subscribed");
    assert_eq!(subscribed["cursor"], 0);

    server
        .hub
        .publish(
            &topic,
            EventKind::Created,
            EntityType::Message,
            json!({"content": "hello"}),
        )
        .await
        .unwrap();

    let event = recv(&mut client).await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"]["sequence"], 1);
    assert_eq!(event["event"]["topic"], topic.to_string());
    assert_eq!(event["event"]["payload"]["content"], "hello");
}

#[tokio::test]
async fn test_forbidden_subscribe_keeps_socket_open() {
    let server = start_server().await;
    let user = Uuid::new_v4();
    let topic = TopicKey::Channel(Uuid::new_v4());

    let mut client = authenticated(&server, user).await;
    send(
        &mut client,
        json!({"type": "subscribe", "topic": topic.to_string()}),
    )
    .await;
    let error = recv(&mut client).await;
    assert_eq!(error["code"], "FORBIDDEN");

    send(&mut client, json!({"type": "heartbeat"})).await;
    let heartbeat = recv(&mut client).await;
    assert_eq!(heartbeat["type"], "heartbeat");
}

#[tokio::test]
async fn test_resume_replays_missed_events() {
    let server = start_server().await;
    let user = Uuid::new_v4();
    let topic = TopicKey::Conversation(Uuid::new_v4());
    server.membership.grant(user, &topic);

    for n in 1..=4 {
        server
            .hub
            .publish(
                &topic,
                EventKind::Created,
                EntityType::Message,
                json!({"n": n}),
            )
            .await
            .unwrap();
    }

    let mut client = authenticated(&server, user).await;
    send(
        &mut client,
        json!({"type": "resume", "topic": topic.to_string(), "cursor": 2}),
    )
    .await;

    // Replayed events may be flushed before the acknowledgement
    let mut sequences = Vec::new();
    let mut acknowledged = false;
    while sequences.len() < 2 || !acknowledged {
        let frame = recv(&mut client).await;
        match frame["type"].as_str() {
            Some("event") => sequences.push(frame["event"]["sequence"].as_u64().unwrap()),
            Some("subscribed") => acknowledged = true,
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(sequences, vec![3, 4]);
}

/// A resume longer than the session's buffers is paced by the socket
/// instead of degrading the session.
#[tokio::test]
async fn test_long_resume_streams_without_resync() {
    let server = start_server().await;
    let user = Uuid::new_v4();
    let topic = TopicKey::Channel(Uuid::new_v4());
    server.membership.grant(user, &topic);

    for n in 1..=400 {
        server
            .hub
            .publish(
                &topic,
                EventKind::Created,
                EntityType::Message,
                json!({"n": n}),
            )
            .await
            .unwrap();
    }

    let mut client = authenticated(&server, user).await;
    send(
        &mut client,
        json!({"type": "resume", "topic": topic.to_string(), "cursor": 0}),
    )
    .await;

    let mut sequences = Vec::new();
    let mut acknowledged = false;
    while sequences.len() < 400 || !acknowledged {
        let frame = recv(&mut client).await;
        match frame["type"].as_str() {
            Some("event") => sequences.push(frame["event"]["sequence"].as_u64().unwrap()),
            Some("subscribed") => acknowledged = true,
            other => panic!("unexpected frame {:?}: {}", other, frame),
        }
    }
    assert_eq!(sequences, (1..=400).collect::<Vec<u64>>());

    send(&mut client, json!({"type": "heartbeat"})).await;
    assert_eq!(recv(&mut client).await["type"], "heartbeat");
}

// =============================================================================
// HTTP surface
// =============================================================================

#[tokio::test]
async fn test_publish_endpoint_requires_membership() {
    let server = start_server().await;
    let user = Uuid::new_v4();
    let topic = TopicKey::Channel(Uuid::new_v4());
    let token = server.jwt.generate_token(user).unwrap();

    let body = json!({
        "topic": topic.to_string(),
        "kind": "CREATED",
        "entity_type": "message",
        "payload": {"content": "hi"},
    });

    let status = post_json(&server.addr, "/realtime/publish", &token, &body).await;
    assert_eq!(status, 403);

    server.membership.grant(user, &topic);
    let status = post_json(&server.addr, "/realtime/publish", &token, &body).await;
    assert_eq!(status, 201);
    assert_eq!(server.hub.event_log().head(&topic), 1);
}

/// Minimal HTTP/1.1 POST returning the status code
async fn post_json(addr: &str, path: &str, token: &str, body: &Value) -> u16 {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let body = body.to_string();
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nAuthorization: Bearer {}\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        addr,
        token,
        body.len(),
        body
    );

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap()
}
