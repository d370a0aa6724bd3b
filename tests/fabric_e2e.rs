//! End-to-end tests driving the real axum router over a loopback TCP socket
//! with a `tokio-tungstenite` client, the same shape as the teacher's
//! `services/receiver/tests/session_loop.rs` (real listener, real client,
//! no handler called directly).

use event_fabric::config::FabricConfig;
use event_fabric::AppState;
use fabric_protocol::{ClientMessage, DataAccessLevel, Frame, GetRecentEventsBody, ReplayIdBody, Role,
    StartReplayBody, SubscribeBody};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as TMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "e2e-test-secret";

#[derive(Serialize)]
struct Claims {
    sub: String,
    role: Role,
    allowed_event_types: Vec<String>,
    data_access_level: DataAccessLevel,
    rate_limit_overrides: std::collections::HashMap<String, u32>,
    exp: i64,
}

fn issue(sub: &str, role: Role, allowed: &[&str], access: DataAccessLevel) -> String {
    issue_with_exp(sub, role, allowed, access, chrono::Utc::now().timestamp() + 3600)
}

fn issue_with_exp(sub: &str, role: Role, allowed: &[&str], access: DataAccessLevel, exp: i64) -> String {
    let claims = Claims {
        sub: sub.to_owned(),
        role,
        allowed_event_types: allowed.iter().map(|s| s.to_string()).collect(),
        data_access_level: access,
        rate_limit_overrides: std::collections::HashMap::new(),
        exp,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn spawn_server() -> String {
    spawn_server_with(Duration::from_secs(3600)).await // keep heartbeats out of these tests' way
}

async fn spawn_server_with(heartbeat_period: Duration) -> String {
    let mut config = FabricConfig::default();
    config.jwt_secret = SECRET.to_owned();
    config.heartbeat_period = heartbeat_period;
    let state = AppState::new(config);
    state.broadcaster.start().await;
    let router = event_fabric::build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("ws://{addr}/ws/v1/events")
}

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_with_token(url: &str, token: &str) -> Client {
    let mut request = url.into_client_request().expect("valid ws url");
    request.headers_mut().insert("Authorization", format!("Bearer {token}").parse().unwrap());
    let (ws, _) = connect_async(request).await.expect("handshake should succeed");
    ws
}

async fn recv_frame(client: &mut Client) -> Frame {
    loop {
        match timeout(Duration::from_secs(2), client.next()).await.expect("no message in time").unwrap().unwrap() {
            TMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            TMessage::Ping(_) | TMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_client_message(client: &mut Client, message: &ClientMessage) {
    client.send(TMessage::Text(serde_json::to_string(message).unwrap().into())).await.unwrap();
}

#[tokio::test]
async fn connect_established_frame_carries_session_id() {
    let url = spawn_server().await;
    let token = issue("u1", Role::User, &["health_update"], DataAccessLevel::Full);
    let mut client = connect_with_token(&url, &token).await;

    let frame = recv_frame(&mut client).await;
    assert_eq!(frame.kind, "connection_established");
    assert!(frame.data["session_id"].as_str().unwrap().len() > 0);
}

#[tokio::test]
async fn json_ping_gets_a_pong() {
    let url = spawn_server().await;
    let token = issue("u1", Role::User, &[], DataAccessLevel::Full);
    let mut client = connect_with_token(&url, &token).await;
    recv_frame(&mut client).await; // connection_established

    send_client_message(&mut client, &ClientMessage::Ping).await;
    let frame = recv_frame(&mut client).await;
    assert_eq!(frame.kind, "pong");
}

#[tokio::test]
async fn admin_emit_is_delivered_with_redaction_for_a_redacted_subscriber() {
    let url = spawn_server().await;

    let admin_token = issue("admin1", Role::Admin, &[], DataAccessLevel::Full);
    let mut admin = connect_with_token(&url, &admin_token).await;
    recv_frame(&mut admin).await;

    let user_token = issue("user1", Role::User, &["health_update"], DataAccessLevel::Redacted);
    let mut user = connect_with_token(&url, &user_token).await;
    recv_frame(&mut user).await;

    send_client_message(
        &mut user,
        &ClientMessage::SubscribeEvents { body: SubscribeBody { event_types: vec![fabric_protocol::EventType::HealthUpdate] } },
    )
    .await;
    let sub_ack = recv_frame(&mut user).await;
    assert_eq!(sub_ack.kind, "subscription_updated");

    send_client_message(
        &mut admin,
        &ClientMessage::EmitEvent {
            body: fabric_protocol::EmitEventBody {
                event_type: fabric_protocol::EventType::HealthUpdate,
                payload: serde_json::json!({"status": "degraded", "client_ip": "10.1.1.1"}),
                source: Some("health-checker".to_owned()),
                priority: fabric_protocol::Priority::Normal,
                tags: vec![],
            },
        },
    )
    .await;

    let delivered = recv_frame(&mut user).await;
    assert_eq!(delivered.kind, "health_update");
    assert_eq!(delivered.data["status"], "degraded");
    assert!(delivered.data.get("client_ip").is_none(), "redacted identity must not see client_ip");
}

#[tokio::test]
async fn second_connection_for_same_identity_closes_the_first_with_session_superseded() {
    let url = spawn_server().await;
    let token = issue("dup-user", Role::User, &[], DataAccessLevel::Full);

    let mut first = connect_with_token(&url, &token).await;
    recv_frame(&mut first).await;

    let mut second = connect_with_token(&url, &token).await;
    recv_frame(&mut second).await;

    let close = timeout(Duration::from_secs(2), first.next()).await.unwrap().unwrap().unwrap();
    match close {
        TMessage::Close(Some(frame)) => assert_eq!(frame.code, fabric_protocol::close_codes::SESSION_SUPERSEDED),
        other => panic!("expected a typed close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn token_expiring_mid_session_sends_session_expired_then_closes_4002() {
    let url = spawn_server_with(Duration::from_millis(150)).await;
    let token = issue_with_exp("u1", Role::User, &[], DataAccessLevel::Full, 1);
    let mut client = connect_with_token(&url, &token).await;
    recv_frame(&mut client).await; // connection_established

    let expired = recv_frame(&mut client).await;
    assert_eq!(expired.kind, "session_expired");

    let close = timeout(Duration::from_secs(2), client.next()).await.unwrap().unwrap().unwrap();
    match close {
        TMessage::Close(Some(frame)) => assert_eq!(frame.code, fabric_protocol::close_codes::AUTH_EXPIRED),
        other => panic!("expected a typed close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn replay_delivers_recent_history_tagged_event_replay() {
    let url = spawn_server().await;

    let admin_token = issue("admin1", Role::Admin, &[], DataAccessLevel::Full);
    let mut admin = connect_with_token(&url, &admin_token).await;
    recv_frame(&mut admin).await;

    for _ in 0..3 {
        send_client_message(
            &mut admin,
            &ClientMessage::EmitEvent {
                body: fabric_protocol::EmitEventBody {
                    event_type: fabric_protocol::EventType::ZoneUpdated,
                    payload: serde_json::json!({}),
                    source: None,
                    priority: fabric_protocol::Priority::Low,
                    tags: vec![],
                },
            },
        )
        .await;
    }

    let recent = GetRecentEventsBody { limit: 10 };
    send_client_message(&mut admin, &ClientMessage::GetRecentEvents { body: recent }).await;
    let mut seen = 0;
    for _ in 0..3 {
        let frame = recv_frame(&mut admin).await;
        assert_eq!(frame.kind, "zone_updated");
        seen += 1;
    }
    assert_eq!(seen, 3);

    let now = chrono::Utc::now();
    send_client_message(
        &mut admin,
        &ClientMessage::StartReplay {
            body: StartReplayBody {
                name: None,
                start: now - chrono::Duration::minutes(1),
                end: now + chrono::Duration::minutes(1),
                filter: None,
                speed: 1000.0,
            },
        },
    )
    .await;
    let started = recv_frame(&mut admin).await;
    assert_eq!(started.kind, "replay_started");
    let replay_id = started.data["replay_id"].as_str().unwrap().to_owned();

    let replayed = recv_frame(&mut admin).await;
    assert_eq!(replayed.kind, "event_replay");

    send_client_message(&mut admin, &ClientMessage::GetReplayStatus { body: ReplayIdBody { replay_id } }).await;
}
