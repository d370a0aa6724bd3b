//! The single WebSocket upgrade endpoint (§6.6, `/ws/v1/events`) and its
//! per-connection task.
//!
//! One task owns the socket for the Session's whole lifetime and multiplexes
//! three event sources with `tokio::select!`, the same shape as
//! `services/server::ws_forwarder::handle_forwarder_socket`: client frames
//! arriving on the socket, the Session's outbound queue (fed by the
//! broadcaster's dispatcher workers and by replay jobs, neither of which
//! own the socket), and a heartbeat interval driving native WS ping/pong.

use crate::auth::{extract_bearer, validate_token, TokenOutcome};
use crate::connection_manager::ConnectionManager;
use crate::filter::{permission_filter, redact};
use crate::replay::{self, ReplayRequest};
use crate::session::{SessionState, SharedSession};
use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use fabric_protocol::{
    close_codes, error_codes, ClientMessage, ErrorMessage, EventEnvelope, Frame, ReplayIdBody, ReplayStartedBody,
    SubscriptionUpdatedBody,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Protocol errors within this window close the Session with `1008` (§7:
/// "do not close unless repeated (>5/min)").
const PROTOCOL_ERROR_WINDOW: Duration = Duration::from_secs(60);
const PROTOCOL_ERROR_LIMIT: usize = 5;

pub async fn events_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(ToOwned::to_owned);
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, token: Option<String>) {
    let Some(token) = token else {
        send_frame(&mut socket, &Frame::error(&auth_error(error_codes::AUTH_FAILED, "missing Authorization header"))).await;
        close_with(&mut socket, close_codes::AUTH_FAILED).await;
        return;
    };

    let identity = match validate_token(&state.config.jwt_secret, &token) {
        TokenOutcome::Valid(identity) => identity,
        TokenOutcome::Expired => {
            send_frame(&mut socket, &Frame::error(&auth_error(error_codes::AUTH_EXPIRED, "token expired"))).await;
            close_with(&mut socket, close_codes::AUTH_EXPIRED).await;
            return;
        }
        TokenOutcome::Invalid => {
            send_frame(&mut socket, &Frame::error(&auth_error(error_codes::AUTH_FAILED, "invalid token"))).await;
            close_with(&mut socket, close_codes::AUTH_FAILED).await;
            return;
        }
    };

    let identity_id = identity.id.clone();
    let accepted = state.connection_manager.accept(identity).await;
    let session = accepted.session;
    if let Some(prior) = accepted.superseded {
        tracing::info!(session_id = %prior.id, identity_id = %identity_id, "session superseded");
    }
    session.set_state(SessionState::Active).await;
    tracing::info!(session_id = %session.id, identity_id = %identity_id, "session established");

    let established = ConnectionManager::connection_established_frame(&session, session.subscription_snapshot().await);
    send_frame(&mut socket, &established).await;

    run_connection_loop(&mut socket, &state, &session).await;

    state.connection_manager.close(&session.id, &identity_id).await;
    state.replay_registry.retain_for_session(&session.id);
    tracing::info!(session_id = %session.id, identity_id = %identity_id, "session closed");

    let code = session.close_code();
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: close_codes::reason(code).into() })))
        .await;
}

async fn run_connection_loop(socket: &mut WebSocket, state: &AppState, session: &SharedSession) {
    let heartbeat_period = state.config.heartbeat_period;
    let heartbeat_timeout = state.config.heartbeat_timeout();
    let mut heartbeat_interval = tokio::time::interval(heartbeat_period);
    heartbeat_interval.tick().await;

    let mut protocol_error_at: VecDeque<Instant> = VecDeque::new();
    let mut backpressure_since: Option<Instant> = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_text(socket, state, session, &text, &mut protocol_error_at).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        session.record_pong(Instant::now()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        session.set_close_code(close_codes::NORMAL);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(session_id = %session.id, error = %e, "websocket error");
                        session.set_close_code(close_codes::GOING_AWAY);
                        break;
                    }
                }
            }
            outbound = session.outbound.recv() => {
                match outbound {
                    Some(message) => { send_frame(socket, &message.frame).await; }
                    None => break, // closer already set the close code
                }
            }
            _ = heartbeat_interval.tick() => {
                let now = Instant::now();
                if session.identity.expires_at <= chrono::Utc::now() {
                    tracing::info!(session_id = %session.id, "identity token expired mid-session");
                    send_frame(socket, &Frame::session_expired()).await;
                    session.set_close_code(close_codes::AUTH_EXPIRED);
                    session.outbound.close();
                    break;
                }
                if session.is_heartbeat_stale(now, heartbeat_timeout).await {
                    tracing::info!(session_id = %session.id, "heartbeat timeout");
                    session.set_close_code(close_codes::HEARTBEAT_TIMEOUT);
                    session.outbound.close();
                    break;
                }
                session.record_ping(now).await;
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    session.set_close_code(close_codes::GOING_AWAY);
                    break;
                }
                if session.outbound.is_full() {
                    let since = *backpressure_since.get_or_insert(now);
                    if now.saturating_duration_since(since) >= state.config.backpressure_terminal_after {
                        tracing::warn!(session_id = %session.id, "backpressure terminal");
                        session.set_close_code(close_codes::BACKPRESSURE_TERMINAL);
                        session.outbound.close();
                        break;
                    }
                } else {
                    backpressure_since = None;
                }
            }
        }
    }
}

/// Parses and dispatches one client frame. Returns `false` if the
/// connection should close (repeated protocol errors past the threshold).
async fn handle_client_text(
    socket: &mut WebSocket,
    state: &AppState,
    session: &SharedSession,
    text: &str,
    protocol_error_at: &mut VecDeque<Instant>,
) -> bool {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            send_frame(socket, &Frame::error(&protocol_error(&e.to_string()))).await;
            return !protocol_error_limit_exceeded(protocol_error_at);
        }
    };

    match message {
        ClientMessage::Ping => {
            send_frame(socket, &Frame::pong()).await;
        }
        ClientMessage::SubscribeEvents { body } => {
            let permitted: Vec<_> = body.event_types.into_iter().filter(|t| session.identity.allows(t)).collect();
            let subscriptions = state.broadcaster.subscriptions.subscribe(&session.id, &permitted);
            send_frame(socket, &Frame::subscription_updated(&SubscriptionUpdatedBody { subscriptions })).await;
        }
        ClientMessage::UnsubscribeEvents { body } => {
            let subscriptions = state.broadcaster.subscriptions.unsubscribe(&session.id, &body.event_types);
            send_frame(socket, &Frame::subscription_updated(&SubscriptionUpdatedBody { subscriptions })).await;
        }
        ClientMessage::EmitEvent { body } => {
            if !session.identity.is_admin() {
                send_frame(socket, &Frame::error(&permission_denied_error())).await;
            } else {
                let handle = state.broadcaster.producer_handle();
                if let Err(e) = handle.emit(body.event_type, body.payload, body.source, body.priority, body.tags) {
                    send_frame(socket, &Frame::error(&invalid_event_type_error(&e.to_string()))).await;
                }
            }
        }
        ClientMessage::GetRecentEvents { body } => {
            for event in state.broadcaster.history.recent(body.limit) {
                if !permission_filter(session, &event.event_type) {
                    continue;
                }
                let redacted = redact(&event, &state.config, session.identity.data_access_level);
                let sequence = session.next_sequence();
                let frame = Frame::from_envelope(&EventEnvelope { event: redacted, sequence, replay_id: None });
                send_frame(socket, &frame).await;
            }
        }
        ClientMessage::StartReplay { body } => {
            let request = ReplayRequest { start: body.start, end: body.end, filter: body.filter, speed: body.speed };
            match state.replay_registry.start(
                &state.broadcaster.history,
                &state.connection_manager,
                session,
                request,
                state.config.replay_max_range,
            ) {
                Ok(job) => {
                    let total = job.status_body().await.total;
                    send_frame(socket, &Frame::replay_started(&ReplayStartedBody { replay_id: job.id.clone(), total })).await;
                }
                Err(_) => {
                    send_frame(socket, &Frame::error(&replay::range_too_large_error())).await;
                }
            }
        }
        ClientMessage::StopReplay { body } => match state.replay_registry.get(&body.replay_id) {
            Some(job) => {
                job.stop();
                send_frame(socket, &Frame::replay_stopped(&ReplayIdBody { replay_id: body.replay_id })).await;
            }
            None => {
                send_frame(socket, &Frame::error(&replay::replay_not_found_error())).await;
            }
        },
        ClientMessage::GetReplayStatus { body } => match state.replay_registry.get(&body.replay_id) {
            Some(job) => {
                send_frame(socket, &Frame::replay_status(&job.status_body().await)).await;
            }
            None => {
                send_frame(socket, &Frame::error(&replay::replay_not_found_error())).await;
            }
        },
        ClientMessage::GetConnectionStats => {
            send_frame(socket, &Frame::connection_stats(&state.connection_stats().await)).await;
        }
    }
    true
}

fn protocol_error_limit_exceeded(protocol_error_at: &mut VecDeque<Instant>) -> bool {
    let now = Instant::now();
    protocol_error_at.push_back(now);
    while let Some(front) = protocol_error_at.front() {
        if now.saturating_duration_since(*front) > PROTOCOL_ERROR_WINDOW {
            protocol_error_at.pop_front();
        } else {
            break;
        }
    }
    protocol_error_at.len() > PROTOCOL_ERROR_LIMIT
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

async fn close_with(socket: &mut WebSocket, code: u16) {
    let _ = socket.send(Message::Close(Some(CloseFrame { code, reason: close_codes::reason(code).into() }))).await;
}

fn auth_error(code: &str, message: &str) -> ErrorMessage {
    ErrorMessage { code: code.to_owned(), message: message.to_owned(), retryable: false }
}

fn protocol_error(message: &str) -> ErrorMessage {
    ErrorMessage { code: error_codes::PROTOCOL_ERROR.to_owned(), message: message.to_owned(), retryable: false }
}

fn permission_denied_error() -> ErrorMessage {
    ErrorMessage {
        code: error_codes::PERMISSION_DENIED.to_owned(),
        message: "emit_event requires the admin role".to_owned(),
        retryable: false,
    }
}

fn invalid_event_type_error(detail: &str) -> ErrorMessage {
    ErrorMessage { code: error_codes::INVALID_EVENT_TYPE.to_owned(), message: detail.to_owned(), retryable: false }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_limit_trips_after_six_within_the_window() {
        let mut errors = VecDeque::new();
        for _ in 0..5 {
            assert!(!protocol_error_limit_exceeded(&mut errors));
        }
        assert!(protocol_error_limit_exceeded(&mut errors));
    }
}
