//! `Session`: the single live channel for one authenticated `Identity`.

use crate::auth::Identity;
use crate::outbound_queue::OutboundQueue;
use crate::rate_limit::RateLimiterRegistry;
use fabric_protocol::{EventType, Frame};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// States of the per-session lifecycle (§4.1). `Unhealthy` is a transient
/// substate of `Active` — derived from `last_pong_at` vs. the configured
/// timeout at the instant it's checked, rather than stored as its own
/// variant, so there's no window where two tasks disagree about whether a
/// Session is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Draining,
    Closed,
}

/// A Session's outbound queue entry. CRITICAL frames may evict the oldest
/// non-CRITICAL entry when the queue is full; everything else is a plain
/// bounded FIFO (see `ConnectionManager::send`).
pub struct OutboundMessage {
    pub frame: Frame,
    pub priority: fabric_protocol::Priority,
}

pub struct Session {
    pub id: String,
    pub identity: Identity,
    pub connected_at: Instant,
    pub last_ping_at: RwLock<Option<Instant>>,
    pub last_pong_at: RwLock<Option<Instant>>,
    pub last_latency: RwLock<Option<Duration>>,
    pub state: RwLock<SessionState>,
    pub subscriptions: RwLock<HashSet<EventType>>,
    pub outbound: OutboundQueue,
    pub sequence: AtomicU64,
    pub dropped_by_backpressure: AtomicU64,
    pub messages_sent: AtomicU64,
    pub closed: AtomicBool,
    pub rate_limiters: RateLimiterRegistry,
    /// The WS close code the write task should send once `outbound.recv()`
    /// returns `None`. Set by whoever closes the queue (supersede, explicit
    /// close, heartbeat timeout) before calling `outbound.close()`, so the
    /// write task — the only one touching the socket — reports the right
    /// reason without a separate signalling channel.
    close_code: AtomicU16,
}

impl Session {
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_close_code(&self, code: u16) {
        self.close_code.store(code, Ordering::Release);
    }

    pub fn close_code(&self) -> u16 {
        self.close_code.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn set_state(&self, new_state: SessionState) {
        *self.state.write().await = new_state;
    }

    pub async fn record_ping(&self, at: Instant) {
        *self.last_ping_at.write().await = Some(at);
    }

    /// Records a pong and, if a ping is on file, stores the round-trip
    /// latency it answers.
    pub async fn record_pong(&self, at: Instant) {
        let ping_at = *self.last_ping_at.read().await;
        *self.last_pong_at.write().await = Some(at);
        if let Some(ping_at) = ping_at {
            *self.last_latency.write().await = Some(at.saturating_duration_since(ping_at));
        }
    }

    pub async fn last_heartbeat_latency(&self) -> Option<Duration> {
        *self.last_latency.read().await
    }

    /// True once the most recent ping has gone unanswered beyond `timeout`.
    pub async fn is_heartbeat_stale(&self, now: Instant, timeout: Duration) -> bool {
        let ping_at = match *self.last_ping_at.read().await {
            Some(t) => t,
            None => return false,
        };
        let pong_at = *self.last_pong_at.read().await;
        let answered_after_ping = pong_at.is_some_and(|p| p >= ping_at);
        !answered_after_ping && now.saturating_duration_since(ping_at) >= timeout
    }

    pub async fn subscription_snapshot(&self) -> Vec<EventType> {
        self.subscriptions.read().await.iter().cloned().collect()
    }
}

pub type SharedSession = Arc<Session>;

#[cfg(test)]
pub mod test_support {
    use super::*;
    use fabric_protocol::{DataAccessLevel, Role};
    use std::collections::HashMap;

    pub fn make_session(id: &str, queue_depth: usize) -> Session {
        Session {
            id: id.to_owned(),
            identity: Identity {
                id: "u1".to_owned(),
                role: Role::User,
                allowed_event_types: vec![],
                data_access_level: DataAccessLevel::Redacted,
                rate_limit_overrides: HashMap::new(),
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            },
            connected_at: Instant::now(),
            last_ping_at: RwLock::new(None),
            last_pong_at: RwLock::new(None),
            last_latency: RwLock::new(None),
            state: RwLock::new(SessionState::Connecting),
            subscriptions: RwLock::new(HashSet::new()),
            outbound: OutboundQueue::new(queue_depth),
            sequence: AtomicU64::new(0),
            dropped_by_backpressure: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            rate_limiters: RateLimiterRegistry::new(100),
            close_code: AtomicU16::new(fabric_protocol::close_codes::NORMAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::make_session;
    use super::*;

    #[test]
    fn sequence_numbers_are_strictly_increasing() {
        let session = make_session("sess-1", 8);
        assert_eq!(session.next_sequence(), 1);
        assert_eq!(session.next_sequence(), 2);
        assert_eq!(session.next_sequence(), 3);
    }

    #[tokio::test]
    async fn state_transitions_are_observable() {
        let session = make_session("sess-1", 8);
        assert_eq!(session.state().await, SessionState::Connecting);
        session.set_state(SessionState::Active).await;
        assert_eq!(session.state().await, SessionState::Active);
    }

    #[tokio::test]
    async fn heartbeat_latency_is_none_until_both_recorded() {
        let session = make_session("sess-1", 8);
        assert_eq!(session.last_heartbeat_latency().await, None);
        session.record_ping(Instant::now()).await;
        assert_eq!(session.last_heartbeat_latency().await, None);
        session.record_pong(Instant::now()).await;
        assert!(session.last_heartbeat_latency().await.is_some());
    }

    #[tokio::test]
    async fn heartbeat_is_stale_only_after_timeout_with_no_answering_pong() {
        tokio::time::pause();
        let session = make_session("sess-1", 8);
        let ping_at = Instant::now();
        session.record_ping(ping_at).await;

        assert!(!session.is_heartbeat_stale(Instant::now(), Duration::from_secs(60)).await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(session.is_heartbeat_stale(Instant::now(), Duration::from_secs(60)).await);

        session.record_pong(Instant::now()).await;
        assert!(!session.is_heartbeat_stale(Instant::now(), Duration::from_secs(60)).await);
    }
}
