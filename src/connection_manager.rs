//! The Connection Manager (§4.1): owns the Session registry exclusively,
//! runs the heartbeat loop, and enforces the outbound queue backpressure
//! policy. No other component may mutate a Session's outbound queue.

use crate::auth::Identity;
use crate::config::FabricConfig;
use crate::metrics::Metrics;
use crate::outbound_queue::{EnqueueOutcome, OutboundQueue};
use crate::session::{OutboundMessage, Session, SessionState, SharedSession};
use crate::subscription::SubscriptionIndex;
use fabric_protocol::{close_codes, ConnectionEstablishedBody, Frame, Priority};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type SessionRegistry = Arc<RwLock<HashMap<String, SharedSession>>>;

/// Result of `accept`: the freshly registered Session plus the prior
/// Session for the same Identity, if one was just superseded.
pub struct AcceptOutcome {
    pub session: SharedSession,
    pub superseded: Option<SharedSession>,
}

pub struct ConnectionManager {
    /// Keyed by Identity id, not Session id: this is what makes "at most
    /// one active Session per Identity" (§3 invariant 1) enforceable with
    /// a single lookup.
    by_identity: SessionRegistry,
    pub subscriptions: Arc<SubscriptionIndex>,
    pub metrics: Arc<Metrics>,
    config: FabricConfig,
}

impl ConnectionManager {
    pub fn new(config: FabricConfig, subscriptions: Arc<SubscriptionIndex>, metrics: Arc<Metrics>) -> Self {
        ConnectionManager { by_identity: Arc::new(RwLock::new(HashMap::new())), subscriptions, metrics, config }
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Registers a Session for `identity`, evicting any existing Session
    /// for the same Identity (§4.1's `accept`). The caller is responsible
    /// for closing the evicted Session's socket with `session_superseded`.
    pub async fn accept(&self, identity: Identity) -> AcceptOutcome {
        let rate_limiters = if identity.is_admin() {
            crate::rate_limit::RateLimiterRegistry::unlimited()
        } else {
            crate::rate_limit::RateLimiterRegistry::with_overrides(
                self.config.default_non_admin_rate_per_minute,
                identity.rate_limit_overrides.clone(),
            )
        };
        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            identity,
            connected_at: tokio::time::Instant::now(),
            last_ping_at: RwLock::new(None),
            last_pong_at: RwLock::new(None),
            last_latency: RwLock::new(None),
            state: RwLock::new(SessionState::Connecting),
            subscriptions: RwLock::new(Default::default()),
            outbound: OutboundQueue::new(self.config.outbound_queue_depth),
            sequence: AtomicU64::new(0),
            dropped_by_backpressure: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            rate_limiters,
            close_code: AtomicU16::new(close_codes::NORMAL),
        });
        session.set_state(SessionState::Authenticated).await;

        let identity_id = session.identity.id.clone();
        let superseded = {
            let mut registry = self.by_identity.write().await;
            let prior = registry.remove(&identity_id);
            registry.insert(identity_id, session.clone());
            prior
        };
        if let Some(prior) = &superseded {
            prior.set_state(SessionState::Draining).await;
            prior.closed.store(true, Ordering::SeqCst);
            prior.set_close_code(close_codes::SESSION_SUPERSEDED);
            prior.outbound.close();
            self.subscriptions.remove_session(&prior.id);
        }

        self.subscriptions.register_session(session.clone());
        AcceptOutcome { session, superseded }
    }

    /// Non-blocking enqueue onto `session`'s outbound queue (§4.1's
    /// `send`), applying the backpressure eviction policy: a full queue
    /// drops the new non-CRITICAL message, but a CRITICAL message evicts
    /// the oldest non-CRITICAL entry instead of being dropped (§7:
    /// "critical path is never dropped at the producer boundary").
    pub fn send(&self, session: &Session, message: OutboundMessage) -> bool {
        match session.outbound.enqueue(message) {
            EnqueueOutcome::Enqueued | EnqueueOutcome::EvictedOther => {
                session.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_sent();
                true
            }
            EnqueueOutcome::Dropped => {
                session.dropped_by_backpressure.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_dropped();
                false
            }
        }
    }

    /// Removes `session_id` from the registry, from the subscription
    /// index, and closes its outbound queue. The per-connection task
    /// observes the closed queue (`recv` returns `None`) and tears the
    /// socket down.
    pub async fn close(&self, session_id: &str, identity_id: &str) {
        let removed = {
            let mut registry = self.by_identity.write().await;
            match registry.get(identity_id) {
                Some(session) if session.id == session_id => registry.remove(identity_id),
                _ => None,
            }
        };
        if let Some(session) = removed {
            session.set_state(SessionState::Closed).await;
            session.outbound.close();
        }
        self.subscriptions.remove_session(session_id);
    }

    /// Sends a control frame to every currently registered Session.
    pub async fn broadcast_control(&self, frame: Frame) {
        let registry = self.by_identity.read().await;
        for session in registry.values() {
            let _ = self.send(session, OutboundMessage { frame: frame.clone(), priority: Priority::Normal });
        }
    }

    pub async fn session_count(&self) -> usize {
        self.by_identity.read().await.len()
    }

    pub async fn sessions(&self) -> Vec<SharedSession> {
        self.by_identity.read().await.values().cloned().collect()
    }

    pub fn connection_established_frame(session: &Session, subscriptions: Vec<fabric_protocol::EventType>) -> Frame {
        Frame::connection_established(&ConnectionEstablishedBody { session_id: session.id.clone(), subscriptions })
    }

    pub fn superseded_close_code() -> u16 {
        close_codes::SESSION_SUPERSEDED
    }
}
