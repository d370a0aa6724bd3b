//! The per-(Session, Event) filter pipeline (§4.2): permission -> redaction
//! -> rate limit -> optional batching, short-circuiting on the first stage
//! that rejects. Pure given its inputs (the Session's pre-materialised
//! Identity and rate limiter state, the Event, and config) — no IO, per
//! §5's "filter functions must be pure and non-blocking".

use crate::config::FabricConfig;
use crate::rate_limit::Admission;
use crate::session::Session;
use fabric_protocol::{DataAccessLevel, Event, EventType, Priority};
use std::collections::VecDeque;
use std::time::Instant;

/// Result of running one Event through the pipeline for one Session.
pub enum FilterDecision {
    /// Survived permission, redaction, and rate limiting; ready to enqueue
    /// (possibly after batching).
    Deliver(Event),
    /// Failed the permission check; the Session is not notified per-event
    /// (only `subscription_updated` communicates the permitted subset).
    Denied,
    RateLimited { emit_notice: bool, dropped_in_window: u64 },
}

/// Stage 1: permission filter. Admins pass everything.
pub fn permission_filter(session: &Session, event_type: &EventType) -> bool {
    session.identity.allows(event_type)
}

/// Stage 2: redaction. Strips configured field names from the payload for
/// redacted-access identities; full-access identities pass through
/// unmodified. Unknown fields (not listed in config) default to visible.
pub fn redact(event: &Event, config: &FabricConfig, access: DataAccessLevel) -> Event {
    if access == DataAccessLevel::Full {
        return event.clone();
    }
    let Some(fields) = config.redaction_rules.get(event.event_type.as_str()) else {
        return event.clone();
    };
    let mut redacted = event.clone();
    if let serde_json::Value::Object(map) = &mut redacted.payload {
        for field in fields {
            map.remove(field);
        }
    }
    redacted
}

/// Stages 1-3 combined: permission, then redaction, then rate limit. CRITICAL
/// events skip the rate limit stage entirely (§4.2 rule 3 scopes the cap to
/// non-admin non-critical types; invariant 3 requires CRITICAL be delivered
/// or the Session terminated, never silently dropped by a bucket).
pub fn evaluate(session: &Session, event: &Event, config: &FabricConfig) -> FilterDecision {
    if !permission_filter(session, &event.event_type) {
        return FilterDecision::Denied;
    }
    let redacted = redact(event, config, session.identity.data_access_level);
    if event.priority == Priority::Critical {
        return FilterDecision::Deliver(redacted);
    }
    match session.rate_limiters.check(&event.event_type) {
        Admission::Allowed => FilterDecision::Deliver(redacted),
        Admission::Rejected { emit_notice, dropped_in_window } => {
            FilterDecision::RateLimited { emit_notice, dropped_in_window }
        }
    }
}

/// Stage 4: batching (§4.2 rule 4). Coalesces same-type events to the same
/// Session into one array payload once 2+ are pending within a window, or
/// a size cap is reached. CRITICAL events never enter the batcher — the
/// dispatcher flushes them immediately instead of calling `push`.
pub struct Batcher {
    window: std::time::Duration,
    max_size: usize,
    pending: VecDeque<Event>,
    opened_at: Option<Instant>,
}

impl Batcher {
    pub fn new(window: std::time::Duration, max_size: usize) -> Self {
        Batcher { window, max_size, pending: VecDeque::new(), opened_at: None }
    }

    /// Queues one event. Returns a completed batch immediately if it just
    /// reached `max_size`; otherwise returns `None` and the caller should
    /// call `poll_due` on its timer tick.
    pub fn push(&mut self, event: Event) -> Option<Vec<Event>> {
        debug_assert_ne!(event.priority, Priority::Critical, "critical events bypass batching");
        if self.pending.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.pending.push_back(event);
        if self.pending.len() >= self.max_size {
            return Some(self.drain());
        }
        None
    }

    /// Called on a periodic tick; flushes a batch whose window has elapsed
    /// and which has at least two pending events (a single pending event
    /// waits for a partner or the window, per §4.2's ">= two pending").
    pub fn poll_due(&mut self, now: Instant) -> Option<Vec<Event>> {
        let opened_at = self.opened_at?;
        if self.pending.len() >= 2 && now.saturating_duration_since(opened_at) >= self.window {
            return Some(self.drain());
        }
        None
    }

    fn drain(&mut self) -> Vec<Event> {
        self.opened_at = None;
        self.pending.drain(..).collect()
    }
}
