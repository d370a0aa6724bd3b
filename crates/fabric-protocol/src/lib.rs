// fabric-protocol: wire types for the unified realtime event fabric.
//
// Every frame is a JSON object discriminated by a top-level `type` field.
// This crate is intentionally IO-free (no tokio, no axum) so producer
// services outside this repo can depend on it without pulling in a runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Event type, priority, severity
// ---------------------------------------------------------------------------

/// Closed tagged variant for the domain event catalogue, plus an
/// extension case for event types this crate doesn't know about yet.
///
/// Serializes as a bare string on the wire (e.g. `"health_update"` or, for
/// an extension type, `"custom_widget_event"`), so producers can introduce
/// new event types without a protocol bump and without nesting the tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    ZoneCreated,
    ZoneUpdated,
    ZoneDeleted,
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
    HealthUpdate,
    HealthAlert,
    ForwarderStatusChange,
    SecurityAlert,
    RpzUpdate,
    ThreatDetected,
    SystemStatus,
    BindReload,
    ConfigChange,
    UserLogin,
    UserLogout,
    /// Any event type not in the closed set above.
    Unknown(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::ZoneCreated => "zone_created",
            EventType::ZoneUpdated => "zone_updated",
            EventType::ZoneDeleted => "zone_deleted",
            EventType::RecordCreated => "record_created",
            EventType::RecordUpdated => "record_updated",
            EventType::RecordDeleted => "record_deleted",
            EventType::HealthUpdate => "health_update",
            EventType::HealthAlert => "health_alert",
            EventType::ForwarderStatusChange => "forwarder_status_change",
            EventType::SecurityAlert => "security_alert",
            EventType::RpzUpdate => "rpz_update",
            EventType::ThreatDetected => "threat_detected",
            EventType::SystemStatus => "system_status",
            EventType::BindReload => "bind_reload",
            EventType::ConfigChange => "config_change",
            EventType::UserLogin => "user_login",
            EventType::UserLogout => "user_logout",
            EventType::Unknown(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "zone_created" => EventType::ZoneCreated,
            "zone_updated" => EventType::ZoneUpdated,
            "zone_deleted" => EventType::ZoneDeleted,
            "record_created" => EventType::RecordCreated,
            "record_updated" => EventType::RecordUpdated,
            "record_deleted" => EventType::RecordDeleted,
            "health_update" => EventType::HealthUpdate,
            "health_alert" => EventType::HealthAlert,
            "forwarder_status_change" => EventType::ForwarderStatusChange,
            "security_alert" => EventType::SecurityAlert,
            "rpz_update" => EventType::RpzUpdate,
            "threat_detected" => EventType::ThreatDetected,
            "system_status" => EventType::SystemStatus,
            "bind_reload" => EventType::BindReload,
            "config_change" => EventType::ConfigChange,
            "user_login" => EventType::UserLogin,
            "user_logout" => EventType::UserLogout,
            other => EventType::Unknown(other.to_owned()),
        }
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(EventType::from(s.as_str()))
    }
}

/// Priority lane. Ordering matches queue priority: Critical drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Data-access level granted to an Identity. Redacted identities have
/// sensitive payload fields stripped by the filter pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataAccessLevel {
    Redacted,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
}

// ---------------------------------------------------------------------------
// Event / envelope
// ---------------------------------------------------------------------------

/// An event as stamped by the broadcaster. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic per broadcaster instance. Not reused across process restarts.
    pub id: u64,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// An `Event` combined with per-session sequence metadata, assigned at
/// send time. Never constructed twice with the same (session, seq) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: Event,
    /// Strictly greater than the previous sequence number delivered to
    /// the owning session.
    pub sequence: u64,
    /// Present only for `event_replay` deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Client -> server messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    SubscribeEvents {
        #[serde(rename = "data")]
        body: SubscribeBody,
    },
    UnsubscribeEvents {
        #[serde(rename = "data")]
        body: SubscribeBody,
    },
    /// Admin-only; rejected with a permission error for non-admin identities.
    EmitEvent {
        #[serde(rename = "data")]
        body: EmitEventBody,
    },
    GetRecentEvents {
        #[serde(rename = "data")]
        body: GetRecentEventsBody,
    },
    StartReplay {
        #[serde(rename = "data")]
        body: StartReplayBody,
    },
    StopReplay {
        #[serde(rename = "data")]
        body: ReplayIdBody,
    },
    GetReplayStatus {
        #[serde(rename = "data")]
        body: ReplayIdBody,
    },
    GetConnectionStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeBody {
    pub event_types: Vec<EventType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitEventBody {
    pub event_type: EventType,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRecentEventsBody {
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReplayBody {
    #[serde(default)]
    pub name: Option<String>,
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub filter: Option<Vec<EventType>>,
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_speed() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayIdBody {
    pub replay_id: String,
}

// ---------------------------------------------------------------------------
// Server -> client messages
// ---------------------------------------------------------------------------

/// The one wire shape every server->client message takes: `{type, data,
/// timestamp, id?, category?, source?, severity?, tags?, metadata?,
/// priority?}` (§6.1). Control messages (`pong`, `subscription_updated`,
/// ...) and domain event frames (`zone_created`, `health_update`, ...) are
/// both just a `Frame` with a different `kind`/`data` — there is no
/// separate tagged-enum wrapper, since the `type` field itself *is* the
/// discriminant every client branches on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl Frame {
    fn control(kind: &str, data: serde_json::Value) -> Self {
        Frame {
            kind: kind.to_owned(),
            data,
            timestamp: chrono::Utc::now(),
            id: None,
            category: None,
            source: None,
            severity: None,
            tags: Vec::new(),
            metadata: None,
            priority: None,
        }
    }

    pub fn pong() -> Self {
        Frame::control("pong", serde_json::Value::Null)
    }

    pub fn connection_established(body: &ConnectionEstablishedBody) -> Self {
        Frame::control("connection_established", serde_json::to_value(body).unwrap_or_default())
    }

    pub fn subscription_updated(body: &SubscriptionUpdatedBody) -> Self {
        Frame::control("subscription_updated", serde_json::to_value(body).unwrap_or_default())
    }

    pub fn replay_started(body: &ReplayStartedBody) -> Self {
        Frame::control("replay_started", serde_json::to_value(body).unwrap_or_default())
    }

    pub fn replay_status(body: &ReplayStatusBody) -> Self {
        Frame::control("replay_status", serde_json::to_value(body).unwrap_or_default())
    }

    pub fn replay_stopped(body: &ReplayIdBody) -> Self {
        Frame::control("replay_stopped", serde_json::to_value(body).unwrap_or_default())
    }

    pub fn connection_stats(body: &ConnectionStatsBody) -> Self {
        Frame::control("connection_stats", serde_json::to_value(body).unwrap_or_default())
    }

    pub fn rate_limited(body: &RateLimitedBody) -> Self {
        Frame::control("rate_limited", serde_json::to_value(body).unwrap_or_default())
    }

    pub fn dropped_notice(body: &DroppedNoticeBody) -> Self {
        Frame::control("dropped_notice", serde_json::to_value(body).unwrap_or_default())
    }

    pub fn session_expired() -> Self {
        Frame::control("session_expired", serde_json::Value::Null)
    }

    pub fn error(body: &ErrorMessage) -> Self {
        Frame::control("error", serde_json::to_value(body).unwrap_or_default())
    }

    /// A domain event delivered to a subscriber. `kind` is the event's own
    /// type (e.g. `"zone_created"`), never a generic `"event"` wrapper.
    pub fn from_envelope(envelope: &EventEnvelope) -> Self {
        Frame {
            kind: envelope.event.event_type.as_str().to_owned(),
            data: envelope.event.payload.clone(),
            timestamp: envelope.event.timestamp,
            id: Some(envelope.event.id.to_string()),
            category: None,
            source: envelope.event.source.clone(),
            severity: None,
            tags: envelope.event.tags.clone(),
            metadata: Some(envelope.event.metadata.clone()),
            priority: Some(envelope.event.priority),
        }
    }

    /// A replayed domain event, tagged `event_replay` with the original
    /// event embedded under `data.original_event`.
    pub fn event_replay(envelope: &EventEnvelope, replay_id: &str) -> Self {
        let mut env = envelope.clone();
        env.replay_id = Some(replay_id.to_owned());
        Frame {
            kind: "event_replay".to_owned(),
            data: serde_json::json!({ "original_event": env }),
            timestamp: envelope.event.timestamp,
            id: Some(envelope.event.id.to_string()),
            category: None,
            source: envelope.event.source.clone(),
            severity: None,
            tags: envelope.event.tags.clone(),
            metadata: None,
            priority: Some(envelope.event.priority),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEstablishedBody {
    pub session_id: String,
    pub subscriptions: Vec<EventType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionUpdatedBody {
    pub subscriptions: Vec<EventType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayStartedBody {
    pub replay_id: String,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayStatusBody {
    pub replay_id: String,
    pub processed: u64,
    pub total: u64,
    pub percent: f64,
    pub status: ReplayStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    Pending,
    Running,
    Stopped,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatsBody {
    pub total_sessions: u64,
    pub messages_sent_total: u64,
    pub dropped_total: u64,
    pub processing_time_ms_by_type: HashMap<String, f64>,
    pub replay_jobs_in_flight: u64,
    /// Keyed by lane name (`"low"`, `"normal"`, `"high"`, `"critical"`).
    pub queue_depth_by_lane: HashMap<String, u64>,
    pub up: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitedBody {
    pub event_type: EventType,
    pub dropped_in_window: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroppedNoticeBody {
    pub dropped_by_backpressure: u64,
    pub gap_from_sequence: u64,
    pub gap_to_sequence: u64,
}

/// Frozen error codes (server -> client `error` frames).
pub mod error_codes {
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const AUTH_EXPIRED: &str = "AUTH_EXPIRED";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const RANGE_TOO_LARGE: &str = "RANGE_TOO_LARGE";
    pub const REPLAY_NOT_FOUND: &str = "REPLAY_NOT_FOUND";
    pub const INVALID_EVENT_TYPE: &str = "INVALID_EVENT_TYPE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

// ---------------------------------------------------------------------------
// Close codes
// ---------------------------------------------------------------------------

/// Typed WebSocket close codes. Values match §6.2 of the fabric contract.
pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const AUTH_FAILED: u16 = 4001;
    pub const AUTH_EXPIRED: u16 = 4002;
    pub const SESSION_SUPERSEDED: u16 = 4003;
    pub const HEARTBEAT_TIMEOUT: u16 = 4004;
    pub const BACKPRESSURE_TERMINAL: u16 = 4005;
    pub const ADMIN_KICKED: u16 = 4006;

    pub fn reason(code: u16) -> &'static str {
        match code {
            NORMAL => "normal",
            GOING_AWAY => "going_away",
            POLICY_VIOLATION => "policy_violation",
            AUTH_FAILED => "auth_failed",
            AUTH_EXPIRED => "auth_expired",
            SESSION_SUPERSEDED => "session_superseded",
            HEARTBEAT_TIMEOUT => "heartbeat_timeout",
            BACKPRESSURE_TERMINAL => "backpressure_terminal",
            ADMIN_KICKED => "admin_kicked",
            _ => "unknown",
        }
    }
}
