//! Token verification and the `Identity` it resolves to.
//!
//! Tokens are opaque bearer strings to everything above this module; here
//! they're JWTs signed by the authentication server we consume but never
//! issue (that server is an external collaborator, per Non-goals).

use fabric_protocol::{DataAccessLevel, EventType, Role};
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resolved identity for one authenticated connection. Created fresh from
/// a validated token at connect time; never mutated afterward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub role: Role,
    pub allowed_event_types: Vec<EventType>,
    pub data_access_level: DataAccessLevel,
    /// Per-event-type override of the default non-admin rate cap
    /// (events per minute). Absent entries use the configured default.
    pub rate_limit_overrides: HashMap<EventType, u32>,
    /// Token expiry, carried from the JWT `exp` claim so the connection
    /// task can detect mid-session expiry and emit `session_expired` +
    /// `4002` without re-validating the token (§6.4).
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }

    pub fn allows(&self, event_type: &EventType) -> bool {
        self.is_admin() || self.allowed_event_types.contains(event_type)
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct Claims {
    sub: String,
    role: Role,
    #[serde(default)]
    allowed_event_types: Vec<String>,
    data_access_level: DataAccessLevel,
    #[serde(default)]
    rate_limit_overrides: HashMap<String, u32>,
    exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    Valid(Identity),
    Expired,
    Invalid,
}

/// Validate a bearer token's signature and expiry, and materialize the
/// claims it carries into an `Identity`. Never performs IO — the session
/// holds the result for its whole lifetime so filter functions stay pure
/// (§5's "must be pre-materialised into the Session").
pub fn validate_token(secret: &str, raw_token: &str) -> TokenOutcome {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let mut validation = Validation::default();
    validation.validate_exp = false; // checked manually to distinguish Expired from Invalid
    let data = match jsonwebtoken::decode::<Claims>(raw_token, &key, &validation) {
        Ok(data) => data,
        Err(_) => return TokenOutcome::Invalid,
    };
    let claims = data.claims;

    let now = chrono::Utc::now().timestamp();
    if claims.exp <= now {
        return TokenOutcome::Expired;
    }

    let allowed_event_types = claims
        .allowed_event_types
        .iter()
        .map(|s| EventType::from(s.as_str()))
        .collect();
    let rate_limit_overrides = claims
        .rate_limit_overrides
        .into_iter()
        .map(|(k, v)| (EventType::from(k.as_str()), v))
        .collect();

    TokenOutcome::Valid(Identity {
        id: claims.sub,
        role: claims.role,
        allowed_event_types,
        data_access_level: claims.data_access_level,
        rate_limit_overrides,
        expires_at: chrono::DateTime::from_timestamp(claims.exp, 0).unwrap_or_else(chrono::Utc::now),
    })
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}
