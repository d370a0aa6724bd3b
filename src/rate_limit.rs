//! Per-(Session, event type) rate limiting (§4.2, rule 3).
//!
//! Each bucket is a `governor` token bucket sized to the identity's cap for
//! that event type; state lives inside the owning Session, so there's no
//! global lock on the send-attempt hot path (§9's "Rate-limit token bucket
//! -> pure function on (state, now)").

use fabric_protocol::EventType;
use governor::clock::DefaultClock;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;

type Bucket = RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

struct BucketEntry {
    bucket: Bucket,
    dropped_in_window: u64,
    last_notice_at: Option<std::time::Instant>,
}

/// One registry per Session. Unlimited event types (admins, or types with
/// no configured cap) never allocate a bucket and always allow.
pub struct RateLimiterRegistry {
    default_per_minute: u32,
    buckets: Mutex<HashMap<EventType, BucketEntry>>,
    overrides: HashMap<EventType, u32>,
    unlimited: bool,
}

/// Outcome of a single send-attempt admission check.
pub enum Admission {
    Allowed,
    /// Rejected; `emit_notice` is true at most once per 10s window per bucket.
    Rejected { emit_notice: bool, dropped_in_window: u64 },
}

impl RateLimiterRegistry {
    pub fn new(default_per_minute: u32) -> Self {
        RateLimiterRegistry {
            default_per_minute,
            buckets: Mutex::new(HashMap::new()),
            overrides: HashMap::new(),
            unlimited: false,
        }
    }

    pub fn with_overrides(default_per_minute: u32, overrides: HashMap<EventType, u32>) -> Self {
        RateLimiterRegistry { default_per_minute, buckets: Mutex::new(HashMap::new()), overrides, unlimited: false }
    }

    pub fn unlimited() -> Self {
        RateLimiterRegistry {
            default_per_minute: 0,
            buckets: Mutex::new(HashMap::new()),
            overrides: HashMap::new(),
            unlimited: true,
        }
    }

    fn cap_for(&self, event_type: &EventType) -> u32 {
        self.overrides.get(event_type).copied().unwrap_or(self.default_per_minute)
    }

    /// Checks out one token for `event_type`. Never blocks.
    pub fn check(&self, event_type: &EventType) -> Admission {
        if self.unlimited {
            return Admission::Allowed;
        }
        let cap = self.cap_for(event_type);
        if cap == 0 {
            return Admission::Allowed;
        }
        let cap = NonZeroU32::new(cap).unwrap_or(nonzero!(1u32));

        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let entry = buckets.entry(event_type.clone()).or_insert_with(|| BucketEntry {
            bucket: RateLimiter::direct(Quota::per_minute(cap)),
            dropped_in_window: 0,
            last_notice_at: None,
        });

        match entry.bucket.check() {
            Ok(()) => Admission::Allowed,
            Err(_) => {
                entry.dropped_in_window += 1;
                let now = std::time::Instant::now();
                let emit_notice = match entry.last_notice_at {
                    None => true,
                    Some(last) => now.saturating_duration_since(last) >= Duration::from_secs(10),
                };
                if emit_notice {
                    entry.last_notice_at = Some(now);
                }
                Admission::Rejected { emit_notice, dropped_in_window: entry.dropped_in_window }
            }
        }
    }
}
