//! Configuration loading.
//!
//! TOML is the sole config source; every field defaults so a missing or
//! empty file still produces a runnable config. Default path:
//! `/etc/event-fabric/config.toml`, overridable with `--config`.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Per-event-type field names stripped for redacted-access identities
    /// (§4.2 rule 2). Keyed by the event type's wire string. Unknown
    /// fields not listed here default to visible.
    pub redaction_rules: HashMap<String, Vec<String>>,
    pub bind_addr: String,
    /// Heartbeat ping period P.
    pub heartbeat_period: Duration,
    /// Timeout is `heartbeat_timeout_multiplier * heartbeat_period`.
    pub heartbeat_timeout_multiplier: u32,
    pub outbound_queue_depth: usize,
    pub history_buffer_capacity: usize,
    /// Dispatcher worker count. Defaults to `num_cpus::get()`, minimum 2.
    pub dispatcher_workers: usize,
    /// Consecutive higher-lane events serviced before a starvation-guard
    /// lower-lane event is forced through.
    pub starvation_threshold: u32,
    pub batch_window: Duration,
    pub batch_max_size: usize,
    pub default_non_admin_rate_per_minute: u32,
    pub jwt_secret: String,
    pub replay_max_range: Duration,
    /// How long an outbound queue may stay fully saturated before the
    /// session is closed with `backpressure_terminal`.
    pub backpressure_terminal_after: Duration,
}

fn default_redaction_rules() -> HashMap<String, Vec<String>> {
    let mut rules = HashMap::new();
    rules.insert("health_update".to_owned(), vec!["client_ip".to_owned()]);
    rules.insert("health_alert".to_owned(), vec!["client_ip".to_owned()]);
    rules.insert(
        "security_alert".to_owned(),
        vec!["client_ip".to_owned(), "credential_indicator".to_owned()],
    );
    rules.insert("threat_detected".to_owned(), vec!["client_ip".to_owned()]);
    rules.insert("user_login".to_owned(), vec!["client_ip".to_owned(), "user_id".to_owned()]);
    rules.insert("user_logout".to_owned(), vec!["client_ip".to_owned(), "user_id".to_owned()]);
    rules
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            redaction_rules: default_redaction_rules(),
            bind_addr: "0.0.0.0:8090".to_owned(),
            heartbeat_period: Duration::from_secs(30),
            heartbeat_timeout_multiplier: 2,
            outbound_queue_depth: 1024,
            history_buffer_capacity: 10_000,
            dispatcher_workers: num_cpus::get().max(2),
            starvation_threshold: 64,
            batch_window: Duration::from_millis(200),
            batch_max_size: 16,
            default_non_admin_rate_per_minute: 100,
            jwt_secret: "change-me-in-production".to_owned(),
            replay_max_range: Duration::from_secs(7 * 24 * 3600),
            backpressure_terminal_after: Duration::from_secs(30),
        }
    }
}

impl FabricConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_period * self.heartbeat_timeout_multiplier
    }

    pub fn load(path: &Path) -> crate::error::FabricResult<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(crate::error::FabricError::Config(e.to_string())),
        };
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> crate::error::FabricResult<Self> {
        let parsed: RawConfig = toml::from_str(raw)
            .map_err(|e| crate::error::FabricError::Config(e.to_string()))?;
        let defaults = FabricConfig::default();
        Ok(FabricConfig {
            redaction_rules: parsed.redaction.unwrap_or(defaults.redaction_rules),
            bind_addr: parsed.bind_addr.unwrap_or(defaults.bind_addr),
            heartbeat_period: parsed
                .heartbeat_period_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_period),
            heartbeat_timeout_multiplier: parsed
                .heartbeat_timeout_multiplier
                .unwrap_or(defaults.heartbeat_timeout_multiplier),
            outbound_queue_depth: parsed
                .outbound_queue_depth
                .unwrap_or(defaults.outbound_queue_depth),
            history_buffer_capacity: parsed
                .history_buffer_capacity
                .unwrap_or(defaults.history_buffer_capacity),
            dispatcher_workers: parsed
                .dispatcher_workers
                .unwrap_or(defaults.dispatcher_workers)
                .max(2),
            starvation_threshold: parsed
                .starvation_threshold
                .unwrap_or(defaults.starvation_threshold),
            batch_window: parsed
                .batch_window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_window),
            batch_max_size: parsed.batch_max_size.unwrap_or(defaults.batch_max_size),
            default_non_admin_rate_per_minute: parsed
                .default_non_admin_rate_per_minute
                .unwrap_or(defaults.default_non_admin_rate_per_minute),
            jwt_secret: parsed.jwt_secret.unwrap_or(defaults.jwt_secret),
            replay_max_range: parsed
                .replay_max_range_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.replay_max_range),
            backpressure_terminal_after: parsed
                .backpressure_terminal_after_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.backpressure_terminal_after),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    redaction: Option<HashMap<String, Vec<String>>>,
    bind_addr: Option<String>,
    heartbeat_period_secs: Option<u64>,
    heartbeat_timeout_multiplier: Option<u32>,
    outbound_queue_depth: Option<usize>,
    history_buffer_capacity: Option<usize>,
    dispatcher_workers: Option<usize>,
    starvation_threshold: Option<u32>,
    batch_window_ms: Option<u64>,
    batch_max_size: Option<usize>,
    default_non_admin_rate_per_minute: Option<u32>,
    jwt_secret: Option<String>,
    replay_max_range_secs: Option<u64>,
    backpressure_terminal_after_secs: Option<u64>,
}
