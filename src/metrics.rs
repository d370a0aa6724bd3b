//! Process-wide atomic counters backing `connection_stats` (§6.5, §5's
//! "Metrics counters: atomic; no locks").

use fabric_protocol::{ConnectionStatsBody, Priority};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct Metrics {
    pub messages_sent_total: AtomicU64,
    pub dropped_total: AtomicU64,
    pub rate_limit_dropped: AtomicU64,
    pub replay_jobs_in_flight: AtomicU64,
    processing_time_ms_by_type: Mutex<HashMap<String, (f64, u64)>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limit_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replay_job_started(&self) {
        self.replay_jobs_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replay_job_finished(&self) {
        self.replay_jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Accumulates a dispatch-stage processing sample for a running mean,
    /// keyed by event type wire string.
    pub fn record_processing_time(&self, event_type: &str, millis: f64) {
        let mut map = self.processing_time_ms_by_type.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(event_type.to_owned()).or_insert((0.0, 0));
        entry.0 += millis;
        entry.1 += 1;
    }

    fn processing_time_means(&self) -> HashMap<String, f64> {
        self.processing_time_ms_by_type
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, (sum, count))| (k.clone(), if *count == 0 { 0.0 } else { sum / *count as f64 }))
            .collect()
    }

    pub fn snapshot(
        &self,
        total_sessions: u64,
        queue_depth_by_lane: HashMap<Priority, u64>,
        up: bool,
    ) -> ConnectionStatsBody {
        ConnectionStatsBody {
            total_sessions,
            messages_sent_total: self.messages_sent_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            processing_time_ms_by_type: self.processing_time_means(),
            replay_jobs_in_flight: self.replay_jobs_in_flight.load(Ordering::Relaxed),
            queue_depth_by_lane: queue_depth_by_lane
                .into_iter()
                .map(|(lane, depth)| (lane.as_str().to_owned(), depth))
                .collect(),
            up,
        }
    }
}
