//! The replay engine (§4.3's replay stub promoted to a full module, §6.4,
//! §8 scenario S6): replays a bounded slice of `HistoryBuffer` back to one
//! session at a configurable speed, independent of live dispatch.

use crate::connection_manager::ConnectionManager;
use crate::history::HistoryBuffer;
use crate::metrics::Metrics;
use crate::session::{OutboundMessage, SharedSession};
use fabric_protocol::{error_codes, EventEnvelope, EventType, ErrorMessage, Frame, Priority, ReplayStatus, ReplayStatusBody};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Range too large for a single replay (§4.3's `range_too_large` failure mode).
pub struct RangeTooLarge;

pub struct ReplayRequest {
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
    pub filter: Option<Vec<EventType>>,
    pub speed: f64,
}

struct ReplayState {
    status: ReplayStatus,
    processed: u64,
    total: u64,
}

/// One in-flight or completed replay. Owned by `ReplayRegistry`; its task
/// reads `HistoryBuffer::range` once up front and paces delivery afterward
/// purely off the recorded timestamps, so replay speed never depends on
/// live broadcaster load.
pub struct ReplayJob {
    pub id: String,
    session_id: String,
    state: Mutex<ReplayState>,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
    counted: std::sync::atomic::AtomicBool,
}

impl ReplayJob {
    pub async fn status_body(&self) -> ReplayStatusBody {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let percent = if state.total == 0 { 100.0 } else { (state.processed as f64 / state.total as f64) * 100.0 };
        ReplayStatusBody { replay_id: self.id.clone(), processed: state.processed, total: state.total, percent, status: state.status }
    }

    /// Transitions to `Stopped` before the next scheduled emission; any
    /// pending emissions past this point are discarded, not delivered
    /// (§4.3's stop semantics).
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(state.status, ReplayStatus::Pending | ReplayStatus::Running) {
            state.status = ReplayStatus::Stopped;
        }
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        self.uncount();
    }

    /// Decrements `replay_jobs_in_flight` exactly once, however the job ends
    /// (ran to completion, was stopped, or its task was aborted).
    fn uncount(&self) {
        if self.counted.swap(false, Ordering::SeqCst) {
            self.metrics.replay_job_finished();
        }
    }
}

pub struct ReplayRegistry {
    jobs: Mutex<Vec<Arc<ReplayJob>>>,
    counter: AtomicU64,
    metrics: Arc<Metrics>,
}

impl ReplayRegistry {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        ReplayRegistry { jobs: Mutex::new(Vec::new()), counter: AtomicU64::new(0), metrics }
    }

    pub fn get(&self, replay_id: &str) -> Option<Arc<ReplayJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).iter().find(|j| j.id == replay_id).cloned()
    }

    /// Validates the range, reads the matching history slice, and spawns
    /// the pacing task. Progress is pushed to the owning session at <=1Hz
    /// (§6.4) via `Frame::replay_status`.
    pub fn start(
        self: &Arc<Self>,
        history: &Arc<HistoryBuffer>,
        connection_manager: &Arc<ConnectionManager>,
        session: &SharedSession,
        request: ReplayRequest,
        max_range: std::time::Duration,
    ) -> Result<Arc<ReplayJob>, RangeTooLarge> {
        let span = request.end.signed_duration_since(request.start);
        let max_range = chrono::Duration::from_std(max_range).unwrap_or(chrono::Duration::zero());
        if span < chrono::Duration::zero() || span > max_range {
            return Err(RangeTooLarge);
        }

        let events = history.range(request.start, request.end, request.filter.as_deref());
        let total = events.len() as u64;
        let id = format!("replay-{}-{}", Uuid::new_v4(), self.counter.fetch_add(1, Ordering::SeqCst));

        let job = Arc::new(ReplayJob {
            id: id.clone(),
            session_id: session.id.clone(),
            state: Mutex::new(ReplayState { status: ReplayStatus::Pending, processed: 0, total }),
            task: Mutex::new(None),
            metrics: self.metrics.clone(),
            counted: std::sync::atomic::AtomicBool::new(true),
        });
        self.metrics.replay_job_started();

        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).push(job.clone());

        let task_job = job.clone();
        let connection_manager = connection_manager.clone();
        let session = session.clone();
        let speed = if request.speed > 0.0 { request.speed } else { 1.0 };
        let handle = tokio::spawn(async move {
            run_replay(task_job, connection_manager, session, events, speed).await;
        });
        *job.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(job)
    }

    /// Drops completed/stopped jobs older than the live set; called
    /// opportunistically, not on a timer — replay volume is low enough
    /// that unbounded growth within a process lifetime isn't a concern
    /// worth a background sweep.
    pub fn retain_for_session(&self, session_id: &str) {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).retain(|j| j.session_id != session_id);
    }
}

async fn run_replay(
    job: Arc<ReplayJob>,
    connection_manager: Arc<ConnectionManager>,
    session: SharedSession,
    events: Vec<fabric_protocol::Event>,
    speed: f64,
) {
    {
        let mut state = job.state.lock().unwrap_or_else(|e| e.into_inner());
        state.status = ReplayStatus::Running;
    }

    let mut last_progress_push = tokio::time::Instant::now();
    let mut previous_ts: Option<chrono::DateTime<chrono::Utc>> = None;

    for event in events {
        if !matches!(job.state.lock().unwrap_or_else(|e| e.into_inner()).status, ReplayStatus::Running) {
            job.uncount();
            return;
        }

        if let Some(prev) = previous_ts {
            let gap = event.timestamp.signed_duration_since(prev);
            if gap > chrono::Duration::zero() {
                if let Ok(std_gap) = gap.to_std() {
                    let paced = std_gap.div_f64(speed.max(0.001));
                    tokio::time::sleep(paced).await;
                }
            }
        }
        previous_ts = Some(event.timestamp);

        let sequence = session.next_sequence();
        let envelope = EventEnvelope { event, sequence, replay_id: Some(job.id.clone()) };
        let frame = Frame::event_replay(&envelope, &job.id);
        connection_manager.send(&session, OutboundMessage { frame, priority: Priority::Low });

        {
            let mut state = job.state.lock().unwrap_or_else(|e| e.into_inner());
            state.processed += 1;
        }

        if last_progress_push.elapsed() >= std::time::Duration::from_secs(1) {
            push_status(&job, &connection_manager, &session).await;
            last_progress_push = tokio::time::Instant::now();
        }
    }

    {
        let mut state = job.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(state.status, ReplayStatus::Running) {
            state.status = ReplayStatus::Completed;
        }
    }
    job.uncount();
    push_status(&job, &connection_manager, &session).await;
}

async fn push_status(job: &Arc<ReplayJob>, connection_manager: &Arc<ConnectionManager>, session: &SharedSession) {
    let body = job.status_body().await;
    connection_manager.send(session, OutboundMessage { frame: Frame::replay_status(&body), priority: Priority::Low });
}

pub fn range_too_large_error() -> ErrorMessage {
    ErrorMessage { code: error_codes::RANGE_TOO_LARGE.to_owned(), message: "requested range exceeds the maximum replay window".to_owned(), retryable: false }
}

pub fn replay_not_found_error() -> ErrorMessage {
    ErrorMessage { code: error_codes::REPLAY_NOT_FOUND.to_owned(), message: "no replay job with that id".to_owned(), retryable: false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FabricConfig;
    use crate::metrics::Metrics;
    use crate::subscription::SubscriptionIndex;
    use fabric_protocol::{Event, EventType};
    use std::collections::HashMap;

    fn history_with(events: Vec<Event>) -> Arc<HistoryBuffer> {
        let buf = Arc::new(HistoryBuffer::new(events.len().max(1)));
        for e in events {
            buf.push(e);
        }
        buf
    }

    fn event(id: u64, ts: chrono::DateTime<chrono::Utc>) -> Event {
        Event {
            id,
            event_type: EventType::ZoneUpdated,
            payload: serde_json::Value::Null,
            timestamp: ts,
            source: None,
            priority: Priority::Normal,
            tags: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    async fn manager_and_session() -> (Arc<ConnectionManager>, SharedSession) {
        let config = FabricConfig::default();
        let subscriptions = Arc::new(SubscriptionIndex::new());
        let manager = Arc::new(ConnectionManager::new(config, subscriptions, Arc::new(Metrics::new())));
        let accepted = manager
            .accept(crate::auth::Identity {
                id: "u1".to_owned(),
                role: fabric_protocol::Role::Admin,
                allowed_event_types: vec![],
                data_access_level: fabric_protocol::DataAccessLevel::Full,
                rate_limit_overrides: std::collections::HashMap::new(),
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            })
            .await;
        (manager, accepted.session)
    }

    #[tokio::test]
    async fn range_exceeding_max_is_rejected() {
        let (manager, session) = manager_and_session().await;
        let history = history_with(vec![]);
        let registry = Arc::new(ReplayRegistry::new(Arc::new(Metrics::new())));
        let now = chrono::Utc::now();
        let request = ReplayRequest { start: now - chrono::Duration::days(10), end: now, filter: None, speed: 1.0 };
        let result = registry.start(&history, &manager, &session, request, std::time::Duration::from_secs(7 * 24 * 3600));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn replay_delivers_all_matching_events_tagged_event_replay() {
        let now = chrono::Utc::now();
        let history = history_with(vec![event(1, now), event(2, now + chrono::Duration::milliseconds(5))]);
        let (manager, session) = manager_and_session().await;
        let registry = Arc::new(ReplayRegistry::new(Arc::new(Metrics::new())));
        let request = ReplayRequest {
            start: now - chrono::Duration::seconds(1),
            end: now + chrono::Duration::seconds(1),
            filter: None,
            speed: 1000.0,
        };
        registry
            .start(&history, &manager, &session, request, std::time::Duration::from_secs(7 * 24 * 3600))
            .unwrap();

        let first = tokio::time::timeout(std::time::Duration::from_secs(2), session.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.frame.kind, "event_replay");
        let second = tokio::time::timeout(std::time::Duration::from_secs(2), session.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.frame.kind, "event_replay");
    }

    #[tokio::test]
    async fn stop_prevents_further_delivery() {
        let now = chrono::Utc::now();
        let history = history_with(vec![
            event(1, now),
            event(2, now + chrono::Duration::seconds(30)),
            event(3, now + chrono::Duration::seconds(60)),
        ]);
        let (manager, session) = manager_and_session().await;
        let registry = Arc::new(ReplayRegistry::new(Arc::new(Metrics::new())));
        let request = ReplayRequest {
            start: now - chrono::Duration::seconds(1),
            end: now + chrono::Duration::seconds(120),
            filter: None,
            speed: 1.0,
        };
        let job = registry
            .start(&history, &manager, &session, request, std::time::Duration::from_secs(7 * 24 * 3600))
            .unwrap();

        let _first = tokio::time::timeout(std::time::Duration::from_secs(1), session.outbound.recv()).await.unwrap();
        job.stop();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let status = job.status_body().await;
        assert_eq!(status.status, ReplayStatus::Stopped);
    }

    #[tokio::test]
    async fn replay_jobs_in_flight_is_decremented_once_the_job_completes() {
        let now = chrono::Utc::now();
        let history = history_with(vec![event(1, now)]);
        let (manager, session) = manager_and_session().await;
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(ReplayRegistry::new(metrics.clone()));
        let request = ReplayRequest {
            start: now - chrono::Duration::seconds(1),
            end: now + chrono::Duration::seconds(1),
            filter: None,
            speed: 1000.0,
        };
        registry
            .start(&history, &manager, &session, request, std::time::Duration::from_secs(7 * 24 * 3600))
            .unwrap();
        assert_eq!(metrics.snapshot(0, HashMap::new(), true).replay_jobs_in_flight, 1);

        tokio::time::timeout(std::time::Duration::from_secs(2), session.outbound.recv()).await.unwrap();
        // the job's task still needs a beat to flip from Running to Completed and uncount
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(metrics.snapshot(0, HashMap::new(), true).replay_jobs_in_flight, 0);
    }

    #[tokio::test]
    async fn retain_for_session_drops_only_the_closing_sessions_jobs() {
        let now = chrono::Utc::now();
        let history = history_with(vec![event(1, now), event(2, now + chrono::Duration::seconds(30))]);
        let (manager, session_a) = manager_and_session().await;
        let accepted_b = manager
            .accept(crate::auth::Identity {
                id: "u2".to_owned(),
                role: fabric_protocol::Role::Admin,
                allowed_event_types: vec![],
                data_access_level: fabric_protocol::DataAccessLevel::Full,
                rate_limit_overrides: std::collections::HashMap::new(),
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            })
            .await;
        let session_b = accepted_b.session;
        let registry = Arc::new(ReplayRegistry::new(Arc::new(Metrics::new())));
        let request = |speed: f64| ReplayRequest {
            start: now - chrono::Duration::seconds(1),
            end: now + chrono::Duration::seconds(60),
            filter: None,
            speed,
        };
        let job_a = registry
            .start(&history, &manager, &session_a, request(1.0), std::time::Duration::from_secs(7 * 24 * 3600))
            .unwrap();
        let job_b = registry
            .start(&history, &manager, &session_b, request(1.0), std::time::Duration::from_secs(7 * 24 * 3600))
            .unwrap();

        registry.retain_for_session(&session_a.id);

        assert!(registry.get(&job_a.id).is_none());
        assert!(registry.get(&job_b.id).is_some());
    }

    #[tokio::test]
    async fn replay_jobs_in_flight_is_decremented_on_stop() {
        let now = chrono::Utc::now();
        let history = history_with(vec![event(1, now), event(2, now + chrono::Duration::seconds(30))]);
        let (manager, session) = manager_and_session().await;
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(ReplayRegistry::new(metrics.clone()));
        let request = ReplayRequest {
            start: now - chrono::Duration::seconds(1),
            end: now + chrono::Duration::seconds(60),
            filter: None,
            speed: 1.0,
        };
        let job = registry
            .start(&history, &manager, &session, request, std::time::Duration::from_secs(7 * 24 * 3600))
            .unwrap();
        assert_eq!(metrics.snapshot(0, HashMap::new(), true).replay_jobs_in_flight, 1);

        job.stop();
        assert_eq!(metrics.snapshot(0, HashMap::new(), true).replay_jobs_in_flight, 0);
    }
}
