//! The Event Broadcaster (§4.3): the single ingestion point for producer
//! services. Assigns ids, appends to history, and enqueues by priority for
//! N dispatcher workers to route through the subscription index and filter
//! pipeline to the connection manager.

use crate::config::FabricConfig;
use crate::connection_manager::ConnectionManager;
use crate::error::{FabricError, FabricResult};
use crate::filter::FilterDecision;
use crate::history::HistoryBuffer;
use crate::metrics::Metrics;
use crate::session::OutboundMessage;
use crate::subscription::SubscriptionIndex;
use fabric_protocol::{DroppedNoticeBody, Event, EventEnvelope, EventType, Frame, Priority, RateLimitedBody};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Four strict-priority FIFO lanes (§4.3): CRITICAL drains before HIGH,
/// HIGH before NORMAL, NORMAL before LOW, except for the starvation guard
/// in `try_pop`. One `Notify` wakes every idle dispatcher worker; each
/// re-checks all four lanes under the lock, so no lane can starve a
/// sleeping worker.
struct Lanes {
    critical: VecDeque<Event>,
    high: VecDeque<Event>,
    normal: VecDeque<Event>,
    low: VecDeque<Event>,
}

impl Lanes {
    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<Event> {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn len(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical.len(),
            Priority::High => self.high.len(),
            Priority::Normal => self.normal.len(),
            Priority::Low => self.low.len(),
        }
    }
}

struct PriorityQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
}

impl PriorityQueue {
    fn new() -> Self {
        PriorityQueue {
            lanes: Mutex::new(Lanes {
                critical: VecDeque::new(),
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }

    fn push(&self, event: Event) {
        let priority = event.priority;
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.lane_mut(priority).push_back(event);
        drop(lanes);
        self.notify.notify_one();
    }

    fn depth(&self, priority: Priority) -> usize {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner()).len(priority)
    }

    /// Pops honoring strict priority order, except that after
    /// `starvation_threshold` consecutive CRITICAL/HIGH pops a single
    /// pending HIGH/NORMAL/LOW event is serviced first (§4.3's starvation
    /// protection).
    fn try_pop(&self, consecutive_high_priority: &mut u32, starvation_threshold: u32) -> Option<Event> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());

        if *consecutive_high_priority >= starvation_threshold {
            for queue in [&mut lanes.high, &mut lanes.normal, &mut lanes.low] {
                if let Some(event) = queue.pop_front() {
                    *consecutive_high_priority = 0;
                    return Some(event);
                }
            }
        }

        if let Some(event) = lanes.critical.pop_front() {
            *consecutive_high_priority += 1;
            return Some(event);
        }
        if let Some(event) = lanes.high.pop_front() {
            *consecutive_high_priority += 1;
            return Some(event);
        }
        if let Some(event) = lanes.normal.pop_front() {
            *consecutive_high_priority = 0;
            return Some(event);
        }
        if let Some(event) = lanes.low.pop_front() {
            *consecutive_high_priority = 0;
            return Some(event);
        }
        None
    }

    async fn pop(&self, consecutive_high_priority: &mut u32, starvation_threshold: u32) -> Event {
        loop {
            if let Some(event) = self.try_pop(consecutive_high_priority, starvation_threshold) {
                return event;
            }
            self.notify.notified().await;
        }
    }
}

/// Handed to producer services; `emit` never blocks (§6.3's ingestion contract).
#[derive(Clone)]
pub struct ProducerHandle {
    queue: Arc<PriorityQueue>,
    history: Arc<HistoryBuffer>,
    next_id: Arc<AtomicU64>,
}

impl ProducerHandle {
    /// Stamps an id and timestamp, appends to history, and enqueues by
    /// priority. Rejects only an explicitly empty event type (§4.3's
    /// `invalid_event_type` failure mode) — anything else not in the
    /// closed catalogue is accepted as `EventType::Unknown`, per the
    /// protocol's open extension policy.
    pub fn emit(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        source: Option<String>,
        priority: Priority,
        tags: Vec<String>,
    ) -> FabricResult<u64> {
        if matches!(&event_type, EventType::Unknown(s) if s.is_empty()) {
            return Err(FabricError::InvalidEventType(String::new()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            event_type,
            payload,
            timestamp: chrono::Utc::now(),
            source,
            priority,
            tags,
            metadata: serde_json::Value::Null,
        };
        self.history.push(event.clone());
        self.queue.push(event);
        Ok(id)
    }
}

pub struct Broadcaster {
    queue: Arc<PriorityQueue>,
    pub history: Arc<HistoryBuffer>,
    pub subscriptions: Arc<SubscriptionIndex>,
    pub connection_manager: Arc<ConnectionManager>,
    pub metrics: Arc<Metrics>,
    next_id: Arc<AtomicU64>,
    config: FabricConfig,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Broadcaster {
    pub fn new(
        config: FabricConfig,
        subscriptions: Arc<SubscriptionIndex>,
        connection_manager: Arc<ConnectionManager>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let history = Arc::new(HistoryBuffer::new(config.history_buffer_capacity));
        Arc::new(Broadcaster {
            queue: Arc::new(PriorityQueue::new()),
            history,
            subscriptions,
            connection_manager,
            metrics,
            next_id: Arc::new(AtomicU64::new(1)),
            config,
            workers: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn producer_handle(&self) -> ProducerHandle {
        ProducerHandle { queue: self.queue.clone(), history: self.history.clone(), next_id: self.next_id.clone() }
    }

    pub fn queue_depth_by_lane(&self) -> HashMap<Priority, u64> {
        [Priority::Low, Priority::Normal, Priority::High, Priority::Critical]
            .into_iter()
            .map(|p| (p, self.queue.depth(p) as u64))
            .collect()
    }

    /// Spawns `dispatcher_workers` supervised worker tasks. A panicking
    /// worker is caught by its `JoinHandle`, logged, and restarted after a
    /// bounded backoff (§4.3's dispatcher-panic failure mode); the event it
    /// was mid-processing is simply lost, since by the time the panic is
    /// observed the queue pop already completed.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        for i in 0..self.config.dispatcher_workers {
            workers.push(self.spawn_supervised_worker(i));
        }
    }

    fn spawn_supervised_worker(self: &Arc<Self>, worker_index: usize) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut backoff = std::time::Duration::from_millis(50);
            loop {
                let this2 = this.clone();
                let handle = tokio::spawn(async move { this2.dispatch_loop().await });
                match handle.await {
                    Err(e) if e.is_panic() => {
                        tracing::error!(worker = worker_index, "dispatcher worker panicked, restarting");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(std::time::Duration::from_secs(5));
                    }
                    _ => break, // graceful shutdown (task aborted or returned)
                }
            }
        })
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut consecutive_high_priority = 0u32;
        loop {
            let event = self.queue.pop(&mut consecutive_high_priority, self.config.starvation_threshold).await;
            self.dispatch_one(event).await;
        }
    }

    /// Routes one Event to every current subscriber (§4.3's dispatcher
    /// worker steps: snapshot subscribers, run the filter pipeline per
    /// subscriber, hand survivors to the connection manager).
    async fn dispatch_one(&self, event: Event) {
        let started = std::time::Instant::now();
        let subscribers = self.subscriptions.snapshot_subscribers(&event.event_type);
        for session in subscribers {
            if session.is_heartbeat_stale(tokio::time::Instant::now(), self.config.heartbeat_timeout()).await {
                continue; // §3 invariant: unhealthy sessions receive no new dispatch
            }
            match crate::filter::evaluate(&session, &event, &self.config) {
                FilterDecision::Denied => {}
                FilterDecision::RateLimited { emit_notice, dropped_in_window } => {
                    self.metrics.record_rate_limited();
                    if emit_notice {
                        let frame = Frame::rate_limited(&RateLimitedBody {
                            event_type: event.event_type.clone(),
                            dropped_in_window,
                        });
                        self.connection_manager
                            .send(&session, OutboundMessage { frame, priority: Priority::Normal });
                    }
                }
                FilterDecision::Deliver(filtered_event) => {
                    let sequence = session.next_sequence();
                    let envelope = EventEnvelope { event: filtered_event, sequence, replay_id: None };
                    let frame = Frame::from_envelope(&envelope);
                    let delivered =
                        self.connection_manager.send(&session, OutboundMessage { frame, priority: event.priority });
                    if !delivered {
                        let notice = Frame::dropped_notice(&DroppedNoticeBody {
                            dropped_by_backpressure: session.dropped_by_backpressure.load(Ordering::Relaxed),
                            gap_from_sequence: sequence,
                            gap_to_sequence: sequence,
                        });
                        self.connection_manager
                            .send(&session, OutboundMessage { frame: notice, priority: Priority::Normal });
                    }
                }
            }
        }
        self.metrics.record_processing_time(event.event_type.as_str(), started.elapsed().as_secs_f64() * 1000.0);
    }

    /// Cancels dispatcher workers; part of the process shutdown sequence
    /// (§9's explicit lifecycle: stop ingest, drain, close sessions, join tasks).
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use fabric_protocol::{DataAccessLevel, Role};

    fn identity(allowed: Vec<EventType>) -> Identity {
        Identity {
            id: "u1".to_owned(),
            role: Role::User,
            allowed_event_types: allowed,
            data_access_level: DataAccessLevel::Full,
            rate_limit_overrides: HashMap::new(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        }
    }

    fn make_broadcaster() -> Arc<Broadcaster> {
        let config = FabricConfig::default();
        let subscriptions = Arc::new(SubscriptionIndex::new());
        let connection_manager =
            Arc::new(ConnectionManager::new(config.clone(), subscriptions.clone(), Arc::new(Metrics::new())));
        Broadcaster::new(config, subscriptions, connection_manager, Arc::new(Metrics::new()))
    }

    fn sample_event(priority: Priority) -> Event {
        Event {
            id: 1,
            event_type: EventType::HealthUpdate,
            payload: serde_json::Value::Null,
            timestamp: chrono::Utc::now(),
            source: None,
            priority,
            tags: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn priority_queue_drains_critical_before_lower_lanes() {
        let queue = PriorityQueue::new();
        queue.push(sample_event(Priority::Low));
        queue.push(sample_event(Priority::Normal));
        queue.push(sample_event(Priority::Critical));

        let mut streak = 0;
        let first = queue.try_pop(&mut streak, 64).unwrap();
        assert_eq!(first.priority, Priority::Critical);
    }

    #[test]
    fn starvation_guard_forces_a_lower_lane_event_through() {
        let queue = PriorityQueue::new();
        queue.push(sample_event(Priority::Low));
        queue.push(sample_event(Priority::Critical));

        let mut streak = 3; // already at the (tiny, test-only) threshold
        let first = queue.try_pop(&mut streak, 3).unwrap();
        assert_eq!(first.priority, Priority::Low);
        assert_eq!(streak, 0);
    }

    #[test]
    fn invalid_event_type_is_rejected_without_enqueueing() {
        let broadcaster = make_broadcaster();
        let handle = broadcaster.producer_handle();
        let result =
            handle.emit(EventType::Unknown(String::new()), serde_json::json!({}), None, Priority::Normal, vec![]);
        assert!(result.is_err());
        assert_eq!(broadcaster.history.len(), 0);
    }

    #[test]
    fn emitted_event_is_appended_to_history() {
        let broadcaster = make_broadcaster();
        let handle = broadcaster.producer_handle();
        handle.emit(EventType::HealthUpdate, serde_json::json!({}), None, Priority::Normal, vec![]).unwrap();
        assert_eq!(broadcaster.history.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_delivers_to_a_permitted_subscriber() {
        let broadcaster = make_broadcaster();
        let accepted = broadcaster.connection_manager.accept(identity(vec![EventType::HealthUpdate])).await;
        broadcaster.subscriptions.subscribe(&accepted.session.id, &[EventType::HealthUpdate]);
        broadcaster.start().await;

        let handle = broadcaster.producer_handle();
        handle
            .emit(EventType::HealthUpdate, serde_json::json!({"status": "ok"}), None, Priority::Normal, vec![])
            .unwrap();

        let message = tokio::time::timeout(std::time::Duration::from_secs(1), accepted.session.outbound.recv())
            .await
            .expect("delivery within timeout")
            .expect("a message");
        assert_eq!(message.frame.kind, "health_update");
        broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn dispatch_skips_a_subscriber_outside_the_allowed_set() {
        let broadcaster = make_broadcaster();
        let accepted = broadcaster.connection_manager.accept(identity(vec![])).await;
        broadcaster.subscriptions.subscribe(&accepted.session.id, &[EventType::HealthUpdate]);
        broadcaster.start().await;

        let handle = broadcaster.producer_handle();
        handle.emit(EventType::HealthUpdate, serde_json::json!({}), None, Priority::Normal, vec![]).unwrap();

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(200), accepted.session.outbound.recv()).await;
        assert!(result.is_err(), "denied subscriber should receive nothing");
        broadcaster.shutdown().await;
    }
}
