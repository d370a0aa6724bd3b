//! `HistoryBuffer`: a fixed-capacity ring of recent events (§3, §4.3),
//! serving on-demand replay and `get_recent_events`.
//!
//! Grounded on the same bounded-`VecDeque`-behind-a-lock shape as the
//! teacher's UI log ring, generalized to Events and a range query.

use fabric_protocol::{Event, EventType};
use std::collections::VecDeque;
use std::sync::RwLock;

pub struct HistoryBuffer {
    capacity: usize,
    entries: RwLock<VecDeque<Event>>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        HistoryBuffer { capacity: capacity.max(1), entries: RwLock::new(VecDeque::with_capacity(capacity)) }
    }

    /// Appends one event, evicting the oldest if at capacity. The sole
    /// writer is the broadcaster's ingest path (§5's "lock-free
    /// single-writer multi-reader ring" — approximated here with a
    /// `RwLock` sized for low write contention).
    pub fn push(&self, event: Event) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.push_back(event);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent `limit` events, newest last, for `get_recent_events`.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Events within `[start, end]`, optionally restricted to `filter`
    /// event types, in enqueue order. Used by the replay engine.
    pub fn range(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
        filter: Option<&[EventType]>,
    ) -> Vec<Event> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .filter(|e| filter.is_none_or(|types| types.contains(&e.event_type)))
            .cloned()
            .collect()
    }
}
