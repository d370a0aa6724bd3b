//! Subscription index: event type -> set of subscribing Sessions (§4.2, §9).
//!
//! A copy-on-write map, swapped atomically on every mutation via `arc-swap`.
//! Dispatch takes a single `load()` snapshot per Event and never revisits
//! the index, so a concurrent subscribe during dispatch can't cause a
//! partial delivery of that Event to the same Session (§4.2's atomicity
//! requirement). Lock order is always subscriptions -> session (§5); this
//! index never reaches into a Session while mutating itself.

use crate::session::SharedSession;
use arc_swap::ArcSwap;
use fabric_protocol::EventType;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

type Index = HashMap<EventType, HashSet<String>>;

pub struct SubscriptionIndex {
    inner: ArcSwap<Index>,
    sessions: ArcSwap<HashMap<String, SharedSession>>,
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        SubscriptionIndex {
            inner: ArcSwap::from_pointee(HashMap::new()),
            sessions: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_session(&self, session: SharedSession) {
        self.sessions.rcu(|map| {
            let mut map = (**map).clone();
            map.insert(session.id.clone(), session.clone());
            map
        });
    }

    /// Removes a Session from the registry and every subscription it held.
    /// Each `rcu` retries its whole closure on a concurrent writer, so
    /// `subscribe`/`unsubscribe` racing this can never leave the two maps
    /// observing a lost update against each other.
    pub fn remove_session(&self, session_id: &str) {
        self.sessions.rcu(|sessions| {
            let mut sessions = (**sessions).clone();
            sessions.remove(session_id);
            sessions
        });

        self.inner.rcu(|index| {
            let mut index = (**index).clone();
            for subscribers in index.values_mut() {
                subscribers.remove(session_id);
            }
            index
        });
    }

    /// Adds subscriptions for `types`; idempotent for already-subscribed types.
    /// Returns the session's full subscription set after the update.
    pub fn subscribe(&self, session_id: &str, types: &[EventType]) -> Vec<EventType> {
        self.inner.rcu(|index| {
            let mut index = (**index).clone();
            for t in types {
                index.entry(t.clone()).or_default().insert(session_id.to_owned());
            }
            index
        });
        self.subscriptions_for(session_id)
    }

    pub fn unsubscribe(&self, session_id: &str, types: &[EventType]) -> Vec<EventType> {
        self.inner.rcu(|index| {
            let mut index = (**index).clone();
            for t in types {
                if let Some(subs) = index.get_mut(t) {
                    subs.remove(session_id);
                }
            }
            index
        });
        self.subscriptions_for(session_id)
    }

    pub fn subscriptions_for(&self, session_id: &str) -> Vec<EventType> {
        self.inner
            .load()
            .iter()
            .filter(|(_, subs)| subs.contains(session_id))
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// A dispatch-time snapshot of subscribers for one event type. Cloning
    /// `Arc<Session>` handles out of the snapshot is cheap and holds no lock.
    pub fn snapshot_subscribers(&self, event_type: &EventType) -> Vec<SharedSession> {
        let index = self.inner.load();
        let Some(ids) = index.get(event_type) else {
            return Vec::new();
        };
        let sessions = self.sessions.load();
        ids.iter().filter_map(|id| sessions.get(id).cloned()).collect()
    }
}
