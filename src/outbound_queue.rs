//! The bounded outbound queue backing one Session's write task (§4.1's
//! "Outbound queue policy"). A plain `mpsc` channel can't support the
//! CRITICAL eviction rule (no way to drop an already-queued item), so
//! this is a `Mutex<VecDeque>` paired with a `Notify` instead — the write
//! task awaits `recv` the same way it would await a channel, but the
//! producer side gets to reach in and evict.

use crate::session::OutboundMessage;
use fabric_protocol::Priority;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

pub enum EnqueueOutcome {
    Enqueued,
    /// A CRITICAL message displaced the oldest non-CRITICAL entry to make room.
    EvictedOther,
    /// The message itself was dropped (queue full of equal-or-higher priority work).
    Dropped,
}

pub struct OutboundQueue {
    depth: usize,
    inner: Mutex<VecDeque<OutboundMessage>>,
    notify: Notify,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(depth: usize) -> Self {
        OutboundQueue {
            depth: depth.max(1),
            inner: Mutex::new(VecDeque::with_capacity(depth)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, message: OutboundMessage) -> EnqueueOutcome {
        if self.closed.load(Ordering::Acquire) {
            return EnqueueOutcome::Dropped;
        }
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() < self.depth {
            queue.push_back(message);
            drop(queue);
            self.notify.notify_one();
            return EnqueueOutcome::Enqueued;
        }

        if message.priority == Priority::Critical {
            if let Some(idx) = queue.iter().position(|m| m.priority != Priority::Critical) {
                queue.remove(idx);
                queue.push_back(message);
                drop(queue);
                self.notify.notify_one();
                return EnqueueOutcome::EvictedOther;
            }
            // Every queued entry is itself CRITICAL; still enqueue by
            // growing past depth momentarily rather than drop a CRITICAL
            // message (§7: "critical path is never dropped").
            queue.push_back(message);
            drop(queue);
            self.notify.notify_one();
            return EnqueueOutcome::Enqueued;
        }

        EnqueueOutcome::Dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the queue is at `depth` and a non-CRITICAL enqueue would
    /// be dropped. Used to time the backpressure-terminal close (§7).
    pub fn is_full(&self) -> bool {
        self.len() >= self.depth
    }

    /// Waits for and pops the next message, or returns `None` once closed
    /// and drained.
    pub async fn recv(&self) -> Option<OutboundMessage> {
        loop {
            if let Some(msg) = self.inner.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
                return Some(msg);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}
