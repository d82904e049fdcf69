//! Event bus implementation
//!
//! Delivery is a bounded-channel try-send executed on the publisher's task.
//! Subscribers must drain their receiver from the UI loop; a full channel
//! drops the newest event and counts it rather than blocking the publisher.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{Event, Topic};

/// Per-subscription channel capacity
///
/// Sized for a burst of timeout/bell events between two UI ticks.
pub const SUBSCRIPTION_CAPACITY: usize = 256;

/// Handle identifying one subscription; used for O(1) unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    topic: Topic,
    id: u64,
}

/// A live subscription: the handle plus the receiving end
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub rx: mpsc::Receiver<Event>,
}

/// Central event bus for instance-level events
///
/// Safe for concurrent subscribe/unsubscribe/publish; capture workers publish
/// while the UI loop manages subscriptions.
pub struct EventBus {
    subs: Mutex<HashMap<Topic, HashMap<u64, mpsc::Sender<Event>>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe to a topic
    ///
    /// Events published before the subscription are not received.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        debug!(topic = topic.as_str(), id, "EventBus::subscribe");

        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.entry(topic).or_default().insert(id, tx);

        Subscription {
            handle: SubscriptionHandle { topic, id },
            rx,
        }
    }

    /// Remove a subscription by handle
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        debug!(topic = handle.topic.as_str(), id = handle.id, "EventBus::unsubscribe");
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(topic_subs) = subs.get_mut(&handle.topic) {
            topic_subs.remove(&handle.id);
        }
    }

    /// Publish an event to every subscriber of its topic
    ///
    /// Fire-and-forget: no subscribers is fine. A full subscriber channel
    /// drops this (newest) event for that subscriber and increments the
    /// dropped counter. Closed receivers are pruned lazily.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        debug!(
            topic = topic.as_str(),
            instance_id = event.instance_id(),
            "EventBus::publish"
        );

        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(topic_subs) = subs.get_mut(&topic) else {
            return;
        };

        let mut closed = Vec::new();
        for (id, tx) in topic_subs.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = topic.as_str(), id, "EventBus::publish: subscriber full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(*id);
                }
            }
        }
        for id in closed {
            topic_subs.remove(&id);
        }
    }

    /// Number of events dropped because a subscriber channel was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of live subscriptions for a topic
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.get(&topic).map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
