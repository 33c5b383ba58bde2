//! Event fan-out to external observers.
//!
//! Publishing never blocks: each subscriber owns a bounded queue and, when it
//! is full, the oldest queued event is dropped to make room. Drops are counted
//! per subscriber and in total. Delivery is best-effort and at most once per
//! subscriber per event.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Topic names published by the orchestrator and executor.
pub mod topics {
    pub const TOOL_STARTED: &str = "tool.started";
    pub const TOOL_QUEUED: &str = "tool.queued";
    pub const TOOL_PROGRESS: &str = "tool.progress";
    pub const TOOL_COMPLETED: &str = "tool.completed";
    pub const SESSION_STATE: &str = "session.state";
    pub const SESSION_BUDGET_WARNING: &str = "session.budget_warning";
    pub const SESSION_ROTATING: &str = "session.rotating";
    pub const SESSION_RECONNECTING: &str = "session.reconnecting";
    pub const SESSION_ERROR: &str = "session.error";
    pub const SESSION_ENDED: &str = "session.ended";
    pub const CONTEXT_PRUNED: &str = "context.pruned";
    pub const CONTEXT_OVER_BUDGET: &str = "context.over_budget";
    pub const PLAYBACK_TRUNCATED: &str = "playback.truncated";
}

/// One broadcast message as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    #[serde(rename = "type")]
    pub topic: String,
    pub session_id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Topic selector: `*`, `prefix.*` or an exact topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPattern {
    All,
    Prefix(String),
    Exact(String),
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            TopicPattern::All
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            TopicPattern::Prefix(prefix.to_string())
        } else {
            TopicPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::All => true,
            TopicPattern::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            TopicPattern::Exact(exact) => topic == exact,
        }
    }
}

/// Which sessions a subscriber hears about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFilter {
    /// Every session, plus events not tied to a session.
    Any,
    /// Only events carrying this session id.
    Only(String),
}

impl SessionFilter {
    fn matches(&self, session_id: Option<&str>) -> bool {
        match self {
            SessionFilter::Any => true,
            SessionFilter::Only(id) => session_id == Some(id.as_str()),
        }
    }
}

pub type SubscriptionId = u64;

#[derive(Debug)]
struct Slot {
    id: SubscriptionId,
    filter: SessionFilter,
    patterns: Vec<TopicPattern>,
    queue: Mutex<VecDeque<Arc<BroadcastEvent>>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Slot {
    fn wants(&self, event: &BroadcastEvent) -> bool {
        self.filter.matches(event.session_id.as_deref())
            && self.patterns.iter().any(|p| p.matches(&event.topic))
    }

    /// Enqueue, dropping the oldest event if full. Returns `true` on a drop.
    fn push(&self, event: Arc<BroadcastEvent>) -> bool {
        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(event);
            dropped
        };
        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Receiving half of a subscription.
///
/// Dropping it is equivalent to unsubscribing; the broadcaster prunes the
/// slot on its next publish.
#[derive(Debug)]
pub struct Subscription {
    slot: Arc<Slot>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.slot.id
    }

    /// Next queued event without waiting.
    pub fn try_recv(&self) -> Option<Arc<BroadcastEvent>> {
        self.slot.queue.lock().pop_front()
    }

    /// Wait for the next event. Returns `None` once unsubscribed and drained.
    pub async fn recv(&self) -> Option<Arc<BroadcastEvent>> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.slot.closed.load(Ordering::Acquire) {
                return None;
            }
            self.slot.notify.notified().await;
        }
    }

    /// Everything currently queued.
    pub fn drain(&self) -> Vec<Arc<BroadcastEvent>> {
        self.slot.queue.lock().drain(..).collect()
    }

    /// Events dropped from this subscriber's queue so far.
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }
}

/// Fan-out hub shared by all sessions.
#[derive(Debug)]
pub struct EventBroadcaster {
    slots: RwLock<HashMap<SubscriptionId, Arc<Slot>>>,
    next_id: AtomicU64,
    capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBroadcaster {
    /// Create a broadcaster whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber for `patterns` (e.g. `["tool.*", "session.ended"]`).
    pub fn subscribe<I, S>(&self, filter: SessionFilter, patterns: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            id,
            filter,
            patterns: patterns
                .into_iter()
                .map(|p| TopicPattern::parse(p.as_ref()))
                .collect(),
            queue: Mutex::new(VecDeque::with_capacity(self.capacity.min(64))),
            capacity: self.capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.slots.write().insert(id, Arc::clone(&slot));
        debug!(subscription = id, "Subscriber registered");
        Subscription { slot }
    }

    /// Remove a subscriber. Its pending events can still be drained.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.slots.write().remove(&id) {
            Some(slot) => {
                slot.close();
                debug!(subscription = id, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Publish to every matching subscriber. Returns the number of recipients.
    pub fn publish(&self, topic: &str, session_id: Option<&str>, payload: Value) -> usize {
        let event = Arc::new(BroadcastEvent {
            topic: topic.to_string(),
            session_id: session_id.map(str::to_string),
            payload,
            timestamp: Utc::now(),
        });
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut recipients = 0;
        let mut stale = Vec::new();
        {
            let slots = self.slots.read();
            for slot in slots.values() {
                // Only the map holds the slot: the Subscription was dropped.
                if Arc::strong_count(slot) == 1 {
                    stale.push(slot.id);
                    continue;
                }
                if !slot.wants(&event) {
                    continue;
                }
                recipients += 1;
                if slot.push(Arc::clone(&event)) {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription = slot.id,
                        topic,
                        total_drops = slot.dropped.load(Ordering::Relaxed),
                        "Subscriber queue full, dropped oldest event"
                    );
                }
            }
        }
        if !stale.is_empty() {
            let mut slots = self.slots.write();
            for id in stale {
                slots.remove(&id);
            }
        }

        debug!(
            topic,
            session_id = session_id.unwrap_or("-"),
            recipients,
            "Broadcast event"
        );
        recipients
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.read().len()
    }

    pub fn published_total(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events dropped across all subscribers since creation.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(crate::config::BroadcastConfig::default().subscriber_queue_capacity)
    }
}
