//! # Fan-out Dispatcher
//!
//! Runs after every append: resolves the topic's subscribers and delivers
//! the event to each session.
//!
//! The event log calls `on_appended` while it still holds the topic lock,
//! so deliveries for one topic reach every session in sequence order.
//! Delivery is at-least-once; consumers de-duplicate on `(topic, sequence)`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use super::event::Event;
use super::event_log::AppendListener;
use super::session::{DeliveryOutcome, Session};
use super::subscription::TopicRegistry;
use crate::observability::MetricsRegistry;

/// Dispatcher that fans events out to subscribed sessions
#[derive(Debug)]
pub struct Dispatcher {
    /// Live sessions
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,

    /// Topic registry
    registry: Arc<TopicRegistry>,

    metrics: Arc<MetricsRegistry>,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(registry: Arc<TopicRegistry>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
            metrics,
        }
    }

    /// Add a session
    pub fn connect(&self, session: Arc<Session>) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(session.id(), session);
        }
    }

    /// Remove a session and all of its registrations
    pub fn disconnect(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.registry.unregister_all(session_id);
        self.sessions.write().ok()?.remove(&session_id)
    }

    /// Look up a session
    pub fn session(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().ok()?.get(&session_id).cloned()
    }

    /// Every live session
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver `event` to every subscriber of its topic
    pub fn dispatch(&self, event: &Event) -> DispatchResult {
        let mut result = DispatchResult::default();

        let subscribers = self.registry.subscribers_of(&event.topic);
        result.matched = subscribers.len();

        let sessions: Vec<Arc<Session>> = match self.sessions.read() {
            Ok(sessions) => subscribers
                .iter()
                .filter_map(|id| sessions.get(id).cloned())
                .collect(),
            Err(_) => return result,
        };
        result.failed = result.matched - sessions.len();

        for session in sessions {
            match session.deliver(event) {
                DeliveryOutcome::Delivered => result.delivered += 1,
                DeliveryOutcome::Queued => result.queued += 1,
                DeliveryOutcome::Duplicate => result.duplicates += 1,
                DeliveryOutcome::Degraded => result.degraded += 1,
                DeliveryOutcome::Dropped => result.dropped += 1,
                DeliveryOutcome::NotSubscribed | DeliveryOutcome::Closed => result.failed += 1,
            }
        }

        self.metrics.add_deliveries(result.delivered as u64);
        self.metrics.add_queued(result.queued as u64);
        self.metrics.add_duplicates_skipped(result.duplicates as u64);
        self.metrics.add_overflows(result.degraded as u64);

        if result.degraded > 0 || result.failed > 0 {
            tracing::debug!(
                topic = %event.topic,
                sequence = event.sequence,
                matched = result.matched,
                degraded = result.degraded,
                failed = result.failed,
                "dispatch incomplete"
            );
        }

        result
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl AppendListener for Dispatcher {
    fn on_appended(&self, event: &Event) {
        self.metrics.increment_events_appended();
        self.dispatch(event);
    }
}

/// Result of dispatching an event
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    /// Number of subscribed sessions
    pub matched: usize,
    /// Handed straight to the transport
    pub delivered: usize,
    /// Held in a pending queue
    pub queued: usize,
    /// Already delivered to that session
    pub duplicates: usize,
    /// Sessions this event pushed into `Degraded`
    pub degraded: usize,
    /// Sessions already degraded
    pub dropped: usize,
    /// Closing, closed or vanished sessions
    pub failed: usize,
}
