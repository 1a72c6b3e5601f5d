//! Metrics registry for the fan-out core
//!
//! - Counters only
//! - Monotonic increase
//! - Reset only on process start

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Registry of operational counters
///
/// All counters use Relaxed atomics; values are exact but not ordered with
/// respect to each other.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    events_appended: AtomicU64,
    append_failures: AtomicU64,
    deliveries: AtomicU64,
    queued: AtomicU64,
    duplicates_skipped: AtomicU64,
    overflows: AtomicU64,
    resyncs_signaled: AtomicU64,
    resyncs_acknowledged: AtomicU64,
    replays: AtomicU64,
    replay_timeouts: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    subscribes: AtomicU64,
    forbidden_subscribes: AtomicU64,
    presence_transitions: AtomicU64,
    events_pruned: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Event log

    pub fn increment_events_appended(&self) {
        self.events_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_append_failures(&self) {
        self.append_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_events_pruned(&self, count: u64) {
        self.events_pruned.fetch_add(count, Ordering::Relaxed);
    }

    // Delivery

    pub fn add_deliveries(&self, count: u64) {
        self.deliveries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_queued(&self, count: u64) {
        self.queued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_duplicates_skipped(&self, count: u64) {
        self.duplicates_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_overflows(&self, count: u64) {
        self.overflows.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_resyncs_signaled(&self) {
        self.resyncs_signaled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_resyncs_acknowledged(&self) {
        self.resyncs_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_replays(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_replay_timeouts(&self) {
        self.replay_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    // Sessions

    pub fn increment_sessions_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_sessions_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_subscribes(&self) {
        self.subscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_forbidden_subscribes(&self) {
        self.forbidden_subscribes.fetch_add(1, Ordering::Relaxed);
    }

    // Presence

    pub fn increment_presence_transitions(&self) {
        self.presence_transitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_appended: self.events_appended.load(Ordering::Relaxed),
            append_failures: self.append_failures.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            resyncs_signaled: self.resyncs_signaled.load(Ordering::Relaxed),
            resyncs_acknowledged: self.resyncs_acknowledged.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            replay_timeouts: self.replay_timeouts.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            subscribes: self.subscribes.load(Ordering::Relaxed),
            forbidden_subscribes: self.forbidden_subscribes.load(Ordering::Relaxed),
            presence_transitions: self.presence_transitions.load(Ordering::Relaxed),
            events_pruned: self.events_pruned.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_appended: u64,
    pub append_failures: u64,
    pub deliveries: u64,
    pub queued: u64,
    pub duplicates_skipped: u64,
    pub overflows: u64,
    pub resyncs_signaled: u64,
    pub resyncs_acknowledged: u64,
    pub replays: u64,
    pub replay_timeouts: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub subscribes: u64,
    pub forbidden_subscribes: u64,
    pub presence_transitions: u64,
    pub events_pruned: u64,
}
