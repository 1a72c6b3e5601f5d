//! # Subscription Session
//!
//! One connected client. A session owns a cursor per subscribed topic, a
//! bounded transport buffer and a bounded pending queue behind it.
//!
//! `deliver` never blocks: a frame goes straight to the transport when it
//! has room, otherwise it waits in the pending queue. Once the pending queue
//! exceeds its cap the session is `Degraded` and the client is told to
//! resync instead of receiving partial history.
//!
//! `replay` is the catch-up path. It waits for transport room, so a resume
//! is bounded by the caller's timeout rather than by the queue cap.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use super::errors::{RealtimeError, RealtimeResult};
use super::event::{Event, OutboundFrame, ResyncReason};
use super::subscription::Subscription;
use super::topic::TopicKey;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Active,
    Degraded,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether the session can still take subscriptions and frames
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Active | SessionState::Degraded
        )
    }
}

/// Buffer sizing for a session
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Frames held behind a full transport before the session degrades
    pub queue_cap: usize,

    /// Capacity of the transport buffer itself
    pub transport_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_cap: 256,
            transport_buffer: 64,
        }
    }
}

/// What happened to one `deliver` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handed to the transport
    Delivered,
    /// Held in the pending queue
    Queued,
    /// Already delivered (at or below the cursor)
    Duplicate,
    /// This call moved the session to `Degraded`
    Degraded,
    /// Session was already degraded; the client will resync
    Dropped,
    /// Session has no subscription for the event's topic
    NotSubscribed,
    /// Session is closing or closed
    Closed,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    subscriptions: HashMap<TopicKey, Subscription>,
    pending: VecDeque<OutboundFrame>,
    transport: Option<mpsc::Sender<OutboundFrame>>,
    last_heartbeat_at: DateTime<Utc>,
}

/// One connected client
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    user_id: Uuid,
    created_at: DateTime<Utc>,
    config: SessionConfig,
    inner: Mutex<SessionInner>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<OutboundFrame>>,
}

impl Session {
    /// Create a session for an authenticated user, in `Connecting`
    pub fn new(user_id: Uuid, config: SessionConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.transport_buffer.max(1));
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            user_id,
            created_at: now,
            config,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                subscriptions: HashMap::new(),
                pending: VecDeque::new(),
                transport: Some(tx),
                last_heartbeat_at: now,
            }),
            receiver: tokio::sync::Mutex::new(rx),
        }
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Identity behind the session
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// When the session was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn lock(&self) -> RealtimeResult<std::sync::MutexGuard<'_, SessionInner>> {
        self.inner
            .lock()
            .map_err(|_| RealtimeError::Internal("Lock poisoned".into()))
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.lock().map(|i| i.state).unwrap_or(SessionState::Closed)
    }

    /// `Connecting -> Active`
    pub fn activate(&self) -> RealtimeResult<()> {
        let mut inner = self.lock()?;
        match inner.state {
            SessionState::Connecting | SessionState::Active => {
                inner.state = SessionState::Active;
                Ok(())
            }
            _ => Err(RealtimeError::SessionClosed(self.id.to_string())),
        }
    }

    /// Fail unless the session is still open
    pub fn ensure_open(&self) -> RealtimeResult<()> {
        if self.state().is_open() {
            Ok(())
        } else {
            Err(RealtimeError::SessionClosed(self.id.to_string()))
        }
    }

    /// Record a heartbeat
    pub fn touch(&self, at: DateTime<Utc>) {
        if let Ok(mut inner) = self.lock() {
            if at > inner.last_heartbeat_at {
                inner.last_heartbeat_at = at;
            }
        }
    }

    /// Last heartbeat seen on this session
    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        self.lock()
            .map(|i| i.last_heartbeat_at)
            .unwrap_or(self.created_at)
    }

    /// Add a subscription, or return the existing one unchanged
    pub fn add_subscription(&self, topic: &TopicKey, cursor: u64) -> RealtimeResult<Subscription> {
        let mut inner = self.lock()?;
        if !inner.state.is_open() {
            return Err(RealtimeError::SessionClosed(self.id.to_string()));
        }

        let subscription = inner
            .subscriptions
            .entry(topic.clone())
            .or_insert_with(|| Subscription::new(self.id, topic.clone(), cursor));
        Ok(subscription.clone())
    }

    /// Drop the subscription for `topic`
    pub fn remove_subscription(&self, topic: &TopicKey) -> Option<Subscription> {
        self.lock().ok()?.subscriptions.remove(topic)
    }

    /// Subscription for `topic`, if any
    pub fn subscription(&self, topic: &TopicKey) -> Option<Subscription> {
        self.lock().ok()?.subscriptions.get(topic).cloned()
    }

    /// All subscriptions, ordered by topic
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .lock()
            .map(|i| i.subscriptions.values().cloned().collect())
            .unwrap_or_default();
        subs.sort_by(|a, b| a.topic.cmp(&b.topic));
        subs
    }

    /// Move the cursor of an existing subscription
    pub fn set_cursor(&self, topic: &TopicKey, cursor: u64) -> RealtimeResult<()> {
        let mut inner = self.lock()?;
        let subscription = inner
            .subscriptions
            .get_mut(topic)
            .ok_or_else(|| RealtimeError::NotSubscribed(topic.clone()))?;
        subscription.cursor = cursor;
        Ok(())
    }

    /// Frames waiting behind the transport
    pub fn pending_len(&self) -> usize {
        self.lock().map(|i| i.pending.len()).unwrap_or(0)
    }

    /// Push one event toward the client without blocking.
    ///
    /// Events at or below the subscription cursor are skipped. A sequence
    /// gap degrades the session.
    pub fn deliver(&self, event: &Event) -> DeliveryOutcome {
        let Ok(mut inner) = self.lock() else {
            return DeliveryOutcome::Closed;
        };

        if let Err(outcome) = self.advance_locked(&mut inner, event) {
            return outcome;
        }

        inner.pending.push_back(OutboundFrame::Event(event.clone()));
        self.flush_locked(&mut inner);

        if inner.state == SessionState::Closing {
            return DeliveryOutcome::Closed;
        }
        if inner.pending.is_empty() {
            return DeliveryOutcome::Delivered;
        }
        if inner.pending.len() > self.config.queue_cap {
            tracing::warn!(
                session_id = %self.id,
                queue_cap = self.config.queue_cap,
                "delivery queue overflow, degrading session"
            );
            self.degrade_locked(&mut inner, ResyncReason::Overflow);
            return DeliveryOutcome::Degraded;
        }
        DeliveryOutcome::Queued
    }

    /// Push one replayed event toward the client, waiting for transport room.
    ///
    /// Frames already pending go out first. Cursor and gap rules are the
    /// same as `deliver`, but a slow reader suspends the caller instead of
    /// overflowing the pending queue. Returns `Delivered` only once the
    /// frame is in the transport.
    pub async fn replay(&self, event: &Event) -> DeliveryOutcome {
        loop {
            let tx = {
                let Ok(inner) = self.lock() else {
                    return DeliveryOutcome::Closed;
                };
                if let Some(outcome) = Self::closed_outcome(inner.state) {
                    return outcome;
                }
                match inner.transport.clone() {
                    Some(tx) => tx,
                    None => return DeliveryOutcome::Closed,
                }
            };

            let Ok(permit) = tx.reserve().await else {
                tracing::debug!(session_id = %self.id, "transport closed");
                self.begin_close();
                return DeliveryOutcome::Closed;
            };

            let Ok(mut inner) = self.lock() else {
                return DeliveryOutcome::Closed;
            };
            if let Some(outcome) = Self::closed_outcome(inner.state) {
                return outcome;
            }
            if let Some(frame) = inner.pending.pop_front() {
                permit.send(frame);
                continue;
            }

            return match self.advance_locked(&mut inner, event) {
                Ok(()) => {
                    permit.send(OutboundFrame::Event(event.clone()));
                    DeliveryOutcome::Delivered
                }
                Err(outcome) => outcome,
            };
        }
    }

    fn closed_outcome(state: SessionState) -> Option<DeliveryOutcome> {
        match state {
            SessionState::Closing | SessionState::Closed => Some(DeliveryOutcome::Closed),
            SessionState::Degraded => Some(DeliveryOutcome::Dropped),
            SessionState::Connecting | SessionState::Active => None,
        }
    }

    /// Move the topic cursor onto `event`, or say why it cannot be sent
    fn advance_locked(
        &self,
        inner: &mut SessionInner,
        event: &Event,
    ) -> Result<(), DeliveryOutcome> {
        if let Some(outcome) = Self::closed_outcome(inner.state) {
            return Err(outcome);
        }

        let Some(subscription) = inner.subscriptions.get_mut(&event.topic) else {
            return Err(DeliveryOutcome::NotSubscribed);
        };
        if event.sequence <= subscription.cursor {
            return Err(DeliveryOutcome::Duplicate);
        }
        if event.sequence > subscription.cursor + 1 {
            tracing::warn!(
                session_id = %self.id,
                topic = %event.topic,
                cursor = subscription.cursor,
                sequence = event.sequence,
                "sequence gap, degrading session"
            );
            self.degrade_locked(inner, ResyncReason::Gap);
            return Err(DeliveryOutcome::Degraded);
        }
        subscription.cursor = event.sequence;
        Ok(())
    }

    /// Move the session to `Degraded` and signal a resync
    pub fn degrade(&self, reason: ResyncReason) {
        if let Ok(mut inner) = self.lock() {
            if inner.state.is_open() && inner.state != SessionState::Degraded {
                self.degrade_locked(&mut inner, reason);
            }
        }
    }

    fn degrade_locked(&self, inner: &mut SessionInner, reason: ResyncReason) {
        inner.state = SessionState::Degraded;
        inner.pending.clear();
        inner.pending.push_back(OutboundFrame::ResyncRequired {
            topic: None,
            reason,
        });
        self.flush_locked(inner);
    }

    /// Tell the client one topic must be refetched, without degrading
    pub fn signal_resync(&self, topic: &TopicKey, reason: ResyncReason) {
        if let Ok(mut inner) = self.lock() {
            if !inner.state.is_open() {
                return;
            }
            inner.pending.push_back(OutboundFrame::ResyncRequired {
                topic: Some(topic.clone()),
                reason,
            });
            self.flush_locked(&mut inner);
        }
    }

    /// `Degraded -> Active`: discard queued frames and restart every cursor
    /// from the supplied heads.
    pub fn acknowledge_resync(&self, heads: &HashMap<TopicKey, u64>) -> RealtimeResult<()> {
        let mut inner = self.lock()?;
        if !inner.state.is_open() {
            return Err(RealtimeError::SessionClosed(self.id.to_string()));
        }

        inner.pending.clear();
        for (topic, subscription) in inner.subscriptions.iter_mut() {
            if let Some(head) = heads.get(topic) {
                subscription.cursor = *head;
            }
        }
        inner.state = SessionState::Active;
        Ok(())
    }

    /// Move pending frames into free transport slots, in order
    pub fn flush(&self) {
        if let Ok(mut inner) = self.lock() {
            self.flush_locked(&mut inner);
        }
    }

    fn flush_locked(&self, inner: &mut SessionInner) {
        let Some(tx) = inner.transport.clone() else {
            return;
        };

        while let Some(frame) = inner.pending.pop_front() {
            match tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => {
                    inner.pending.push_front(frame);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(session_id = %self.id, "transport closed");
                    inner.state = SessionState::Closing;
                    inner.pending.clear();
                    break;
                }
            }
        }
    }

    /// Outbound frames for the client.
    ///
    /// Each frame pulled frees buffer space that is refilled from the
    /// pending queue. The stream ends once the session is closed and the
    /// buffer is drained; dropping it and calling `events` again resumes
    /// where it left off.
    pub fn events(self: &Arc<Self>) -> impl Stream<Item = OutboundFrame> + Send + 'static {
        stream::unfold(Arc::clone(self), |session| async move {
            let received = {
                let mut rx = session.receiver.lock().await;
                rx.recv().await
            };
            let Some(frame) = received else {
                return None;
            };
            session.flush();
            Some((frame, session))
        })
    }

    /// `-> Closing`
    pub fn begin_close(&self) {
        if let Ok(mut inner) = self.lock() {
            if inner.state.is_open() {
                inner.state = SessionState::Closing;
            }
        }
    }

    /// `-> Closed`: release subscriptions and the transport handle
    pub fn finish_close(&self) -> Vec<TopicKey> {
        let Ok(mut inner) = self.lock() else {
            return Vec::new();
        };
        inner.state = SessionState::Closed;
        inner.pending.clear();
        inner.transport = None;

        let mut topics: Vec<TopicKey> = inner.subscriptions.drain().map(|(t, _)| t).collect();
        topics.sort();
        topics
    }
}
