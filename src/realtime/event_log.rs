//! # Event Log
//!
//! Append-only, per-topic ordered sequence of change events. Single source
//! of truth for ordering.
//!
//! Each topic has its own async lock: appends, subscribe registration and
//! replay for one topic are serialized through it, while unrelated topics
//! never contend. The topic map is only locked long enough to find or
//! create an entry.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use super::errors::{RealtimeError, RealtimeResult};
use super::event::{EntityType, Event, EventKind};
use super::segment::Segment;
use super::topic::TopicKey;

/// Configuration for the event log
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Minimum number of events kept per topic
    pub retention_events: usize,

    /// Events younger than this are always kept
    pub retention_age: Duration,

    /// Segment directory; `None` keeps events in memory only
    pub data_dir: Option<PathBuf>,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            retention_events: 10_000,
            retention_age: Duration::hours(24),
            data_dir: None,
        }
    }
}

/// Invoked synchronously after every successful append, while the topic
/// lock is still held.
pub trait AppendListener: Send + Sync {
    fn on_appended(&self, event: &Event);
}

/// Retained events of one topic
#[derive(Debug, Default)]
struct TopicWindow {
    events: VecDeque<Event>,
    /// Last committed sequence (0 when nothing was ever appended)
    head: u64,
}

impl TopicWindow {
    fn oldest_retained(&self) -> u64 {
        self.events
            .front()
            .map(|e| e.sequence)
            .unwrap_or(self.head + 1)
    }

    fn read_from(
        &self,
        topic: &TopicKey,
        after_sequence: u64,
        limit: usize,
    ) -> RealtimeResult<Vec<Event>> {
        if after_sequence > self.head {
            // Cursor from a history this log no longer has
            return Err(RealtimeError::NotFound {
                topic: topic.clone(),
                requested: after_sequence,
                oldest_retained: self.oldest_retained(),
            });
        }
        if after_sequence == self.head {
            return Ok(Vec::new());
        }

        let oldest = self.oldest_retained();
        if after_sequence + 1 < oldest {
            return Err(RealtimeError::NotFound {
                topic: topic.clone(),
                requested: after_sequence,
                oldest_retained: oldest,
            });
        }

        let start = (after_sequence + 1 - oldest) as usize;
        Ok(self.events.iter().skip(start).take(limit).cloned().collect())
    }
}

/// One topic's log
#[derive(Debug)]
pub struct TopicLog {
    topic: TopicKey,
    writer: Mutex<Option<Segment>>,
    window: RwLock<TopicWindow>,
}

impl TopicLog {
    fn new(topic: TopicKey, segment: Option<Segment>, recovered: Vec<Event>) -> Self {
        let head = recovered.last().map(|e| e.sequence).unwrap_or(0);
        Self {
            topic,
            writer: Mutex::new(segment),
            window: RwLock::new(TopicWindow {
                events: recovered.into(),
                head,
            }),
        }
    }

    /// Topic key
    pub fn topic(&self) -> &TopicKey {
        &self.topic
    }

    /// Last committed sequence
    pub fn head(&self) -> u64 {
        self.window.read().map(|w| w.head).unwrap_or(0)
    }

    /// Oldest sequence still readable
    pub fn oldest_retained(&self) -> u64 {
        self.window
            .read()
            .map(|w| w.oldest_retained())
            .unwrap_or(1)
    }

    /// Number of retained events
    pub fn len(&self) -> usize {
        self.window.read().map(|w| w.events.len()).unwrap_or(0)
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events after `after_sequence`, at most `limit` of them
    pub fn read_from(&self, after_sequence: u64, limit: usize) -> RealtimeResult<Vec<Event>> {
        let window = self
            .window
            .read()
            .map_err(|_| RealtimeError::Internal("Lock poisoned".into()))?;
        window.read_from(&self.topic, after_sequence, limit)
    }

    /// Take the topic's exclusive lock
    pub async fn lock(&self) -> TopicGuard<'_> {
        TopicGuard {
            log: self,
            segment: self.writer.lock().await,
        }
    }
}

/// Exclusive access to one topic. While held, no event can be appended to
/// the topic, so reads and registrations observe a stable head.
pub struct TopicGuard<'a> {
    log: &'a TopicLog,
    segment: MutexGuard<'a, Option<Segment>>,
}

impl TopicGuard<'_> {
    /// Last committed sequence
    pub fn head(&self) -> u64 {
        self.log.head()
    }

    /// Events after `after_sequence`, at most `limit` of them
    pub fn read_from(&self, after_sequence: u64, limit: usize) -> RealtimeResult<Vec<Event>> {
        self.log.read_from(after_sequence, limit)
    }

    /// Assign the next sequence and make the event durable.
    ///
    /// The head only moves after the segment write is synced.
    async fn append(
        &mut self,
        kind: EventKind,
        entity_type: EntityType,
        payload: Value,
    ) -> RealtimeResult<Event> {
        let sequence = self.head() + 1;
        let event = Event::new(sequence, self.log.topic.clone(), kind, entity_type, payload);

        if let Some(segment) = self.segment.as_mut() {
            segment
                .append(&event)
                .await
                .map_err(|e| RealtimeError::Storage(e.to_string()))?;
        }

        let mut window = self
            .log
            .window
            .write()
            .map_err(|_| RealtimeError::Internal("Lock poisoned".into()))?;
        window.events.push_back(event.clone());
        window.head = sequence;

        Ok(event)
    }

    /// Drop events outside retention; returns how many were pruned.
    ///
    /// The segment is rewritten first. Memory is trimmed only once the
    /// survivors are durable, so a failed rewrite changes nothing.
    async fn prune(&mut self, config: &EventLogConfig, now: DateTime<Utc>) -> RealtimeResult<usize> {
        let cutoff = now - config.retention_age;

        let (dropped, survivors) = {
            let window = self
                .log
                .window
                .read()
                .map_err(|_| RealtimeError::Internal("Lock poisoned".into()))?;

            let over_count = window.events.len().saturating_sub(config.retention_events);
            let expired = window
                .events
                .iter()
                .take_while(|e| e.occurred_at < cutoff)
                .count();
            let dropped = over_count.min(expired);
            if dropped == 0 {
                return Ok(0);
            }

            let survivors: Vec<Event> = window.events.iter().skip(dropped).cloned().collect();
            (dropped, survivors)
        };

        if let Some(segment) = self.segment.as_mut() {
            segment
                .rewrite(&survivors)
                .await
                .map_err(|e| RealtimeError::Storage(e.to_string()))?;
        }

        // Appends are excluded by this guard, so the window is unchanged
        let mut window = self
            .log
            .window
            .write()
            .map_err(|_| RealtimeError::Internal("Lock poisoned".into()))?;
        window.events.drain(..dropped);
        Ok(dropped)
    }
}

/// Per-topic event log
pub struct EventLog {
    config: EventLogConfig,
    topics: RwLock<HashMap<TopicKey, Arc<TopicLog>>>,
    creating: Mutex<()>,
    listener: RwLock<Option<Arc<dyn AppendListener>>>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("config", &self.config)
            .field("topics", &self.topic_count())
            .finish()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::in_memory(EventLogConfig::default())
    }
}

impl EventLog {
    /// Create a log without durable storage, ignoring `data_dir`
    pub fn in_memory(config: EventLogConfig) -> Self {
        Self {
            config: EventLogConfig {
                data_dir: None,
                ..config
            },
            topics: RwLock::new(HashMap::new()),
            creating: Mutex::new(()),
            listener: RwLock::new(None),
        }
    }

    /// Open the log, recovering every topic segment under `data_dir`
    pub async fn open(config: EventLogConfig) -> RealtimeResult<Self> {
        let Some(dir) = config.data_dir.clone() else {
            return Ok(Self::in_memory(config));
        };

        let mut topics = HashMap::new();
        for topic in Segment::discover(&dir)
            .await
            .map_err(|e| RealtimeError::Storage(e.to_string()))?
        {
            let (segment, recovered) = Segment::open(&dir, &topic)
                .await
                .map_err(|e| RealtimeError::Storage(e.to_string()))?;
            tracing::info!(
                topic = %topic,
                events = recovered.len(),
                head = recovered.last().map(|e| e.sequence).unwrap_or(0),
                "recovered topic segment"
            );
            topics.insert(
                topic.clone(),
                Arc::new(TopicLog::new(topic, Some(segment), recovered)),
            );
        }

        Ok(Self {
            config,
            topics: RwLock::new(topics),
            creating: Mutex::new(()),
            listener: RwLock::new(None),
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    /// Register the callback run after every append
    pub fn set_listener(&self, listener: Arc<dyn AppendListener>) {
        if let Ok(mut slot) = self.listener.write() {
            *slot = Some(listener);
        }
    }

    fn existing(&self, topic: &TopicKey) -> Option<Arc<TopicLog>> {
        self.topics
            .read()
            .ok()
            .and_then(|topics| topics.get(topic).cloned())
    }

    /// Find or create the log for `topic`
    pub async fn topic(&self, topic: &TopicKey) -> RealtimeResult<Arc<TopicLog>> {
        if let Some(log) = self.existing(topic) {
            return Ok(log);
        }

        let _creating = self.creating.lock().await;
        if let Some(log) = self.existing(topic) {
            return Ok(log);
        }

        let log = match &self.config.data_dir {
            Some(dir) => {
                let (segment, recovered) = Segment::open(dir, topic)
                    .await
                    .map_err(|e| RealtimeError::Storage(e.to_string()))?;
                TopicLog::new(topic.clone(), Some(segment), recovered)
            }
            None => TopicLog::new(topic.clone(), None, Vec::new()),
        };
        let log = Arc::new(log);

        self.topics
            .write()
            .map_err(|_| RealtimeError::Internal("Lock poisoned".into()))?
            .insert(topic.clone(), Arc::clone(&log));
        Ok(log)
    }

    /// Append an event to `topic`, durable before this returns.
    ///
    /// The append listener runs before the topic lock is released, so
    /// fan-out for one topic happens in sequence order.
    pub async fn append(
        &self,
        topic: &TopicKey,
        kind: EventKind,
        entity_type: EntityType,
        payload: Value,
    ) -> RealtimeResult<Event> {
        let log = self.topic(topic).await?;
        let mut guard = log.lock().await;
        let event = guard.append(kind, entity_type, payload).await?;

        let listener = self.listener.read().ok().and_then(|l| l.clone());
        if let Some(listener) = listener {
            listener.on_appended(&event);
        }

        drop(guard);
        Ok(event)
    }

    /// Replay events of `topic` after `after_sequence`.
    ///
    /// Fails with `NotFound` when the cursor is older than the retained
    /// window or newer than anything this log has committed.
    pub fn read_from(
        &self,
        topic: &TopicKey,
        after_sequence: u64,
        limit: usize,
    ) -> RealtimeResult<Vec<Event>> {
        match self.existing(topic) {
            Some(log) => log.read_from(after_sequence, limit),
            None => TopicWindow::default().read_from(topic, after_sequence, limit),
        }
    }

    /// Last committed sequence of `topic` (0 if none)
    pub fn head(&self, topic: &TopicKey) -> u64 {
        self.existing(topic).map(|log| log.head()).unwrap_or(0)
    }

    /// Oldest readable sequence of `topic`
    pub fn oldest_retained(&self, topic: &TopicKey) -> u64 {
        self.existing(topic)
            .map(|log| log.oldest_retained())
            .unwrap_or(1)
    }

    /// Known topics
    pub fn topics(&self) -> Vec<TopicKey> {
        let mut topics: Vec<TopicKey> = self
            .topics
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Number of known topics
    pub fn topic_count(&self) -> usize {
        self.topics.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Apply retention to every topic.
    ///
    /// A topic keeps its last `retention_events` events or everything
    /// younger than `retention_age`, whichever keeps more.
    pub async fn prune(&self, now: DateTime<Utc>) -> RealtimeResult<usize> {
        let logs: Vec<Arc<TopicLog>> = self
            .topics
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();

        let mut total = 0;
        for log in logs {
            let mut guard = log.lock().await;
            let pruned = guard.prune(&self.config, now).await?;
            if pruned > 0 {
                tracing::debug!(
                    topic = %log.topic(),
                    pruned,
                    oldest_retained = log.oldest_retained(),
                    "pruned topic"
                );
            }
            total += pruned;
        }
        Ok(total)
    }
}
