//! # Topic Registry
//!
//! Maps each topic to the sessions subscribed to it, plus the reverse index
//! from session to topics. The registry holds ids only; sessions own their
//! subscriptions and cursors. Locking is per topic and per session.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{RealtimeError, RealtimeResult};
use super::topic::TopicKey;

/// A session's interest in one topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Owning session
    pub session_id: Uuid,

    /// Subscribed topic
    pub topic: TopicKey,

    /// Last sequence delivered to the session
    pub cursor: u64,

    /// When the subscription was created
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Create a subscription starting after `cursor`
    pub fn new(session_id: Uuid, topic: TopicKey, cursor: u64) -> Self {
        Self {
            session_id,
            topic,
            cursor,
            created_at: Utc::now(),
        }
    }
}

/// Sessions on one topic
type TopicSubscribers = Arc<RwLock<HashSet<Uuid>>>;

/// Topics of one session
type SessionTopics = Arc<Mutex<HashSet<TopicKey>>>;

/// Registry of topic subscribers.
///
/// Each topic and each session has its own lock. The outer maps are only
/// held to find or create an entry, and are written only when an entry
/// appears or empties.
///
/// Lock order: a session's entry before a topic's entry.
#[derive(Debug)]
pub struct TopicRegistry {
    by_topic: RwLock<HashMap<TopicKey, TopicSubscribers>>,
    by_session: RwLock<HashMap<Uuid, SessionTopics>>,

    /// Maximum subscriptions per session
    max_per_session: usize,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new(100)
    }
}

fn poisoned<T>(_: T) -> RealtimeError {
    RealtimeError::Internal("Lock poisoned".into())
}

impl TopicRegistry {
    /// Create a new registry
    pub fn new(max_per_session: usize) -> Self {
        Self {
            by_topic: RwLock::new(HashMap::new()),
            by_session: RwLock::new(HashMap::new()),
            max_per_session,
        }
    }

    /// Configured per-session limit
    pub fn max_per_session(&self) -> usize {
        self.max_per_session
    }

    /// Add `session_id` to the topic's set.
    ///
    /// The insert happens while the outer map is still held, so a
    /// concurrent removal of an emptied entry cannot orphan it.
    fn add_subscriber(&self, topic: &TopicKey, session_id: Uuid) -> RealtimeResult<()> {
        {
            let topics = self.by_topic.read().map_err(poisoned)?;
            if let Some(entry) = topics.get(topic) {
                entry.write().map_err(poisoned)?.insert(session_id);
                return Ok(());
            }
        }
        let mut topics = self.by_topic.write().map_err(poisoned)?;
        topics
            .entry(topic.clone())
            .or_default()
            .write()
            .map_err(poisoned)?
            .insert(session_id);
        Ok(())
    }

    fn remove_subscriber(&self, topic: &TopicKey, session_id: Uuid) {
        let emptied = {
            let Ok(topics) = self.by_topic.read() else {
                return;
            };
            let Some(entry) = topics.get(topic) else {
                return;
            };
            let Ok(mut sessions) = entry.write() else {
                return;
            };
            sessions.remove(&session_id);
            sessions.is_empty()
        };

        if emptied {
            if let Ok(mut topics) = self.by_topic.write() {
                let still_empty = topics
                    .get(topic)
                    .map(|entry| entry.read().map(|s| s.is_empty()).unwrap_or(false))
                    .unwrap_or(false);
                if still_empty {
                    topics.remove(topic);
                }
            }
        }
    }

    fn drop_session_if_empty(&self, session_id: Uuid) {
        if let Ok(mut sessions) = self.by_session.write() {
            let empty = sessions
                .get(&session_id)
                .map(|entry| entry.lock().map(|t| t.is_empty()).unwrap_or(false))
                .unwrap_or(false);
            if empty {
                sessions.remove(&session_id);
            }
        }
    }

    /// Register `session_id` on `topic`.
    ///
    /// Returns `false` if it was already registered.
    pub fn register(&self, session_id: Uuid, topic: &TopicKey) -> RealtimeResult<bool> {
        {
            let sessions = self.by_session.read().map_err(poisoned)?;
            if let Some(entry) = sessions.get(&session_id) {
                return self.register_in(entry, session_id, topic);
            }
        }

        let mut sessions = self.by_session.write().map_err(poisoned)?;
        let result = self.register_in(sessions.entry(session_id).or_default(), session_id, topic);
        if result.is_err() {
            let empty = sessions
                .get(&session_id)
                .map(|entry| entry.lock().map(|t| t.is_empty()).unwrap_or(false))
                .unwrap_or(false);
            if empty {
                sessions.remove(&session_id);
            }
        }
        result
    }

    /// Caller holds the session map, so the entry cannot be removed meanwhile
    fn register_in(
        &self,
        entry: &SessionTopics,
        session_id: Uuid,
        topic: &TopicKey,
    ) -> RealtimeResult<bool> {
        let mut topics = entry.lock().map_err(poisoned)?;
        if topics.contains(topic) {
            return Ok(false);
        }
        if topics.len() >= self.max_per_session {
            return Err(RealtimeError::TooManySubscriptions(self.max_per_session));
        }

        self.add_subscriber(topic, session_id)?;
        topics.insert(topic.clone());
        Ok(true)
    }

    /// Remove `session_id` from `topic`; returns whether it was registered.
    pub fn unregister(&self, session_id: Uuid, topic: &TopicKey) -> bool {
        let entry = match self.by_session.read() {
            Ok(sessions) => sessions.get(&session_id).cloned(),
            Err(_) => return false,
        };
        let Some(entry) = entry else {
            self.remove_subscriber(topic, session_id);
            return false;
        };

        let (removed, emptied) = {
            let Ok(mut topics) = entry.lock() else {
                return false;
            };
            let removed = topics.remove(topic);
            self.remove_subscriber(topic, session_id);
            (removed, topics.is_empty())
        };

        if emptied {
            self.drop_session_if_empty(session_id);
        }
        removed
    }

    /// Remove every registration of `session_id`, returning the topics released
    pub fn unregister_all(&self, session_id: Uuid) -> Vec<TopicKey> {
        let entry = match self.by_session.write() {
            Ok(mut sessions) => sessions.remove(&session_id),
            Err(_) => return Vec::new(),
        };
        let Some(entry) = entry else {
            return Vec::new();
        };

        let mut released: Vec<TopicKey> = match entry.lock() {
            Ok(mut topics) => topics.drain().collect(),
            Err(_) => return Vec::new(),
        };
        for topic in &released {
            self.remove_subscriber(topic, session_id);
        }

        released.sort();
        released
    }

    /// Sessions currently subscribed to `topic`
    pub fn subscribers_of(&self, topic: &TopicKey) -> HashSet<Uuid> {
        let entry = match self.by_topic.read() {
            Ok(topics) => topics.get(topic).cloned(),
            Err(_) => None,
        };
        entry
            .and_then(|entry| entry.read().ok().map(|sessions| sessions.clone()))
            .unwrap_or_default()
    }

    /// Topics `session_id` is subscribed to
    pub fn topics_of(&self, session_id: Uuid) -> Vec<TopicKey> {
        let entry = match self.by_session.read() {
            Ok(sessions) => sessions.get(&session_id).cloned(),
            Err(_) => None,
        };
        let mut topics: Vec<TopicKey> = entry
            .and_then(|entry| entry.lock().ok().map(|t| t.iter().cloned().collect()))
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Whether `session_id` is registered on `topic`
    pub fn is_registered(&self, session_id: Uuid, topic: &TopicKey) -> bool {
        let entry = match self.by_session.read() {
            Ok(sessions) => sessions.get(&session_id).cloned(),
            Err(_) => None,
        };
        entry
            .and_then(|entry| entry.lock().ok().map(|t| t.contains(topic)))
            .unwrap_or(false)
    }

    /// Number of topics with at least one subscriber
    pub fn topic_count(&self) -> usize {
        self.by_topic.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Total number of registrations
    pub fn len(&self) -> usize {
        let entries: Vec<SessionTopics> = match self.by_session.read() {
            Ok(sessions) => sessions.values().cloned().collect(),
            Err(_) => return 0,
        };
        entries
            .iter()
            .filter_map(|entry| entry.lock().ok().map(|t| t.len()))
            .sum()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> TopicKey {
        TopicKey::Channel(Uuid::new_v4())
    }

    #[test]
    fn test_register_unregister() {
        let registry = TopicRegistry::default();
        let session = Uuid::new_v4();
        let topic = channel();

        assert!(registry.register(session, &topic).unwrap());
        assert_eq!(registry.len(), 1);
        assert!(registry.subscribers_of(&topic).contains(&session));

        assert!(registry.unregister(session, &topic));
        assert!(registry.is_empty());
        assert!(registry.subscribers_of(&topic).is_empty());
        assert_eq!(registry.topic_count(), 0);
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = TopicRegistry::default();
        let session = Uuid::new_v4();
        let topic = channel();

        assert!(registry.register(session, &topic).unwrap());
        assert!(!registry.register(session, &topic).unwrap());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_subscription_limit() {
        let registry = TopicRegistry::new(2);
        let session = Uuid::new_v4();

        registry.register(session, &channel()).unwrap();
        let kept = channel();
        registry.register(session, &kept).unwrap();

        assert!(matches!(
            registry.register(session, &channel()),
            Err(RealtimeError::TooManySubscriptions(2))
        ));
        // Re-registering an existing topic is not a new subscription
        assert!(!registry.register(session, &kept).unwrap());
    }

    #[test]
    fn test_unregister_all() {
        let registry = TopicRegistry::default();
        let session = Uuid::new_v4();
        let other = Uuid::new_v4();
        let shared = channel();

        for _ in 0..4 {
            registry.register(session, &channel()).unwrap();
        }
        registry.register(session, &shared).unwrap();
        registry.register(other, &shared).unwrap();

        let released = registry.unregister_all(session);
        assert_eq!(released.len(), 5);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.subscribers_of(&shared).len(), 1);
        assert!(registry.topics_of(session).is_empty());
    }

    #[test]
    fn test_topics_lock_independently() {
        let registry = TopicRegistry::default();
        let busy = channel();
        let quiet = channel();
        let session = Uuid::new_v4();
        registry.register(session, &busy).unwrap();
        registry.register(session, &quiet).unwrap();

        // Hold one topic's entry as a writer would
        let entry = registry.by_topic.read().unwrap().get(&busy).cloned().unwrap();
        let _held = entry.write().unwrap();

        let other = Uuid::new_v4();
        assert!(registry.register(other, &quiet).unwrap());
        assert_eq!(registry.subscribers_of(&quiet).len(), 2);
        assert!(registry.unregister(other, &quiet));
        assert!(registry.is_registered(session, &quiet));
    }

    #[test]
    fn test_concurrent_registrations_stay_consistent() {
        let registry = Arc::new(TopicRegistry::default());
        let topics: Vec<TopicKey> = (0..16).map(|_| channel()).collect();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let topics = topics.clone();
                std::thread::spawn(move || {
                    let session = Uuid::new_v4();
                    for _ in 0..20 {
                        for topic in &topics {
                            registry.register(session, topic).unwrap();
                        }
                        for topic in topics.iter().step_by(2) {
                            registry.unregister(session, topic);
                        }
                    }
                    session
                })
            })
            .collect();
        let sessions: Vec<Uuid> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.len(), 8 * 8);
        assert_eq!(registry.topic_count(), 8);
        for (i, topic) in topics.iter().enumerate() {
            let expected = if i % 2 == 0 { 0 } else { 8 };
            assert_eq!(registry.subscribers_of(topic).len(), expected);
        }

        for session in sessions {
            assert_eq!(registry.unregister_all(session).len(), 8);
        }
        assert!(registry.is_empty());
        assert_eq!(registry.topic_count(), 0);
    }

    #[test]
    fn test_unregister_unknown() {
        let registry = TopicRegistry::default();
        assert!(!registry.unregister(Uuid::new_v4(), &channel()));
    }
}
