//! # Realtime Hub
//!
//! Wires the event log, topic registry, sessions, dispatcher and presence
//! tracker together behind the operations transports call.
//!
//! Lock order: a topic's log lock is taken before any session or registry
//! lock, never the other way round.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::dispatcher::Dispatcher;
use super::errors::{RealtimeError, RealtimeResult};
use super::event::{
    EntityType, Event, EventKind, MembershipPayload, MessagePayload, OutboundFrame,
    PresencePayload, PresenceState, ResyncReason,
};
use super::event_log::{EventLog, EventLogConfig, TopicGuard};
use super::presence::{PresenceConfig, PresenceTracker};
use super::session::{DeliveryOutcome, Session, SessionConfig, SessionState};
use super::subscription::{Subscription, TopicRegistry};
use super::topic::TopicKey;
use crate::auth::{IdentityProvider, MembershipStore};
use crate::observability::{MetricsRegistry, MetricsSnapshot};
use crate::store::RecordStore;

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub log: EventLogConfig,
    pub session: SessionConfig,
    pub presence: PresenceConfig,

    /// Upper bound on one `resume_from`
    pub replay_timeout: StdDuration,

    /// Events read per replay batch
    pub replay_batch_limit: usize,

    pub max_subscriptions_per_session: usize,

    /// How often retention runs
    pub prune_interval: StdDuration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            log: EventLogConfig::default(),
            session: SessionConfig::default(),
            presence: PresenceConfig::default(),
            replay_timeout: StdDuration::from_secs(5),
            replay_batch_limit: 500,
            max_subscriptions_per_session: 100,
            prune_interval: StdDuration::from_secs(300),
        }
    }
}

/// Authoritative state handed to a client that must start over
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub topic: TopicKey,

    /// Head of the topic read before the body was fetched; live delivery
    /// continues after it
    pub cursor: u64,

    pub body: Value,
}

/// Point-in-time view for `/realtime/stats`
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub sessions: usize,
    pub topics: usize,
    pub subscribed_topics: usize,
    pub subscriptions: usize,
    pub online_users: usize,
    pub metrics: MetricsSnapshot,
}

/// External collaborators the hub consults
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub membership: Arc<dyn MembershipStore>,
    pub records: Arc<dyn RecordStore>,
}

/// Serializes one user's presence announcements and remembers the last
/// state announced
type PresenceGate = Arc<tokio::sync::Mutex<Option<PresenceState>>>;

/// The fan-out core
pub struct RealtimeHub {
    config: HubConfig,
    log: Arc<EventLog>,
    registry: Arc<TopicRegistry>,
    dispatcher: Arc<Dispatcher>,
    presence: PresenceTracker,
    presence_gates: std::sync::Mutex<HashMap<Uuid, PresenceGate>>,
    collaborators: Collaborators,
    metrics: Arc<MetricsRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for RealtimeHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeHub")
            .field("config", &self.config)
            .field("sessions", &self.dispatcher.session_count())
            .finish()
    }
}

impl RealtimeHub {
    /// Open the hub, recovering durable topics if a data directory is set
    pub async fn open(
        config: HubConfig,
        collaborators: Collaborators,
        metrics: Arc<MetricsRegistry>,
    ) -> RealtimeResult<Arc<Self>> {
        let log = Arc::new(EventLog::open(config.log.clone()).await?);
        let registry = Arc::new(TopicRegistry::new(config.max_subscriptions_per_session));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::clone(&metrics)));
        log.set_listener(dispatcher.clone());

        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::info!(
            topics = log.topic_count(),
            durable = config.log.data_dir.is_some(),
            "realtime hub opened"
        );

        Ok(Arc::new(Self {
            presence: PresenceTracker::with_config(config.presence.clone()),
            presence_gates: std::sync::Mutex::new(HashMap::new()),
            config,
            log,
            registry,
            dispatcher,
            collaborators,
            metrics,
            shutdown_tx,
        }))
    }

    /// Configuration in effect
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The underlying event log
    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    /// Presence tracker
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Shared metrics
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    // ==================
    // Sessions
    // ==================

    /// Resolve a credential to a user id
    pub async fn authenticate(&self, credential: &str) -> RealtimeResult<Uuid> {
        self.collaborators
            .identity
            .current_identity(credential)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "credential rejected");
                RealtimeError::Unauthenticated
            })
    }

    /// Authenticate `credential` and open a session for it
    pub async fn connect(&self, credential: &str) -> RealtimeResult<Arc<Session>> {
        let user_id = self.authenticate(credential).await?;

        let session = Arc::new(Session::new(user_id, self.config.session));
        self.dispatcher.connect(Arc::clone(&session));
        session.activate()?;
        self.metrics.increment_sessions_opened();

        tracing::info!(session_id = %session.id(), user_id = %user_id, "session connected");

        if let Some(transition) = self.presence.heartbeat(user_id) {
            self.publish_presence(transition).await;
        }
        Ok(session)
    }

    /// Look up a live session
    pub fn session(&self, session_id: Uuid) -> RealtimeResult<Arc<Session>> {
        self.dispatcher
            .session(session_id)
            .ok_or_else(|| RealtimeError::SessionNotFound(session_id.to_string()))
    }

    /// Outbound frames for a session
    pub fn events(
        &self,
        session_id: Uuid,
    ) -> RealtimeResult<impl Stream<Item = OutboundFrame> + Send + 'static> {
        Ok(self.session(session_id)?.events())
    }

    /// Close a session and release its subscriptions
    pub async fn disconnect(&self, session_id: Uuid) -> RealtimeResult<()> {
        let session = self.session(session_id)?;
        session.begin_close();
        let released = self.registry.unregister_all(session_id);
        session.finish_close();
        self.dispatcher.disconnect(session_id);
        self.metrics.increment_sessions_closed();

        tracing::info!(
            session_id = %session_id,
            user_id = %session.user_id(),
            released = released.len(),
            "session closed"
        );

        let user_id = session.user_id();
        let still_connected = self
            .dispatcher
            .sessions()
            .iter()
            .any(|s| s.user_id() == user_id && s.state().is_open());
        if !still_connected {
            if let Some(transition) = self.presence.go_offline(user_id) {
                self.publish_presence(transition).await;
            }
        }
        Ok(())
    }

    // ==================
    // Subscriptions
    // ==================

    /// Fail with `Forbidden` unless `user_id` may read `topic`.
    ///
    /// A user's own membership topic is readable only by that user.
    pub async fn authorize(&self, user_id: Uuid, topic: &TopicKey) -> RealtimeResult<()> {
        if let TopicKey::UserMembership(owner) = topic {
            if *owner != user_id {
                return Err(RealtimeError::Forbidden(topic.clone()));
            }
        }

        let allowed = self
            .collaborators
            .membership
            .is_member(user_id, topic)
            .await
            .map_err(|e| RealtimeError::Collaborator(e.to_string()))?;
        if allowed {
            Ok(())
        } else {
            Err(RealtimeError::Forbidden(topic.clone()))
        }
    }

    /// `authorize` on behalf of a session.
    ///
    /// A `Forbidden` answer also drops whatever subscription the session
    /// still holds on `topic`, so a revoked member stops receiving it.
    async fn authorize_session(&self, session: &Session, topic: &TopicKey) -> RealtimeResult<()> {
        let result = self.authorize(session.user_id(), topic).await;
        if let Err(RealtimeError::Forbidden(_)) = &result {
            self.metrics.increment_forbidden_subscribes();
            let registered = self.registry.unregister(session.id(), topic);
            let owned = session.remove_subscription(topic).is_some();
            tracing::info!(
                session_id = %session.id(),
                user_id = %session.user_id(),
                topic = %topic,
                revoked = registered || owned,
                "topic access forbidden"
            );
        }
        result
    }

    /// Authorize and register while the caller holds the topic lock
    fn attach(
        &self,
        session: &Session,
        topic: &TopicKey,
        guard: &TopicGuard<'_>,
    ) -> RealtimeResult<Subscription> {
        let added = self.registry.register(session.id(), topic)?;
        match session.add_subscription(topic, guard.head()) {
            Ok(subscription) => Ok(subscription),
            Err(e) => {
                if added {
                    self.registry.unregister(session.id(), topic);
                }
                Err(e)
            }
        }
    }

    /// Subscribe a session to a topic.
    ///
    /// Membership is checked on every call. Subscribing again returns the
    /// existing subscription unchanged.
    pub async fn subscribe(
        &self,
        session_id: Uuid,
        topic: &TopicKey,
    ) -> RealtimeResult<Subscription> {
        let session = self.session(session_id)?;
        session.ensure_open()?;

        self.authorize_session(&session, topic).await?;

        let log = self.log.topic(topic).await?;
        let guard = log.lock().await;
        let subscription = self.attach(&session, topic, &guard)?;
        drop(guard);

        self.metrics.increment_subscribes();
        tracing::debug!(
            session_id = %session_id,
            topic = %topic,
            cursor = subscription.cursor,
            "subscribed"
        );
        Ok(subscription)
    }

    /// Drop a session's subscription to a topic
    pub fn unsubscribe(&self, session_id: Uuid, topic: &TopicKey) -> RealtimeResult<()> {
        let session = self.session(session_id)?;
        let registered = self.registry.unregister(session_id, topic);
        let owned = session.remove_subscription(topic).is_some();
        if !registered && !owned {
            return Err(RealtimeError::NotSubscribed(topic.clone()));
        }
        tracing::debug!(session_id = %session_id, topic = %topic, "unsubscribed");
        Ok(())
    }

    // ==================
    // Publishing
    // ==================

    /// Append an event and fan it out
    pub async fn publish(
        &self,
        topic: &TopicKey,
        kind: EventKind,
        entity_type: EntityType,
        payload: Value,
    ) -> RealtimeResult<Event> {
        match self.log.append(topic, kind, entity_type, payload).await {
            Ok(event) => Ok(event),
            Err(e) => {
                self.metrics.increment_append_failures();
                tracing::error!(topic = %topic, error = %e, "append failed");
                Err(e)
            }
        }
    }

    /// Publish a message change onto its channel or conversation
    pub async fn publish_message(
        &self,
        topic: &TopicKey,
        kind: EventKind,
        message: &MessagePayload,
    ) -> RealtimeResult<Event> {
        let payload = serde_json::to_value(message)
            .map_err(|e| RealtimeError::InvalidMessage(e.to_string()))?;
        self.publish(topic, kind, EntityType::Message, payload).await
    }

    /// Publish a membership change onto the topic and the member's sidebar
    pub async fn publish_membership(
        &self,
        kind: EventKind,
        membership: &MembershipPayload,
    ) -> RealtimeResult<Vec<Event>> {
        let payload = serde_json::to_value(membership)
            .map_err(|e| RealtimeError::InvalidMessage(e.to_string()))?;

        let mut events = Vec::with_capacity(2);
        for topic in [
            membership.topic.clone(),
            TopicKey::UserMembership(membership.user_id),
        ] {
            events.push(
                self.publish(&topic, kind, EntityType::Membership, payload.clone())
                    .await?,
            );
        }
        Ok(events)
    }

    fn presence_gate(&self, user_id: Uuid) -> PresenceGate {
        match self.presence_gates.lock() {
            Ok(mut gates) => Arc::clone(gates.entry(user_id).or_default()),
            Err(_) => PresenceGate::default(),
        }
    }

    /// Announce a presence change on the user's presence topics.
    ///
    /// Changes decided concurrently (a sweep and a heartbeat) can reach this
    /// point in either order. Under the user's gate only the tracker's
    /// current state is announced, and never twice in a row.
    async fn publish_presence(&self, transition: PresencePayload) {
        let gate = self.presence_gate(transition.user_id);
        let mut announced = gate.lock().await;

        let current = self.presence.state_of(transition.user_id);
        if current != Some(transition.state) || *announced == Some(transition.state) {
            tracing::debug!(
                user_id = %transition.user_id,
                state = ?transition.state,
                current = ?current,
                "presence change superseded"
            );
            return;
        }

        self.metrics.increment_presence_transitions();
        tracing::info!(
            user_id = %transition.user_id,
            state = ?transition.state,
            "presence changed"
        );

        let topics = match self
            .collaborators
            .membership
            .presence_topics(transition.user_id)
            .await
        {
            Ok(topics) => topics,
            Err(e) => {
                tracing::warn!(user_id = %transition.user_id, error = %e, "presence topics unavailable");
                return;
            }
        };
        let payload = match serde_json::to_value(&transition) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "presence payload encoding failed");
                return;
            }
        };

        for topic in topics {
            // A failed append is already logged and counted
            let _ = self
                .publish(&topic, EventKind::Updated, EntityType::Presence, payload.clone())
                .await;
        }
        *announced = Some(transition.state);
    }

    // ==================
    // Replay and resync
    // ==================

    /// Replay `topic` after `cursor` to the session, subscribing if needed.
    ///
    /// Registration and replay happen under the topic lock, so no live
    /// event can interleave with the replayed ones. Each replayed event
    /// waits for transport room; a reader too slow to finish within
    /// `replay_timeout` degrades the session. Returns the number of events
    /// handed to the transport.
    pub async fn resume_from(
        &self,
        session_id: Uuid,
        topic: &TopicKey,
        cursor: u64,
    ) -> RealtimeResult<usize> {
        let session = self.session(session_id)?;
        session.ensure_open()?;
        self.authorize_session(&session, topic).await?;
        self.metrics.increment_replays();

        let log = self.log.topic(topic).await?;
        let limit = self.config.replay_batch_limit.max(1);

        let replay = async {
            let guard = log.lock().await;
            self.attach(&session, topic, &guard)?;
            session.set_cursor(topic, cursor)?;

            let mut after = cursor;
            let mut replayed = 0;
            loop {
                let batch = match guard.read_from(after, limit) {
                    Ok(batch) => batch,
                    Err(RealtimeError::NotFound {
                        topic,
                        requested,
                        oldest_retained,
                    }) => {
                        session.set_cursor(&topic, guard.head())?;
                        session.signal_resync(&topic, ResyncReason::Pruned);
                        self.metrics.increment_resyncs_signaled();
                        return Err(RealtimeError::NotFound {
                            topic,
                            requested,
                            oldest_retained,
                        });
                    }
                    Err(e) => return Err(e),
                };
                let Some(last) = batch.last().map(|e| e.sequence) else {
                    break;
                };

                for event in &batch {
                    match session.replay(event).await {
                        DeliveryOutcome::Delivered => replayed += 1,
                        DeliveryOutcome::Duplicate => {}
                        _ => return Ok(replayed),
                    }
                }
                after = last;
            }
            Ok::<usize, RealtimeError>(replayed)
        };

        match tokio::time::timeout(self.config.replay_timeout, replay).await {
            Ok(Ok(replayed)) => {
                tracing::debug!(
                    session_id = %session_id,
                    topic = %topic,
                    cursor,
                    replayed,
                    "resumed"
                );
                Ok(replayed)
            }
            Ok(Err(e)) => {
                tracing::info!(session_id = %session_id, topic = %topic, error = %e, "resume failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(session_id = %session_id, topic = %topic, "replay timed out");
                self.metrics.increment_replay_timeouts();
                self.metrics.increment_resyncs_signaled();
                session.degrade(ResyncReason::Timeout);
                Err(RealtimeError::ReplayTimeout(topic.clone()))
            }
        }
    }

    fn heads_of(&self, session: &Session) -> HashMap<TopicKey, u64> {
        session
            .subscriptions()
            .into_iter()
            .map(|s| {
                let head = self.log.head(&s.topic);
                (s.topic, head)
            })
            .collect()
    }

    /// `Degraded -> Active`: every cursor restarts from the topic's head
    pub fn acknowledge_resync(&self, session_id: Uuid) -> RealtimeResult<()> {
        let session = self.session(session_id)?;
        let heads = self.heads_of(&session);
        session.acknowledge_resync(&heads)?;
        self.metrics.increment_resyncs_acknowledged();
        tracing::info!(session_id = %session_id, topics = heads.len(), "resync acknowledged");
        Ok(())
    }

    /// Snapshot of `topic` for a client that must discard its state.
    ///
    /// Also acknowledges a pending session-wide resync.
    pub async fn resync(&self, session_id: Uuid, topic: &TopicKey) -> RealtimeResult<Snapshot> {
        let session = self.session(session_id)?;
        session.ensure_open()?;
        self.authorize_session(&session, topic).await?;

        if session.state() == SessionState::Degraded {
            self.acknowledge_resync(session_id)?;
        }

        let log = self.log.topic(topic).await?;
        let cursor = {
            let guard = log.lock().await;
            self.attach(&session, topic, &guard)?;
            let head = guard.head();
            session.set_cursor(topic, head)?;
            head
        };

        let body = self
            .collaborators
            .records
            .snapshot(topic)
            .await
            .map_err(|e| RealtimeError::Collaborator(e.to_string()))?;

        tracing::debug!(session_id = %session_id, topic = %topic, cursor, "snapshot served");
        Ok(Snapshot {
            topic: topic.clone(),
            cursor,
            body,
        })
    }

    // ==================
    // Presence
    // ==================

    /// Heartbeat from a session
    pub async fn heartbeat(&self, session_id: Uuid) -> RealtimeResult<()> {
        let session = self.session(session_id)?;
        session.ensure_open()?;
        let now = Utc::now();
        session.touch(now);

        if let Some(transition) = self.presence.heartbeat_at(session.user_id(), now) {
            self.publish_presence(transition).await;
        }
        Ok(())
    }

    /// Explicit sign-off for a user
    pub async fn go_offline(&self, user_id: Uuid) {
        if let Some(transition) = self.presence.go_offline(user_id) {
            self.publish_presence(transition).await;
        }
    }

    /// Current presence of a user
    pub fn presence_of(&self, user_id: Uuid) -> PresenceState {
        self.presence
            .state_of(user_id)
            .unwrap_or(PresenceState::Offline)
    }

    /// Demote stale users and publish the transitions
    pub async fn sweep_presence(&self, now: DateTime<Utc>) -> usize {
        let transitions = self.presence.sweep_at(now);
        let count = transitions.len();
        for transition in transitions {
            self.publish_presence(transition).await;
        }
        if count > 0 {
            tracing::info!(demoted = count, "presence sweep");
        }
        count
    }

    // ==================
    // Maintenance
    // ==================

    /// Apply retention to every topic
    pub async fn prune(&self, now: DateTime<Utc>) -> RealtimeResult<usize> {
        let pruned = self.log.prune(now).await?;
        self.metrics.add_events_pruned(pruned as u64);
        if pruned > 0 {
            tracing::info!(pruned, "retention applied");
        }
        Ok(pruned)
    }

    /// Counters and sizes
    pub fn stats(&self) -> HubStats {
        HubStats {
            sessions: self.dispatcher.session_count(),
            topics: self.log.topic_count(),
            subscribed_topics: self.registry.topic_count(),
            subscriptions: self.registry.len(),
            online_users: self.presence.online_users().len(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Start the presence sweeper and the retention pruner
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let sweep_every = self
            .config
            .presence
            .sweep_interval
            .to_std()
            .unwrap_or(StdDuration::from_secs(30));

        let sweeper = {
            let hub = Arc::clone(self);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            hub.sweep_presence(Utc::now()).await;
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
                tracing::debug!("presence sweeper stopped");
            })
        };

        let pruner = {
            let hub = Arc::clone(self);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let prune_every = self.config.prune_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(prune_every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = hub.prune(Utc::now()).await {
                                tracing::error!(error = %e, "retention failed");
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
                tracing::debug!("retention pruner stopped");
            })
        };

        vec![sweeper, pruner]
    }

    /// Stop background tasks and close every session
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        for session in self.dispatcher.sessions() {
            let _ = self.disconnect(session.id()).await;
        }
        tracing::info!("realtime hub shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{InMemoryMembership, JwtConfig, JwtIdentityProvider, JwtManager};
    use crate::store::InMemoryRecordStore;
    use futures_util::StreamExt;
    use serde_json::json;

    struct Fixture {
        hub: Arc<RealtimeHub>,
        jwt: JwtManager,
        membership: Arc<InMemoryMembership>,
        records: Arc<InMemoryRecordStore>,
    }

    async fn fixture(config: HubConfig) -> Fixture {
        let jwt = JwtManager::new(JwtConfig::default());
        let membership = Arc::new(InMemoryMembership::new());
        let records = Arc::new(InMemoryRecordStore::new());
        let hub = RealtimeHub::open(
            config,
            Collaborators {
                identity: Arc::new(JwtIdentityProvider::new(jwt.clone())),
                membership: membership.clone(),
                records: records.clone(),
            },
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap();
        Fixture {
            hub,
            jwt,
            membership,
            records,
        }
    }

    async fn connect(f: &Fixture, user: Uuid) -> Arc<Session> {
        let token = f.jwt.generate_token(user).unwrap();
        f.hub.connect(&token).await.unwrap()
    }

    async fn post(hub: &RealtimeHub, topic: &TopicKey, n: u64) -> Event {
        hub.publish(topic, EventKind::Created, EntityType::Message, json!({"n": n}))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_credential() {
        let f = fixture(HubConfig::default()).await;
        assert!(matches!(
            f.hub.connect("not-a-token").await,
            Err(RealtimeError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_checks_membership() {
        let f = fixture(HubConfig::default()).await;
        let user = Uuid::new_v4();
        let topic = TopicKey::Channel(Uuid::new_v4());
        let session = connect(&f, user).await;

        assert!(matches!(
            f.hub.subscribe(session.id(), &topic).await,
            Err(RealtimeError::Forbidden(_))
        ));
        assert_eq!(session.state(), SessionState::Active);

        f.membership.grant(user, &topic);
        let sub = f.hub.subscribe(session.id(), &topic).await.unwrap();
        assert_eq!(sub.cursor, 0);
    }

    #[tokio::test]
    async fn test_subscribe_starts_at_head() {
        let f = fixture(HubConfig::default()).await;
        let user = Uuid::new_v4();
        let topic = TopicKey::Channel(Uuid::new_v4());
        f.membership.grant(user, &topic);

        post(&f.hub, &topic, 1).await;
        post(&f.hub, &topic, 2).await;

        let session = connect(&f, user).await;
        let sub = f.hub.subscribe(session.id(), &topic).await.unwrap();
        assert_eq!(sub.cursor, 2);

        post(&f.hub, &topic, 3).await;
        let mut events = Box::pin(f.hub.events(session.id()).unwrap());
        let frame = events.next().await.unwrap();
        assert_eq!(frame.as_event().unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn test_other_users_membership_topic_is_forbidden() {
        let f = fixture(HubConfig::default()).await;
        let user = Uuid::new_v4();
        let session = connect(&f, user).await;

        f.hub
            .subscribe(session.id(), &TopicKey::UserMembership(user))
            .await
            .unwrap();
        assert!(matches!(
            f.hub
                .subscribe(session.id(), &TopicKey::UserMembership(Uuid::new_v4()))
                .await,
            Err(RealtimeError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_resync_returns_snapshot_at_head() {
        let f = fixture(HubConfig::default()).await;
        let user = Uuid::new_v4();
        let topic = TopicKey::Conversation(Uuid::new_v4());
        f.membership.grant(user, &topic);
        f.records.put(&topic, json!([{"id": "m1"}]));

        for n in 1..=3 {
            post(&f.hub, &topic, n).await;
        }

        let session = connect(&f, user).await;
        let snapshot = f.hub.resync(session.id(), &topic).await.unwrap();
        assert_eq!(snapshot.cursor, 3);
        assert_eq!(snapshot.body, json!([{"id": "m1"}]));
        assert_eq!(session.subscription(&topic).unwrap().cursor, 3);
    }

    #[tokio::test]
    async fn test_resync_acknowledges_degraded_session() {
        let f = fixture(HubConfig {
            session: SessionConfig {
                queue_cap: 1,
                transport_buffer: 1,
            },
            ..HubConfig::default()
        })
        .await;
        let user = Uuid::new_v4();
        let topic = TopicKey::Channel(Uuid::new_v4());
        f.membership.grant(user, &topic);

        let session = connect(&f, user).await;
        f.hub.subscribe(session.id(), &topic).await.unwrap();
        for n in 1..=5 {
            post(&f.hub, &topic, n).await;
        }
        assert_eq!(session.state(), SessionState::Degraded);

        let snapshot = f.hub.resync(session.id(), &topic).await.unwrap();
        assert_eq!(snapshot.cursor, 5);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_resume_after_prune_signals_resync() {
        let f = fixture(HubConfig {
            log: EventLogConfig {
                retention_events: 2,
                retention_age: chrono::Duration::seconds(1),
                data_dir: None,
            },
            ..HubConfig::default()
        })
        .await;
        let user = Uuid::new_v4();
        let topic = TopicKey::Channel(Uuid::new_v4());
        f.membership.grant(user, &topic);

        for n in 1..=6 {
            post(&f.hub, &topic, n).await;
        }
        f.hub
            .prune(Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap();

        let session = connect(&f, user).await;
        let result = f.hub.resume_from(session.id(), &topic, 1).await;
        assert!(matches!(
            result,
            Err(RealtimeError::NotFound {
                oldest_retained: 5,
                ..
            })
        ));

        let mut events = Box::pin(f.hub.events(session.id()).unwrap());
        assert_eq!(
            events.next().await.unwrap(),
            OutboundFrame::ResyncRequired {
                topic: Some(topic.clone()),
                reason: ResyncReason::Pruned,
            }
        );
        assert_eq!(session.subscription(&topic).unwrap().cursor, 6);
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let f = fixture(HubConfig::default()).await;
        let user = Uuid::new_v4();
        let topic = TopicKey::Channel(Uuid::new_v4());
        f.membership.grant(user, &topic);

        let session = connect(&f, user).await;
        f.hub.subscribe(session.id(), &topic).await.unwrap();
        assert_eq!(f.hub.presence_of(user), PresenceState::Online);

        f.hub.disconnect(session.id()).await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(f.hub.session(session.id()).is_err());
        assert_eq!(f.hub.stats().subscriptions, 0);
        assert_eq!(f.hub.presence_of(user), PresenceState::Offline);
    }

    #[tokio::test]
    async fn test_presence_published_to_membership_topic() {
        let f = fixture(HubConfig::default()).await;
        let watcher = Uuid::new_v4();
        let watched = Uuid::new_v4();
        let channel = TopicKey::Channel(Uuid::new_v4());
        f.membership.grant(watcher, &channel);
        f.membership.set_presence_topics(watched, vec![channel.clone()]);

        let session = connect(&f, watcher).await;
        f.hub.subscribe(session.id(), &channel).await.unwrap();

        let _other = connect(&f, watched).await;

        let mut events = Box::pin(f.hub.events(session.id()).unwrap());
        let frame = events.next().await.unwrap();
        let event = frame.as_event().unwrap();
        assert_eq!(event.entity_type, EntityType::Presence);
        let payload: PresencePayload = serde_json::from_value(event.payload.clone()).unwrap();
        assert_eq!(payload.user_id, watched);
        assert_eq!(payload.state, PresenceState::Online);
    }

    fn presence_states(hub: &RealtimeHub, topic: &TopicKey) -> Vec<PresenceState> {
        hub.event_log()
            .read_from(topic, 0, 100)
            .unwrap()
            .iter()
            .filter(|e| e.entity_type == EntityType::Presence)
            .map(|e| {
                serde_json::from_value::<PresencePayload>(e.payload.clone())
                    .unwrap()
                    .state
            })
            .collect()
    }

    #[tokio::test]
    async fn test_stale_sweep_change_is_not_announced_after_heartbeat() {
        let f = fixture(HubConfig::default()).await;
        let watched = Uuid::new_v4();
        let channel = TopicKey::Channel(Uuid::new_v4());
        f.membership.set_presence_topics(watched, vec![channel.clone()]);

        let session = connect(&f, watched).await;
        assert_eq!(presence_states(&f.hub, &channel), vec![PresenceState::Online]);

        // The sweep decides Offline but has not announced it yet
        let stale: Vec<PresencePayload> = f
            .hub
            .presence()
            .sweep_at(Utc::now() + chrono::Duration::seconds(120))
            .into_iter()
            .filter(|t| t.user_id == watched)
            .collect();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].state, PresenceState::Offline);

        // A heartbeat lands first, then the sweep's announcement arrives late
        f.hub.heartbeat(session.id()).await.unwrap();
        f.hub.publish_presence(stale[0].clone()).await;

        assert_eq!(f.hub.presence_of(watched), PresenceState::Online);
        let states = presence_states(&f.hub, &channel);
        assert_eq!(states.last(), Some(&PresenceState::Online));
        assert!(!states.contains(&PresenceState::Offline));
    }

    #[tokio::test]
    async fn test_presence_change_is_announced_once() {
        let f = fixture(HubConfig::default()).await;
        let watched = Uuid::new_v4();
        let channel = TopicKey::Channel(Uuid::new_v4());
        f.membership.set_presence_topics(watched, vec![channel.clone()]);

        let session = connect(&f, watched).await;
        f.hub.go_offline(watched).await;
        f.hub.heartbeat(session.id()).await.unwrap();

        let transition = f.hub.presence().snapshot_of(watched).unwrap();
        f.hub
            .publish_presence(PresencePayload {
                user_id: watched,
                state: transition.state,
                last_heartbeat_at: transition.last_heartbeat_at,
            })
            .await;

        assert_eq!(
            presence_states(&f.hub, &channel),
            vec![
                PresenceState::Online,
                PresenceState::Offline,
                PresenceState::Online
            ]
        );
    }

    #[tokio::test]
    async fn test_resume_waits_for_reader_instead_of_overflowing() {
        let f = fixture(HubConfig::default()).await;
        let user = Uuid::new_v4();
        let topic = TopicKey::Channel(Uuid::new_v4());
        f.membership.grant(user, &topic);

        for n in 1..=400 {
            post(&f.hub, &topic, n).await;
        }

        let session = connect(&f, user).await;
        let reader = {
            let events = f.hub.events(session.id()).unwrap();
            tokio::spawn(async move {
                events
                    .take(400)
                    .filter_map(|frame| async move { frame.as_event().map(|e| e.sequence) })
                    .collect::<Vec<u64>>()
                    .await
            })
        };

        let replayed = f.hub.resume_from(session.id(), &topic, 0).await.unwrap();
        assert_eq!(replayed, 400);
        assert_eq!(session.state(), SessionState::Active);

        let sequences = reader.await.unwrap();
        assert_eq!(sequences, (1..=400).collect::<Vec<u64>>());
        assert_eq!(session.subscription(&topic).unwrap().cursor, 400);
    }

    #[tokio::test]
    async fn test_replay_timeout_degrades_session() {
        let f = fixture(HubConfig {
            session: SessionConfig {
                queue_cap: 4,
                transport_buffer: 2,
            },
            replay_timeout: StdDuration::from_millis(50),
            ..HubConfig::default()
        })
        .await;
        let user = Uuid::new_v4();
        let topic = TopicKey::Channel(Uuid::new_v4());
        f.membership.grant(user, &topic);

        for n in 1..=20 {
            post(&f.hub, &topic, n).await;
        }

        let session = connect(&f, user).await;
        assert!(matches!(
            f.hub.resume_from(session.id(), &topic, 0).await,
            Err(RealtimeError::ReplayTimeout(_))
        ));
        assert_eq!(session.state(), SessionState::Degraded);
        assert_eq!(f.hub.metrics().snapshot().replay_timeouts, 1);

        // Live publishing is not held up once the replay gave up
        post(&f.hub, &topic, 21).await;

        let mut events = Box::pin(f.hub.events(session.id()).unwrap());
        assert_eq!(events.next().await.unwrap().as_event().unwrap().sequence, 1);
        assert_eq!(events.next().await.unwrap().as_event().unwrap().sequence, 2);
        assert_eq!(
            events.next().await.unwrap(),
            OutboundFrame::ResyncRequired {
                topic: None,
                reason: ResyncReason::Timeout,
            }
        );
    }

    #[tokio::test]
    async fn test_forbidden_resume_and_resync_drop_subscription() {
        let f = fixture(HubConfig::default()).await;
        let user = Uuid::new_v4();
        let topic = TopicKey::Channel(Uuid::new_v4());
        f.membership.grant(user, &topic);

        let session = connect(&f, user).await;
        f.hub.subscribe(session.id(), &topic).await.unwrap();
        f.membership.revoke(user, &topic);

        assert!(matches!(
            f.hub.resume_from(session.id(), &topic, 0).await,
            Err(RealtimeError::Forbidden(_))
        ));
        assert!(session.subscription(&topic).is_none());
        assert_eq!(f.hub.stats().subscriptions, 0);

        post(&f.hub, &topic, 1).await;
        assert_eq!(session.pending_len(), 0);
        let mut events = Box::pin(f.hub.events(session.id()).unwrap());
        let next = tokio::time::timeout(StdDuration::from_millis(100), events.next()).await;
        assert!(next.is_err());

        // Resync is checked the same way
        f.membership.grant(user, &topic);
        f.hub.subscribe(session.id(), &topic).await.unwrap();
        f.membership.revoke(user, &topic);
        assert!(matches!(
            f.hub.resync(session.id(), &topic).await,
            Err(RealtimeError::Forbidden(_))
        ));
        assert!(session.subscription(&topic).is_none());
        assert_eq!(f.hub.stats().subscriptions, 0);
        assert_eq!(f.hub.metrics().snapshot().forbidden_subscribes, 2);
    }

    #[tokio::test]
    async fn test_publish_membership_reaches_sidebar() {
        let f = fixture(HubConfig::default()).await;
        let user = Uuid::new_v4();
        let channel = TopicKey::Channel(Uuid::new_v4());

        let events = f
            .hub
            .publish_membership(
                EventKind::Created,
                &MembershipPayload {
                    user_id: user,
                    topic: channel.clone(),
                    role: "member".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].topic, channel);
        assert_eq!(events[1].topic, TopicKey::UserMembership(user));
    }
}
