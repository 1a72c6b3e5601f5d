//! # Real-Time Events
//!
//! Change events carried by the per-topic log, their typed payloads, and
//! the frames a session pushes to its client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::topic::TopicKey;

/// What happened to the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// Entity created
    Created,
    /// Entity changed in place
    Updated,
    /// Entity removed
    Deleted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Created => write!(f, "CREATED"),
            EventKind::Updated => write!(f, "UPDATED"),
            EventKind::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Which kind of entity the event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Message,
    Membership,
    Presence,
}

/// A committed change event
///
/// `sequence` is assigned by the event log, strictly increasing and gapless
/// within `topic`. Events are never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position within the topic, starting at 1
    pub sequence: u64,

    /// Delivery scope
    pub topic: TopicKey,

    /// Change kind
    pub kind: EventKind,

    /// Entity type
    pub entity_type: EntityType,

    /// Denormalized summary of the entity; the record store stays authoritative
    pub payload: Value,

    /// When the event was appended
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    /// Build an event for the given slot in a topic
    pub fn new(
        sequence: u64,
        topic: TopicKey,
        kind: EventKind,
        entity_type: EntityType,
        payload: Value,
    ) -> Self {
        Self {
            sequence,
            topic,
            kind,
            entity_type,
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Key consumers de-duplicate on
    pub fn dedup_key(&self) -> (TopicKey, u64) {
        (self.topic.clone(), self.sequence)
    }
}

/// Summary of a chat message, enough to render without a follow-up read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    /// Set for thread replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A membership row for a channel or conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipPayload {
    pub user_id: Uuid,
    pub topic: TopicKey,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "member".to_string()
}

/// Presence state of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Offline,
}

/// Presence transition published onto a user's presence topics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: Uuid,
    pub state: PresenceState,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Why a client must discard incremental state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncReason {
    /// Delivery queue exceeded its cap
    Overflow,
    /// Replay cursor is older than the retained window
    Pruned,
    /// Replay did not complete in time
    Timeout,
    /// A sequence gap was observed
    Gap,
}

/// What a session's transport carries to the client
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// A change event
    Event(Event),
    /// The client must refetch a snapshot; `None` means every topic
    ResyncRequired {
        topic: Option<TopicKey>,
        reason: ResyncReason,
    },
}

impl OutboundFrame {
    /// The event, if this frame carries one
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            OutboundFrame::Event(event) => Some(event),
            OutboundFrame::ResyncRequired { .. } => None,
        }
    }
}
