//! # Topic Keys
//!
//! A topic is a logical delivery scope: one channel, one direct-message
//! conversation, or one user's membership set. Topics travel on the wire in
//! their canonical string form (`channel:<uuid>`, `conversation:<uuid>`,
//! `user-membership:<uuid>`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::RealtimeError;

/// Delivery scope for events
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TopicKey {
    /// A workspace channel
    Channel(Uuid),
    /// A direct-message conversation
    Conversation(Uuid),
    /// Membership changes for one user (their sidebar)
    UserMembership(Uuid),
}

impl TopicKey {
    /// Prefix used in the canonical string form
    pub fn tag(&self) -> &'static str {
        match self {
            TopicKey::Channel(_) => "channel",
            TopicKey::Conversation(_) => "conversation",
            TopicKey::UserMembership(_) => "user-membership",
        }
    }

    /// The id behind the tag
    pub fn id(&self) -> Uuid {
        match self {
            TopicKey::Channel(id) | TopicKey::Conversation(id) | TopicKey::UserMembership(id) => {
                *id
            }
        }
    }

    /// File-system safe name for the topic's segment file
    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.tag(), self.id().simple())
    }

    /// Inverse of [`TopicKey::file_stem`]
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        let (tag, id) = stem.rsplit_once('-')?;
        let id = Uuid::parse_str(id).ok()?;

        match tag {
            "channel" => Some(TopicKey::Channel(id)),
            "conversation" => Some(TopicKey::Conversation(id)),
            "user-membership" => Some(TopicKey::UserMembership(id)),
            _ => None,
        }
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag(), self.id())
    }
}

impl FromStr for TopicKey {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, id) = s
            .split_once(':')
            .ok_or_else(|| RealtimeError::InvalidTopic(s.to_string()))?;
        let id = Uuid::parse_str(id).map_err(|_| RealtimeError::InvalidTopic(s.to_string()))?;

        match tag {
            "channel" => Ok(TopicKey::Channel(id)),
            "conversation" => Ok(TopicKey::Conversation(id)),
            "user-membership" => Ok(TopicKey::UserMembership(id)),
            _ => Err(RealtimeError::InvalidTopic(s.to_string())),
        }
    }
}

impl From<TopicKey> for String {
    fn from(topic: TopicKey) -> Self {
        topic.to_string()
    }
}

impl TryFrom<String> for TopicKey {
    type Error = RealtimeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let id = Uuid::new_v4();
        let topic = TopicKey::Conversation(id);
        let text = topic.to_string();

        assert_eq!(text, format!("conversation:{}", id));
        assert_eq!(text.parse::<TopicKey>().unwrap(), topic);
    }

    #[test]
    fn test_equality_by_tag_and_id() {
        let id = Uuid::new_v4();
        assert_eq!(TopicKey::Channel(id), TopicKey::Channel(id));
        assert_ne!(TopicKey::Channel(id), TopicKey::Conversation(id));
    }

    #[test]
    fn test_invalid_topics() {
        assert!(matches!(
            "channel".parse::<TopicKey>(),
            Err(RealtimeError::InvalidTopic(_))
        ));
        assert!(matches!(
            "room:00000000-0000-0000-0000-000000000000".parse::<TopicKey>(),
            Err(RealtimeError::InvalidTopic(_))
        ));
        assert!(matches!(
            "channel:not-a-uuid".parse::<TopicKey>(),
            Err(RealtimeError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_serde_uses_string_form() {
        let topic = TopicKey::UserMembership(Uuid::nil());
        let json = serde_json::to_string(&topic).unwrap();
        assert_eq!(json, "\"user-membership:00000000-0000-0000-0000-000000000000\"");

        let back: TopicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, topic);
    }

    #[test]
    fn test_file_stem_has_no_separators() {
        let topic = TopicKey::Channel(Uuid::new_v4());
        let stem = topic.file_stem();
        assert!(stem.starts_with("channel-"));
        assert!(!stem.contains(':'));
        assert!(!stem.contains('/'));
        assert_eq!(TopicKey::from_file_stem(&stem), Some(topic));

        let membership = TopicKey::UserMembership(Uuid::new_v4());
        assert_eq!(
            TopicKey::from_file_stem(&membership.file_stem()),
            Some(membership)
        );
    }
}
