//! # Membership
//!
//! Who may read which topic. Answers come from the backend on every call;
//! nothing here is cached by callers.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use super::errors::{AuthError, AuthResult};
use crate::realtime::topic::TopicKey;

/// Membership backend
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Whether `user_id` may read `topic`
    async fn is_member(&self, user_id: Uuid, topic: &TopicKey) -> AuthResult<bool>;

    /// Topics that carry `user_id`'s presence changes
    async fn presence_topics(&self, user_id: Uuid) -> AuthResult<Vec<TopicKey>> {
        Ok(vec![TopicKey::UserMembership(user_id)])
    }
}

/// In-process membership table
#[derive(Debug, Default)]
pub struct InMemoryMembership {
    members: RwLock<HashMap<TopicKey, HashSet<Uuid>>>,
    presence: RwLock<HashMap<Uuid, Vec<TopicKey>>>,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `user_id` a member of `topic`
    pub fn grant(&self, user_id: Uuid, topic: &TopicKey) {
        if let Ok(mut members) = self.members.write() {
            members.entry(topic.clone()).or_default().insert(user_id);
        }
    }

    /// Remove `user_id` from `topic`
    pub fn revoke(&self, user_id: Uuid, topic: &TopicKey) {
        if let Ok(mut members) = self.members.write() {
            if let Some(users) = members.get_mut(topic) {
                users.remove(&user_id);
            }
        }
    }

    /// Route `user_id`'s presence changes to `topics` instead of the default
    pub fn set_presence_topics(&self, user_id: Uuid, topics: Vec<TopicKey>) {
        if let Ok(mut presence) = self.presence.write() {
            presence.insert(user_id, topics);
        }
    }
}

#[async_trait]
impl MembershipStore for InMemoryMembership {
    async fn is_member(&self, user_id: Uuid, topic: &TopicKey) -> AuthResult<bool> {
        if let TopicKey::UserMembership(owner) = topic {
            return Ok(*owner == user_id);
        }

        let members = self
            .members
            .read()
            .map_err(|_| AuthError::MembershipUnavailable("lock poisoned".into()))?;
        Ok(members
            .get(topic)
            .map(|users| users.contains(&user_id))
            .unwrap_or(false))
    }

    async fn presence_topics(&self, user_id: Uuid) -> AuthResult<Vec<TopicKey>> {
        let presence = self
            .presence
            .read()
            .map_err(|_| AuthError::MembershipUnavailable("lock poisoned".into()))?;
        Ok(presence
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| vec![TopicKey::UserMembership(user_id)]))
    }
}
