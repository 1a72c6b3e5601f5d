//! # Record Store
//!
//! Authoritative state for a topic, fetched when a client has to discard
//! its incremental view and start over.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::realtime::topic::TopicKey;

/// Record store errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend could not be reached
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Source of topic snapshots
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Current state of everything `topic` covers
    async fn snapshot(&self, topic: &TopicKey) -> Result<Value, StoreError>;
}

/// Snapshots held in process
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    snapshots: RwLock<HashMap<TopicKey, Value>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot for `topic`
    pub fn put(&self, topic: &TopicKey, body: Value) {
        if let Ok(mut snapshots) = self.snapshots.write() {
            snapshots.insert(topic.clone(), body);
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn snapshot(&self, topic: &TopicKey) -> Result<Value, StoreError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".into()))?;
        Ok(snapshots
            .get(topic)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_snapshot_defaults_to_empty() {
        let store = InMemoryRecordStore::new();
        let topic = TopicKey::Channel(Uuid::new_v4());
        assert_eq!(store.snapshot(&topic).await.unwrap(), json!([]));

        store.put(&topic, json!([{"id": 1}]));
        assert_eq!(store.snapshot(&topic).await.unwrap(), json!([{"id": 1}]));
    }
}
