//! # Presence Tracking
//!
//! Online status derived from heartbeats.
//!
//! Each user has one record behind its own lock. Heartbeats are
//! last-write-wins on `last_heartbeat_at`. The sweep collects stale
//! candidates first, then re-checks each one under its record lock, so a
//! heartbeat that lands between the two phases always wins.
//!
//! The tracker only reports transitions; the caller publishes them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::{PresencePayload, PresenceState};

/// Presence record for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub last_heartbeat_at: DateTime<Utc>,
    pub state: PresenceState,
}

impl PresenceRecord {
    fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat_at > timeout
    }

    fn payload(&self) -> PresencePayload {
        PresencePayload {
            user_id: self.user_id,
            state: self.state,
            last_heartbeat_at: self.last_heartbeat_at,
        }
    }
}

/// Configuration for presence tracking
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How often the sweep runs
    pub sweep_interval: Duration,

    /// Silence after which a user is considered offline
    pub timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::seconds(30),
            timeout: Duration::seconds(60),
        }
    }
}

/// Presence tracker
#[derive(Debug, Default)]
pub struct PresenceTracker {
    config: PresenceConfig,
    records: RwLock<HashMap<Uuid, Arc<Mutex<PresenceRecord>>>>,
}

impl PresenceTracker {
    /// Create a tracker with custom config
    pub fn with_config(config: PresenceConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    fn record(&self, user_id: Uuid) -> Option<Arc<Mutex<PresenceRecord>>> {
        self.records.read().ok()?.get(&user_id).cloned()
    }

    /// Record a heartbeat now
    pub fn heartbeat(&self, user_id: Uuid) -> Option<PresencePayload> {
        self.heartbeat_at(user_id, Utc::now())
    }

    /// Record a heartbeat observed at `at`.
    ///
    /// Returns the transition when the user was offline or unknown.
    pub fn heartbeat_at(&self, user_id: Uuid, at: DateTime<Utc>) -> Option<PresencePayload> {
        let record = match self.record(user_id) {
            Some(record) => record,
            None => {
                let mut records = self.records.write().ok()?;
                Arc::clone(records.entry(user_id).or_insert_with(|| {
                    Arc::new(Mutex::new(PresenceRecord {
                        user_id,
                        last_heartbeat_at: at,
                        state: PresenceState::Offline,
                    }))
                }))
            }
        };

        let mut record = record.lock().ok()?;
        if at > record.last_heartbeat_at {
            record.last_heartbeat_at = at;
        }
        let previous = record.state;
        record.state = PresenceState::Online;

        (previous == PresenceState::Offline).then(|| record.payload())
    }

    /// Explicit sign-off
    pub fn go_offline(&self, user_id: Uuid) -> Option<PresencePayload> {
        let record = self.record(user_id)?;
        let mut record = record.lock().ok()?;
        if record.state == PresenceState::Offline {
            return None;
        }
        record.state = PresenceState::Offline;
        Some(record.payload())
    }

    /// Users whose last heartbeat looked stale at `now`
    pub fn sweep_candidates(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let records: Vec<Arc<Mutex<PresenceRecord>>> = match self.records.read() {
            Ok(records) => records.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };

        records
            .iter()
            .filter_map(|record| {
                let record = record.lock().ok()?;
                (record.state == PresenceState::Online
                    && record.is_stale(now, self.config.timeout))
                .then_some(record.user_id)
            })
            .collect()
    }

    /// Mark `user_id` offline if it is still stale under the record lock
    pub fn expire_if_stale(&self, user_id: Uuid, now: DateTime<Utc>) -> Option<PresencePayload> {
        let record = self.record(user_id)?;
        let mut record = record.lock().ok()?;
        if record.state != PresenceState::Online || !record.is_stale(now, self.config.timeout) {
            return None;
        }
        record.state = PresenceState::Offline;
        Some(record.payload())
    }

    /// Sweep now
    pub fn sweep(&self) -> Vec<PresencePayload> {
        self.sweep_at(Utc::now())
    }

    /// Demote every stale user, returning the transitions
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<PresencePayload> {
        self.sweep_candidates(now)
            .into_iter()
            .filter_map(|user_id| self.expire_if_stale(user_id, now))
            .collect()
    }

    /// Current state of a user (`None` if never seen)
    pub fn state_of(&self, user_id: Uuid) -> Option<PresenceState> {
        let record = self.record(user_id)?;
        let state = record.lock().ok()?.state;
        Some(state)
    }

    /// Copy of a user's record
    pub fn snapshot_of(&self, user_id: Uuid) -> Option<PresenceRecord> {
        let record = self.record(user_id)?;
        let copy = record.lock().ok()?.clone();
        Some(copy)
    }

    /// Users currently online
    pub fn online_users(&self) -> Vec<Uuid> {
        let records: Vec<Arc<Mutex<PresenceRecord>>> = match self.records.read() {
            Ok(records) => records.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };

        let mut online: Vec<Uuid> = records
            .iter()
            .filter_map(|record| {
                let record = record.lock().ok()?;
                (record.state == PresenceState::Online).then_some(record.user_id)
            })
            .collect();
        online.sort();
        online
    }

    /// Get count of tracked users
    pub fn count(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }
}
