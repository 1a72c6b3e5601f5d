//! # Realtime Fan-out Core
//!
//! Live delivery of message, membership and presence changes to connected
//! clients.
//!
//! ## Architecture
//!
//! - **Event Log**: per-topic ordered, durable sequence of change events
//! - **Topic Registry**: topic to subscribed sessions, and back
//! - **Session**: one client; cursors, bounded delivery queue, state machine
//! - **Dispatcher**: fans each appended event out to the topic's sessions
//! - **Presence**: online status from heartbeats, with an expiry sweep
//! - **Hub**: the operations transports call

pub mod dispatcher;
pub mod errors;
pub mod event;
pub mod event_log;
pub mod hub;
pub mod presence;
pub mod segment;
pub mod session;
pub mod subscription;
pub mod topic;

pub use dispatcher::{DispatchResult, Dispatcher};
pub use errors::{RealtimeError, RealtimeResult};
pub use event::{
    EntityType, Event, EventKind, MembershipPayload, MessagePayload, OutboundFrame,
    PresencePayload, PresenceState, ResyncReason,
};
pub use event_log::{AppendListener, EventLog, EventLogConfig};
pub use hub::{Collaborators, HubConfig, HubStats, RealtimeHub, Snapshot};
pub use presence::{PresenceConfig, PresenceRecord, PresenceTracker};
pub use session::{DeliveryOutcome, Session, SessionConfig, SessionState};
pub use subscription::{Subscription, TopicRegistry};
pub use topic::TopicKey;
