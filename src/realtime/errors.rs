//! # Real-Time Errors
//!
//! Error types for the fan-out core.

use thiserror::Error;

use super::topic::TopicKey;

/// Result type for real-time operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Real-time errors
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    // ==================
    // Identity Errors
    // ==================
    /// No valid identity behind the credential
    #[error("Authentication required")]
    Unauthenticated,

    /// Authenticated, but not a member of the topic
    #[error("Not a member of topic {0}")]
    Forbidden(TopicKey),

    // ==================
    // Replay Errors
    // ==================
    /// Replay cursor is older than what the log still retains
    #[error("Topic {topic} pruned past cursor {requested} (oldest retained: {oldest_retained})")]
    NotFound {
        topic: TopicKey,
        requested: u64,
        oldest_retained: u64,
    },

    /// Replay did not finish within the configured bound
    #[error("Replay of {0} timed out")]
    ReplayTimeout(TopicKey),

    // ==================
    // Delivery Errors
    // ==================
    /// Session delivery queue exceeded its cap
    #[error("Session delivery queue overflowed (cap: {0})")]
    Overflow(usize),

    /// The client link is gone
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Operation on a session that is closing or closed
    #[error("Session {0} is closed")]
    SessionClosed(String),

    /// Unknown session id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // ==================
    // Subscription Errors
    // ==================
    /// Topic string did not parse
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Session is not subscribed to the topic
    #[error("Not subscribed to {0}")]
    NotSubscribed(TopicKey),

    /// Too many subscriptions
    #[error("Too many subscriptions (max: {0})")]
    TooManySubscriptions(usize),

    // ==================
    // Storage Errors
    // ==================
    /// Append did not become durable; the sequence was not advanced
    #[error("Storage error: {0}")]
    Storage(String),

    /// Collaborator failure (membership or record store)
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    // ==================
    // Internal Errors
    // ==================
    /// Invalid message format from a client
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RealtimeError {
    /// Returns the close code for WebSocket
    pub fn close_code(&self) -> u16 {
        match self {
            RealtimeError::Unauthenticated => 4004,
            RealtimeError::Forbidden(_) => 4003,
            RealtimeError::NotFound { .. } => 4040,
            RealtimeError::ReplayTimeout(_) => 4041,
            RealtimeError::Overflow(_) => 4020,
            RealtimeError::TransportError(_) => 1011,
            RealtimeError::SessionClosed(_) => 1000,
            RealtimeError::SessionNotFound(_) => 4001,
            RealtimeError::InvalidTopic(_) => 4000,
            RealtimeError::NotSubscribed(_) => 4002,
            RealtimeError::TooManySubscriptions(_) => 4005,
            RealtimeError::Storage(_) => 4500,
            RealtimeError::Collaborator(_) => 4502,
            RealtimeError::InvalidMessage(_) => 1003,
            RealtimeError::ConfigError(_) => 4501,
            RealtimeError::Internal(_) => 4500,
        }
    }

    /// Short machine-readable code used in error frames
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::Unauthenticated => "UNAUTHENTICATED",
            RealtimeError::Forbidden(_) => "FORBIDDEN",
            RealtimeError::NotFound { .. } => "NOT_FOUND",
            RealtimeError::ReplayTimeout(_) => "REPLAY_TIMEOUT",
            RealtimeError::Overflow(_) => "OVERFLOW",
            RealtimeError::TransportError(_) => "TRANSPORT_ERROR",
            RealtimeError::SessionClosed(_) => "SESSION_CLOSED",
            RealtimeError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            RealtimeError::InvalidTopic(_) => "INVALID_TOPIC",
            RealtimeError::NotSubscribed(_) => "NOT_SUBSCRIBED",
            RealtimeError::TooManySubscriptions(_) => "TOO_MANY_SUBSCRIPTIONS",
            RealtimeError::Storage(_) => "STORAGE_ERROR",
            RealtimeError::Collaborator(_) => "COLLABORATOR_ERROR",
            RealtimeError::InvalidMessage(_) => "INVALID_MESSAGE",
            RealtimeError::ConfigError(_) => "CONFIG_ERROR",
            RealtimeError::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status for the publish path
    pub fn status_code(&self) -> u16 {
        match self {
            RealtimeError::Unauthenticated => 401,
            RealtimeError::Forbidden(_) => 403,
            RealtimeError::NotFound { .. }
            | RealtimeError::SessionNotFound(_)
            | RealtimeError::NotSubscribed(_) => 404,
            RealtimeError::InvalidTopic(_) | RealtimeError::InvalidMessage(_) => 400,
            RealtimeError::TooManySubscriptions(_) | RealtimeError::Overflow(_) => 429,
            RealtimeError::SessionClosed(_) => 410,
            RealtimeError::ReplayTimeout(_) => 504,
            RealtimeError::Collaborator(_) => 503,
            RealtimeError::TransportError(_)
            | RealtimeError::Storage(_)
            | RealtimeError::ConfigError(_)
            | RealtimeError::Internal(_) => 500,
        }
    }

    /// Whether the client can recover by resyncing instead of reconnecting
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            RealtimeError::NotFound { .. }
                | RealtimeError::ReplayTimeout(_)
                | RealtimeError::Overflow(_)
        )
    }
}
