//! slackline - self-hosted realtime fan-out for chat
//!
//! Delivers message, membership and presence changes to connected clients
//! over WebSocket, with per-topic ordering, resumable cursors and explicit
//! resync when a client falls behind.

pub mod auth;
pub mod cli;
pub mod http_server;
pub mod observability;
pub mod realtime;
pub mod store;
