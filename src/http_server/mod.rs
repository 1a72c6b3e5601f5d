//! # HTTP Server Module
//!
//! The WebSocket transport and the small HTTP surface around the hub.
//!
//! # Endpoints
//!
//! - `/health` - Health check
//! - `/realtime/ws` - WebSocket session protocol
//! - `/realtime/publish` - Append an event to a topic
//! - `/realtime/stats` - Hub counters and sizes
//! - `/observability/metrics` - Metrics as JSON

pub mod config;
pub mod observability_routes;
pub mod realtime_routes;
pub mod server;

pub use config::HttpServerConfig;
pub use realtime_routes::{ClientMessage, ServerMessage};
pub use server::HttpServer;
