//! # Listener Configuration
//!
//! Where the realtime surface listens, which browser origins may call it
//! and how large a client frame may be.

use std::io;
use std::net::SocketAddr;

use axum::http::HeaderValue;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Largest client frame accepted on `/realtime/ws` by default
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// HTTP and WebSocket listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServerConfig {
    /// Interface to listen on
    pub host: String,

    pub port: u16,

    /// Origins allowed by CORS; empty allows any origin
    pub cors_origins: Vec<String>,

    /// Client frames above this size end the socket
    pub max_message_bytes: usize,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            cors_origins: Vec::new(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl HttpServerConfig {
    /// Defaults on another port
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// `host:port` as configured
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parsed listen address
    pub fn bind_addr(&self) -> io::Result<SocketAddr> {
        self.socket_addr().parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid socket address {}: {}", self.socket_addr(), e),
            )
        })
    }

    /// Reject settings the server could not start with
    pub fn validate(&self) -> Result<(), String> {
        self.bind_addr().map_err(|e| e.to_string())?;
        if self.max_message_bytes == 0 {
            return Err("http.max_message_bytes must be > 0".to_string());
        }
        if let Some(origin) = self
            .cors_origins
            .iter()
            .find(|origin| HeaderValue::from_str(origin).is_err())
        {
            return Err(format!("http.cors_origins has an invalid origin: {:?}", origin));
        }
        Ok(())
    }

    /// CORS policy for every route
    pub fn cors_layer(&self) -> CorsLayer {
        let allow_origin = if self.cors_origins.is_empty() {
            AllowOrigin::from(Any)
        } else {
            AllowOrigin::list(
                self.cors_origins
                    .iter()
                    .filter_map(|origin| HeaderValue::from_str(origin).ok()),
            )
        };

        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_bind_all_interfaces() {
        let config = HttpServerConfig::default();
        assert_eq!(
            config.bind_addr().unwrap(),
            "0.0.0.0:4000".parse::<SocketAddr>().unwrap()
        );
        assert!(config.cors_origins.is_empty());
        assert_eq!(config.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_other_defaults() {
        let config: HttpServerConfig =
            serde_json::from_str(r#"{"port": 9000, "cors_origins": ["https://chat.example"]}"#)
                .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.cors_origins, vec!["https://chat.example".to_string()]);
        assert_eq!(config.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
    }

    #[test]
    fn test_bad_host_is_invalid_input() {
        let config = HttpServerConfig {
            host: "not an address".to_string(),
            ..HttpServerConfig::default()
        };
        assert_eq!(
            config.bind_addr().unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let zero_frames = HttpServerConfig {
            max_message_bytes: 0,
            ..HttpServerConfig::default()
        };
        assert!(zero_frames.validate().unwrap_err().contains("max_message_bytes"));

        let bad_origin = HttpServerConfig {
            cors_origins: vec!["https://ok.example".to_string(), "bad\norigin".to_string()],
            ..HttpServerConfig::default()
        };
        assert!(bad_origin.validate().unwrap_err().contains("cors_origins"));
    }
}
