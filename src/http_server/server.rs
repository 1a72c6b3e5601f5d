//! # HTTP Server
//!
//! Combines the realtime and observability routers behind one listener.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::config::HttpServerConfig;
use super::observability_routes::{health_routes, observability_routes};
use super::realtime_routes::{realtime_routes, RealtimeState};
use crate::realtime::RealtimeHub;

/// HTTP server for the realtime hub
pub struct HttpServer {
    config: HttpServerConfig,
    router: Router,
}

impl HttpServer {
    /// Create a server in front of `hub`
    pub fn with_hub(config: HttpServerConfig, hub: Arc<RealtimeHub>) -> Self {
        let router = Self::build_router(&config, hub);
        Self { config, router }
    }

    /// Build the combined router with all endpoints
    fn build_router(config: &HttpServerConfig, hub: Arc<RealtimeHub>) -> Router {
        let metrics = Arc::clone(hub.metrics());
        let realtime_state = RealtimeState::new(hub).with_max_message_bytes(config.max_message_bytes);

        Router::new()
            .merge(health_routes())
            .nest("/observability", observability_routes(metrics))
            // Includes the WebSocket endpoint
            .nest("/realtime", realtime_routes(realtime_state))
            .layer(TraceLayer::new_for_http())
            .layer(config.cors_layer())
    }

    /// Get the socket address
    pub fn socket_addr(&self) -> String {
        self.config.socket_addr()
    }

    /// Get the router (for testing)
    pub fn router(self) -> Router {
        self.router
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "http server listening");
        tracing::info!("websocket endpoint: ws://{}/realtime/ws", addr);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("http server stopped");
        Ok(())
    }
}
