//! HTTP API server for the wake word engine

pub mod health;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Config, SessionConfig};
use crate::pipeline::StreamingPipelineDispatcher;
use crate::voice::WakeWordDetector;
use crate::Result;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Process-wide detector shared by every connection
    pub detector: Arc<WakeWordDetector>,
    /// Process-wide dispatcher shared by every session
    pub dispatcher: Arc<StreamingPipelineDispatcher>,
    /// Per-connection settings
    pub session: SessionConfig,
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    detector: Arc<WakeWordDetector>,
    dispatcher: Arc<StreamingPipelineDispatcher>,
    session: SessionConfig,
    host: String,
    port: u16,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(
        detector: Arc<WakeWordDetector>,
        dispatcher: Arc<StreamingPipelineDispatcher>,
    ) -> Self {
        Self {
            detector,
            dispatcher,
            session: SessionConfig::default(),
            host: "127.0.0.1".to_string(),
            port: 18800,
        }
    }

    /// Builder with host, port and session settings taken from `config`
    #[must_use]
    pub fn from_config(
        config: &Config,
        detector: Arc<WakeWordDetector>,
        dispatcher: Arc<StreamingPipelineDispatcher>,
    ) -> Self {
        Self::new(detector, dispatcher)
            .session_config(config.session.clone())
            .host(config.server.host.clone())
            .port(config.server.port)
    }

    /// Set per-connection settings
    #[must_use]
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    /// Set the bind host
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the bind port
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        ApiServer {
            state: Arc::new(ApiState {
                detector: self.detector,
                dispatcher: self.dispatcher,
                session: self.session,
            }),
            host: self.host,
            port: self.port,
        }
    }
}

/// HTTP + WebSocket server
pub struct ApiServer {
    state: Arc<ApiState>,
    host: String,
    port: u16,
}

impl ApiServer {
    /// Shared handler state
    #[must_use]
    pub fn state(&self) -> Arc<ApiState> {
        Arc::clone(&self.state)
    }

    /// Full application router
    #[must_use]
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .nest("/ws", websocket::router(self.state()))
            .merge(health::router())
            .merge(health::ready_router(self.state()))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound or the server fails
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server on {addr}: {e}")))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "API server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}
