//! HTTP/WebSocket server with axum router and graceful shutdown.

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::error::ServerError;
use super::handlers::{get_health, get_watches, AppState};
use super::socket::ws_upgrade;
use crate::config::ServerConfig;

/// Server exposing the push channel and watch diagnostics.
pub struct WatchServer {
    config: ServerConfig,
    state: AppState,
    cancel: CancellationToken,
}

impl WatchServer {
    /// Create a new server with default configuration.
    #[must_use]
    pub fn new(state: AppState, cancel: CancellationToken) -> Self {
        Self {
            config: ServerConfig::default(),
            state,
            cancel,
        }
    }

    /// Set the server configuration (builder pattern).
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Get the configured address as a string.
    #[must_use]
    pub fn address(&self) -> String {
        self.config.address()
    }

    /// Build the axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let router = Router::new()
            .route("/ws", get(ws_upgrade))
            .route("/api/health", get(get_health))
            .route("/api/watches", get(get_watches))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        if self.config.cors_permissive {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Bind the configured address and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind or serve.
    pub async fn run(self) -> Result<(), ServerError> {
        let address = self.address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| ServerError::BindError { address, source })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if serving fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let cancel = self.cancel.clone();
        let app = self.build_router();

        let address = listener.local_addr()?;
        tracing::info!(address = %address, "Starting watch server");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
                tracing::info!("Watch server shutting down gracefully");
            })
            .await?;
        Ok(())
    }
}
