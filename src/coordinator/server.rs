//! Coordinator server implementation
//!
//! This module provides the main server that wires the coordinator, lease
//! monitor, API and health routes together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::api::create_router;
use super::config::CoordinatorConfig;
use super::health::{create_health_router, HealthChecker};
use super::lease::LeaseMonitor;
use super::service::MarksCoordinator;

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Lock coordinator
    pub coordinator: Arc<MarksCoordinator>,

    /// Lifecycle flags behind the health endpoints
    pub health: HealthChecker,

    /// Flipped on shutdown so open event streams end
    pub shutdown: Arc<watch::Sender<bool>>,

    /// Server start time
    pub start_time: Instant,

    /// Configuration
    pub config: CoordinatorConfig,
}

impl AppState {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            coordinator: Arc::new(MarksCoordinator::new(config.clone())),
            health: HealthChecker::new(),
            shutdown: Arc::new(shutdown),
            start_time: Instant::now(),
            config,
        }
    }
}

// ============================================================================
// Coordinator Server
// ============================================================================

/// Main Coordinator server
pub struct CoordinatorServer {
    config: CoordinatorConfig,
    state: AppState,
}

impl CoordinatorServer {
    /// Create a new coordinator server
    pub fn new(config: CoordinatorConfig) -> Result<Self, ServerError> {
        config.validate().map_err(|e| ServerError::ConfigError(e.to_string()))?;

        let state = AppState::new(config.clone());
        Ok(Self { config, state })
    }

    /// Get the application state
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn coordinator(&self) -> Arc<MarksCoordinator> {
        Arc::clone(&self.state.coordinator)
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone())
            .merge(create_health_router(self.state.clone()));

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if self.config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Start the server, running until the process is stopped
    pub async fn start(&self) -> Result<(), ServerError> {
        self.start_with_shutdown(std::future::pending()).await
    }

    /// Start with graceful shutdown
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let addr = self.config.bind_address;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("{addr}: {e}")))?;

        self.serve(listener, shutdown_signal).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        tracing::info!("Starting Coordinator server on {}", addr);

        let monitor = LeaseMonitor::new(self.coordinator()).start();
        self.state.health.set_monitor_running(true);
        self.state.health.mark_startup_complete();
        self.state.health.mark_ready();

        let stream_shutdown = Arc::clone(&self.state.shutdown);
        let health = self.state.health.clone();
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal.await;
                health.mark_not_ready();
                // Ends open event streams so connections can drain
                stream_shutdown.send_replace(true);
            })
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()));

        monitor.stop().await;
        self.state.health.set_monitor_running(false);

        tracing::info!("Coordinator server shutdown complete");
        result
    }

    /// Get server info
    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            bind_address: self.config.bind_address,
            lease_bounds_ms: (self.config.min_lease_ms, self.config.max_lease_ms),
            default_lease_ms: self.config.default_lease_ms,
            monitor_tick_ms: self.config.monitor_tick_ms,
            cors_enabled: self.config.enable_cors,
            request_logging_enabled: self.config.enable_request_logging,
        }
    }
}

/// Server information
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub bind_address: SocketAddr,
    pub lease_bounds_ms: (u64, u64),
    pub default_lease_ms: u64,
    pub monitor_tick_ms: u64,
    pub cors_enabled: bool,
    pub request_logging_enabled: bool,
}

impl ServerInfo {
    /// Format as display string
    pub fn display(&self) -> String {
        format!(
            "Coordinator Server\n\
             {:-<40}\n\
             Bind Address: {}\n\
             Lease Bounds: {}ms - {}ms\n\
             Default Lease: {}ms\n\
             Monitor Tick: {}ms\n\
             CORS: {}\n\
             Request Logging: {}",
            "",
            self.bind_address,
            self.lease_bounds_ms.0,
            self.lease_bounds_ms.1,
            self.default_lease_ms,
            self.monitor_tick_ms,
            if self.cors_enabled { "enabled" } else { "disabled" },
            if self.request_logging_enabled { "enabled" } else { "disabled" }
        )
    }
}

// ============================================================================
// Server Errors
// ============================================================================

/// Server errors
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to bind: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    ServeError(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let config = CoordinatorConfig::default();
        let server = CoordinatorServer::new(config);
        assert!(server.is_ok());
    }

    #[test]
    fn test_server_rejects_invalid_config() {
        let config = CoordinatorConfig {
            monitor_tick_ms: 0,
            ..CoordinatorConfig::default()
        };
        assert!(matches!(
            CoordinatorServer::new(config),
            Err(ServerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_server_info() {
        let config = CoordinatorConfig::builder()
            .lease_bounds_ms(1_000, 60_000)
            .default_lease_ms(5_000)
            .enable_cors(false)
            .build()
            .unwrap();

        let server = CoordinatorServer::new(config).unwrap();
        let info = server.info();

        assert_eq!(info.lease_bounds_ms, (1_000, 60_000));
        assert!(!info.cors_enabled);
        assert!(info.display().contains("Default Lease: 5000ms"));
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let server = CoordinatorServer::new(CoordinatorConfig::default()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let state = server.state();
        let handle = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(state.health.is_ready());

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!state.health.is_monitor_running());
    }
}
