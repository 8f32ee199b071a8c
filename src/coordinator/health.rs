//! Health endpoints for the coordinator
//!
//! `/health/live` answers while the process runs. `/health/ready` turns 503
//! once shutdown begins and reports degraded when the lease monitor is not
//! running, since expired holds would then never be reclaimed.
//! `/health/startup` answers 200 once the monitor has been started.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::server::AppState;

// ============================================================================
// Health Status Types
// ============================================================================

/// Overall health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn status_code(&self) -> StatusCode {
        match self {
            // Degraded still serves locks
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: HealthStatus,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: HealthStatus,
    pub timestamp: String,
    pub checks: Vec<ComponentHealth>,
}

#[derive(Debug, Serialize)]
pub struct StartupResponse {
    pub ready: bool,
    pub status: HealthStatus,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Health Checker
// ============================================================================

/// Server lifecycle flags read by the health endpoints
#[derive(Clone)]
pub struct HealthChecker {
    startup_complete: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
    monitor_running: Arc<AtomicBool>,
    start_time: Instant,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            startup_complete: Arc::new(AtomicBool::new(false)),
            ready: Arc::new(AtomicBool::new(false)),
            monitor_running: Arc::new(AtomicBool::new(false)),
            start_time: Instant::now(),
        }
    }

    pub fn mark_startup_complete(&self) {
        self.startup_complete.store(true, Ordering::SeqCst);
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        tracing::info!("Coordinator ready for lock traffic");
    }

    /// Flip readiness off ahead of shutdown
    pub fn mark_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
        tracing::warn!("Coordinator no longer accepting lock traffic");
    }

    pub fn set_monitor_running(&self, running: bool) {
        self.monitor_running.store(running, Ordering::SeqCst);
    }

    pub fn is_startup_complete(&self) -> bool {
        self.startup_complete.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_monitor_running(&self) -> bool {
        self.monitor_running.load(Ordering::SeqCst)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

// ============================================================================
// Health Check Router
// ============================================================================

pub fn create_health_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/health/startup", get(startup_probe))
        .with_state(state)
}

/// Component checks shared by readiness and the API health endpoint
pub fn component_checks(state: &AppState) -> (HealthStatus, Vec<ComponentHealth>) {
    let mut checks = Vec::new();
    let mut overall_status = HealthStatus::Healthy;

    // Every resource mutex is visited, so this also catches a wedged resource
    let table_start = Instant::now();
    let stats = state.coordinator.stats();
    let table_latency = table_start.elapsed().as_millis() as u64;

    checks.push(ComponentHealth {
        name: "lock_table".to_string(),
        status: HealthStatus::Healthy,
        message: Some(format!(
            "{} resources, {} queued requests",
            stats.resources, stats.queued
        )),
        latency_ms: Some(table_latency),
    });

    let monitor_status = if state.health.is_monitor_running() {
        HealthStatus::Healthy
    } else {
        overall_status = HealthStatus::Degraded;
        HealthStatus::Degraded
    };

    checks.push(ComponentHealth {
        name: "lease_monitor".to_string(),
        status: monitor_status,
        message: Some(if state.health.is_monitor_running() {
            "running".to_string()
        } else {
            "not running; expired leases are not reclaimed".to_string()
        }),
        latency_ms: None,
    });

    if !state.health.is_ready() {
        overall_status = HealthStatus::Unhealthy;
        checks.push(ComponentHealth {
            name: "server".to_string(),
            status: HealthStatus::Unhealthy,
            message: Some("not accepting traffic".to_string()),
            latency_ms: None,
        });
    }

    (overall_status, checks)
}

// ============================================================================
// Handlers
// ============================================================================

async fn liveness_probe() -> impl IntoResponse {
    let response = LivenessResponse {
        status: HealthStatus::Healthy,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(response))
}

async fn readiness_probe(State(state): State<AppState>) -> impl IntoResponse {
    let (status, checks) = component_checks(&state);

    let response = ReadinessResponse {
        status,
        timestamp: chrono::Utc::now().to_rfc3339(),
        checks,
    };

    (status.status_code(), Json(response))
}

async fn startup_probe(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.health.is_startup_complete();

    let (status, message) = if ready {
        (HealthStatus::Healthy, None)
    } else {
        (
            HealthStatus::Unhealthy,
            Some(format!("lease monitor not started ({}s elapsed)", state.health.uptime_secs())),
        )
    };

    let response = StartupResponse {
        ready,
        status,
        timestamp: chrono::Utc::now().to_rfc3339(),
        message,
    };

    (status.status_code(), Json(response))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_code() {
        assert_eq!(HealthStatus::Healthy.status_code(), StatusCode::OK);
        assert_eq!(HealthStatus::Degraded.status_code(), StatusCode::OK);
        assert_eq!(
            HealthStatus::Unhealthy.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_health_checker() {
        let checker = HealthChecker::new();

        assert!(!checker.is_startup_complete());
        assert!(!checker.is_ready());
        assert!(!checker.is_monitor_running());

        checker.mark_startup_complete();
        assert!(checker.is_startup_complete());

        checker.mark_ready();
        assert!(checker.is_ready());

        checker.set_monitor_running(true);
        assert!(checker.is_monitor_running());

        checker.mark_not_ready();
        assert!(!checker.is_ready());
    }

    #[test]
    fn test_component_checks_follow_lifecycle() {
        let state = AppState::new(crate::coordinator::CoordinatorConfig::default());

        let (status, checks) = component_checks(&state);
        assert_eq!(status, HealthStatus::Unhealthy);
        assert!(checks.iter().any(|c| c.name == "server"));

        state.health.mark_ready();
        let (status, checks) = component_checks(&state);
        assert_eq!(status, HealthStatus::Degraded);
        let monitor = checks.iter().find(|c| c.name == "lease_monitor").unwrap();
        assert_eq!(monitor.status, HealthStatus::Degraded);

        state.health.set_monitor_running(true);
        let (status, checks) = component_checks(&state);
        assert_eq!(status, HealthStatus::Healthy);
        assert_eq!(checks.len(), 2);
    }

    #[test]
    fn test_component_health_serialization() {
        let health = ComponentHealth {
            name: "lock_table".to_string(),
            status: HealthStatus::Healthy,
            message: Some("ok".to_string()),
            latency_ms: Some(5),
        };

        let json = serde_json::to_string(&health).unwrap();
        assert!(json.contains("\"name\":\"lock_table\""));
        assert!(json.contains("\"status\":\"healthy\""));
    }
}
