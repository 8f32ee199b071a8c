//! Prometheus metrics for the markgate coordinator
//!
//! This module provides metrics tracking for:
//! - Lock table: grants, releases, lease evictions, rejected callers
//! - Lease monitor: sweep duration, tracked resources, queue depth
//! - HTTP API: requests by endpoint and status, latency
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for lock coordination metrics
struct LockMetrics {
    grants: CounterVec,
    releases: CounterVec,
    evictions: CounterVec,
    not_holder: Counter,
    busy: Counter,
    heartbeats: Counter,
    resources_tracked: Gauge,
    queued_requests: Gauge,
    subscribers: Gauge,
    sweep_duration: Histogram,
}

/// Container for HTTP API metrics
struct ApiMetrics {
    requests: CounterVec,
    duration: HistogramVec,
}

/// Global storage for lock metrics
static LOCK_METRICS: OnceLock<LockMetrics> = OnceLock::new();

/// Global storage for API metrics
static API_METRICS: OnceLock<ApiMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers anything.
/// If registration fails, subsequent metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = markgate::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let lock = LockMetrics {
        grants: register_counter_vec!(
            "markgate_lock_grants_total",
            "Total lock grants by mode",
            &["mode"]
        )?,
        releases: register_counter_vec!(
            "markgate_lock_releases_total",
            "Total explicit lock releases by mode",
            &["mode"]
        )?,
        evictions: register_counter_vec!(
            "markgate_lock_evictions_total",
            "Holders removed by the lease monitor",
            &["mode"]
        )?,
        not_holder: register_counter!(
            "markgate_lock_not_holder_total",
            "Releases or heartbeats rejected because the caller held nothing"
        )?,
        busy: register_counter!(
            "markgate_lock_busy_total",
            "Non-queuing acquisitions refused because the resource was busy"
        )?,
        heartbeats: register_counter!(
            "markgate_lock_heartbeats_total",
            "Total lease renewals"
        )?,
        resources_tracked: register_gauge!(
            "markgate_lock_resources_tracked",
            "Number of resources with a lock record"
        )?,
        queued_requests: register_gauge!(
            "markgate_lock_queued_requests",
            "Requests waiting across all resources"
        )?,
        subscribers: register_gauge!(
            "markgate_lock_event_subscribers",
            "Connected lock event subscribers"
        )?,
        sweep_duration: register_histogram!(
            "markgate_lease_sweep_duration_seconds",
            "Time spent in one lease monitor sweep",
            vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]
        )?,
    };

    let api = ApiMetrics {
        requests: register_counter_vec!(
            "markgate_api_requests_total",
            "Total API requests by endpoint and status",
            &["endpoint", "status"]
        )?,
        duration: register_histogram_vec!(
            "markgate_api_request_duration_seconds",
            "API request duration in seconds",
            &["endpoint"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
        )?,
    };

    LOCK_METRICS.set(lock).map_err(|_| "Lock metrics already initialized")?;
    API_METRICS.set(api).map_err(|_| "API metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    LOCK_METRICS.get().is_some() && API_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record holders granted a lock in the given mode ("read" or "write")
pub fn record_grants(mode: &str, count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = LOCK_METRICS.get() {
        m.grants.with_label_values(&[mode]).inc_by(count as f64);
    }
}

/// Record an explicit release
pub fn record_release(mode: &str) {
    if let Some(m) = LOCK_METRICS.get() {
        m.releases.with_label_values(&[mode]).inc();
    }
}

/// Record a holder evicted by the lease monitor
pub fn record_eviction(mode: &str) {
    if let Some(m) = LOCK_METRICS.get() {
        m.evictions.with_label_values(&[mode]).inc();
    }
}

pub fn record_not_holder() {
    if let Some(m) = LOCK_METRICS.get() {
        m.not_holder.inc();
    }
}

pub fn record_busy() {
    if let Some(m) = LOCK_METRICS.get() {
        m.busy.inc();
    }
}

pub fn record_heartbeat() {
    if let Some(m) = LOCK_METRICS.get() {
        m.heartbeats.inc();
    }
}

/// Update lock table gauges
pub fn update_table_metrics(resources: usize, queued: usize, subscribers: usize) {
    let Some(m) = LOCK_METRICS.get() else {
        return;
    };

    m.resources_tracked.set(resources as f64);
    m.queued_requests.set(queued as f64);
    m.subscribers.set(subscribers as f64);
}

/// Record API request
pub fn record_api_request(endpoint: &str, status: u16, duration_secs: f64) {
    let Some(m) = API_METRICS.get() else {
        return;
    };

    let status_str = status.to_string();
    m.requests
        .with_label_values(&[endpoint, &status_str])
        .inc();
    m.duration
        .with_label_values(&[endpoint])
        .observe(duration_secs);
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a lease sweep timer
pub fn start_sweep_timer() -> MetricsTimer {
    match LOCK_METRICS.get() {
        Some(m) => MetricsTimer::new(m.sweep_duration.start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
        // Idempotent
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_metrics_initialized() {
        ensure_metrics_initialized();
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        record_grants("write", 1);
        let text = encode_metrics().unwrap();
        assert!(text.contains("markgate_lock_grants_total"));
    }

    #[test]
    fn test_lock_recording() {
        ensure_metrics_initialized();
        record_grants("read", 3);
        record_grants("read", 0);
        record_release("write");
        record_eviction("read");
        record_not_holder();
        record_busy();
        record_heartbeat();
        update_table_metrics(4, 2, 1);
    }

    #[test]
    fn test_api_request_recording() {
        ensure_metrics_initialized();
        record_api_request("/api/health", 200, 0.005);
    }

    #[test]
    fn test_sweep_timer() {
        ensure_metrics_initialized();
        let _timer = start_sweep_timer();
    }
}
