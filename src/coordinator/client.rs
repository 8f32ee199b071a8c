//! Coordinator client for portal integrations
//!
//! Exam clients and the grading console use this client to take and release
//! marks locks. It also carries the recovery hooks: a fire-and-forget release
//! when a session drops, and a keeper task that renews a lease while work is in
//! progress.

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use super::api::{
    AcquireRequest, AcquireResponse, ApiResponse, CancelResponse, DisconnectResponse,
    HolderRequest, OkResponse,
};
use super::service::CoordinatorStats;
use super::types::{AccessMode, HeartbeatAck, HolderState, StatusSnapshot};
use crate::error::{ErrorCategory, MarkgateError};

// ============================================================================
// Client Configuration
// ============================================================================

/// Configuration for the coordinator client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator server URL
    pub coordinator_url: String,

    /// Request timeout
    pub timeout: Duration,

    /// Retry count for network failures and 5xx responses
    pub retry_count: u32,

    /// Retry delay
    pub retry_delay: Duration,
}

impl ClientConfig {
    /// Create a new client config
    pub fn new(coordinator_url: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
            retry_count: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set retry count
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

// ============================================================================
// Coordinator Client
// ============================================================================

/// Client for communicating with the Coordinator server
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    config: ClientConfig,
    base_url: Url,
    http_client: Client,
}

impl CoordinatorClient {
    /// Create a new coordinator client
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let base_url = Url::parse(&config.coordinator_url)
            .map_err(|e| ClientError::InitError(format!("Invalid coordinator URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InitError(format!(
                "Coordinator URL cannot carry a path: {}",
                config.coordinator_url
            )));
        }

        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::InitError(e.to_string()))?;

        Ok(Self {
            config,
            base_url,
            http_client,
        })
    }

    /// Append path segments to the coordinator URL, each percent-encoded on its own
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::InitError("Coordinator URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn lock_url(&self, resource_id: &str, action: &[&str]) -> Result<Url, ClientError> {
        let mut segments = vec!["api", "locks", resource_id];
        segments.extend_from_slice(action);
        self.endpoint(&segments)
    }

    /// Acquire in the given mode; `wait = false` fails with `lock_busy` instead of queueing
    pub async fn acquire(
        &self,
        resource_id: &str,
        holder_id: &str,
        mode: AccessMode,
        lease_ms: Option<u64>,
        wait: bool,
    ) -> Result<AcquireResponse, ClientError> {
        let request = AcquireRequest {
            holder_id: holder_id.to_string(),
            lease_ms,
            wait: (!wait).then_some(false),
        };
        let url = self.lock_url(resource_id, &[mode.label()])?;
        self.post_with_retry(url, &request).await
    }

    pub async fn acquire_read(&self, resource_id: &str, holder_id: &str, lease_ms: Option<u64>) -> Result<AcquireResponse, ClientError> {
        self.acquire(resource_id, holder_id, AccessMode::Read, lease_ms, true).await
    }

    pub async fn acquire_write(&self, resource_id: &str, holder_id: &str, lease_ms: Option<u64>) -> Result<AcquireResponse, ClientError> {
        self.acquire(resource_id, holder_id, AccessMode::Write, lease_ms, true).await
    }

    /// Release a hold in the given mode
    pub async fn release(&self, resource_id: &str, holder_id: &str, mode: AccessMode) -> Result<(), ClientError> {
        let url = self.lock_url(resource_id, &[mode.label(), "release"])?;
        let _: OkResponse = self.post_with_retry(url, &holder_body(holder_id)).await?;
        Ok(())
    }

    pub async fn release_read(&self, resource_id: &str, holder_id: &str) -> Result<(), ClientError> {
        self.release(resource_id, holder_id, AccessMode::Read).await
    }

    pub async fn release_write(&self, resource_id: &str, holder_id: &str) -> Result<(), ClientError> {
        self.release(resource_id, holder_id, AccessMode::Write).await
    }

    pub async fn heartbeat(&self, resource_id: &str, holder_id: &str) -> Result<HeartbeatAck, ClientError> {
        let url = self.lock_url(resource_id, &["heartbeat"])?;
        self.post_with_retry(url, &holder_body(holder_id)).await
    }

    /// Withdraw a pending request; returns whether one existed
    pub async fn cancel(&self, resource_id: &str, holder_id: &str) -> Result<bool, ClientError> {
        let url = self.lock_url(resource_id, &["cancel"])?;
        let response: CancelResponse = self.post_with_retry(url, &holder_body(holder_id)).await?;
        Ok(response.cancelled)
    }

    pub async fn status(&self, resource_id: &str) -> Result<StatusSnapshot, ClientError> {
        self.get_with_retry(self.lock_url(resource_id, &[])?).await
    }

    pub async fn holder_state(&self, resource_id: &str, holder_id: &str) -> Result<HolderState, ClientError> {
        let url = self.lock_url(resource_id, &["holders", holder_id])?;
        self.get_with_retry(url).await
    }

    pub async fn stats(&self) -> Result<CoordinatorStats, ClientError> {
        let url = self.endpoint(&["api", "locks"])?;
        self.get_with_retry(url).await
    }

    /// Release every hold and pending request of a holder
    pub async fn disconnect(&self, holder_id: &str) -> Result<usize, ClientError> {
        let url = self.endpoint(&["api", "holders", holder_id, "disconnect"])?;
        let response: DisconnectResponse = self.post_with_retry(url, &()).await?;
        Ok(response.released)
    }

    /// Best-effort release for a session that went away without releasing.
    ///
    /// Never blocks the caller; failures are only logged, since the lease monitor
    /// reclaims the holds anyway.
    pub fn release_on_disconnect(&self, holder_id: &str) -> JoinHandle<()> {
        let client = self.clone();
        let holder_id = holder_id.to_string();

        tokio::spawn(async move {
            match client.disconnect(&holder_id).await {
                Ok(released) => {
                    tracing::info!(holder = %holder_id, released, "Released holds of disconnected session");
                }
                Err(e) => {
                    tracing::warn!(holder = %holder_id, error = %e, "Recovery release failed; lease expiry will reclaim");
                }
            }
        })
    }

    /// Check coordinator health
    pub async fn health_check(&self) -> Result<bool, ClientError> {
        let url = self.endpoint(&["health", "live"])?;
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::NetworkError(e.to_string()))?;
        Ok(response.status().is_success())
    }

    // Internal: GET request with retry
    async fn get_with_retry<R: DeserializeOwned>(&self, url: Url) -> Result<R, ClientError> {
        self.send_with_retry::<(), R>(Method::GET, url, None).await
    }

    // Internal: POST request with retry
    async fn post_with_retry<T: Serialize, R: DeserializeOwned>(&self, url: Url, body: &T) -> Result<R, ClientError> {
        self.send_with_retry(Method::POST, url, Some(body)).await
    }

    async fn send_with_retry<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&T>,
    ) -> Result<R, ClientError> {
        let mut last_error = None;

        for attempt in 0..=self.config.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            let mut request = self.http_client.request(method.clone(), url.clone());
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return match response.json::<ApiResponse<R>>().await {
                        Ok(envelope) => envelope.data.ok_or_else(|| {
                            ClientError::InvalidResponse("Missing response data".to_string())
                        }),
                        Err(e) => Err(ClientError::ParseError(e.to_string())),
                    };
                }
                Ok(response) if response.status().is_client_error() => {
                    // The coordinator answered; retrying cannot change its mind
                    return Err(rejection(response).await);
                }
                Ok(response) => {
                    last_error = Some(ClientError::HttpError {
                        status: response.status().as_u16(),
                        message: response.text().await.unwrap_or_default(),
                    });
                }
                Err(e) => {
                    last_error = Some(ClientError::NetworkError(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or(ClientError::CoordinatorUnavailable))
    }
}

fn holder_body(holder_id: &str) -> HolderRequest {
    HolderRequest {
        holder_id: holder_id.to_string(),
    }
}

async fn rejection(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    match serde_json::from_str::<ApiResponse<serde_json::Value>>(&text) {
        Ok(ApiResponse {
            error: Some(message),
            code: Some(code),
            ..
        }) => ClientError::Rejected {
            status: status.as_u16(),
            code,
            message,
        },
        _ => ClientError::HttpError {
            status: status.as_u16(),
            message: text,
        },
    }
}

// ============================================================================
// Heartbeat Keeper
// ============================================================================

/// Renews a lease in the background until stopped or the lease is lost
pub struct HeartbeatKeeper {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HeartbeatKeeper {
    /// Start renewing `holder_id`'s lease on `resource_id` every `interval`
    pub fn start(client: CoordinatorClient, resource_id: &str, holder_id: &str, interval: Duration) -> Self {
        let (stop, mut stop_rx) = oneshot::channel();
        let resource_id = resource_id.to_string();
        let holder_id = holder_id.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The acquire itself started the lease
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut stop_rx => break,
                }

                match client.heartbeat(&resource_id, &holder_id).await {
                    Ok(ack) => {
                        tracing::debug!(resource = %resource_id, holder = %holder_id, expires_in_ms = ack.expires_in_ms, "Lease renewed");
                    }
                    Err(e) if e.is_lease_lost() => {
                        tracing::warn!(resource = %resource_id, holder = %holder_id, error = %e, "Lease lost; heartbeat keeper stopping");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(resource = %resource_id, holder = %holder_id, error = %e, "Heartbeat failed");
                    }
                }
            }
        });

        Self {
            stop: Some(stop),
            task,
        }
    }

    /// Whether the keeper gave up or was stopped
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for HeartbeatKeeper {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Client Errors
// ============================================================================

/// Client errors
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Initialization error: {0}")]
    InitError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    /// The coordinator refused the operation (4xx with an error code)
    #[error("Rejected ({status} {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    #[error("HTTP error ({status}): {message}")]
    HttpError { status: u16, message: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Coordinator unavailable")]
    CoordinatorUnavailable,
}

impl ClientError {
    /// Machine-readable code of a coordinator rejection
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }

    /// The caller no longer holds the resource and must acquire again
    pub fn is_lease_lost(&self) -> bool {
        matches!(self.code(), Some("lease_expired" | "not_holder"))
    }
}

impl MarkgateError for ClientError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::NetworkError(_) | Self::CoordinatorUnavailable => true,
            Self::HttpError { status, .. } => StatusCode::from_u16(*status)
                .map(|s| s.is_server_error())
                .unwrap_or(false),
            Self::Rejected { code, .. } => matches!(code.as_str(), "lock_busy" | "lease_expired"),
            Self::InitError(_) | Self::ParseError(_) | Self::InvalidResponse(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Rejected { code, .. } if code.starts_with("invalid_") => ErrorCategory::Validation,
            Self::Rejected { .. } => ErrorCategory::Coordination,
            Self::InitError(_) => ErrorCategory::Config,
            _ => ErrorCategory::Network,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
