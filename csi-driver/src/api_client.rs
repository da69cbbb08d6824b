//! Volume-management API client
//!
//! JSON over HTTP client for the remote storage API used by the controller
//! service. Includes automatic retry with exponential backoff for transient
//! failures.

use std::future::Future;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::metrics;

/// Maximum number of retry attempts for transient failures
const MAX_RETRIES: u32 = 3;
/// Initial backoff delay in milliseconds
const INITIAL_BACKOFF_MS: u64 = 100;
/// Maximum backoff delay in milliseconds
const MAX_BACKOFF_MS: u64 = 5000;
/// Backoff multiplier (exponential factor)
const BACKOFF_MULTIPLIER: u64 = 2;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid API client configuration: {0}")]
    Config(String),

    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path}: resource not found")]
    NotFound { path: String },

    #[error("{path} returned HTTP {status}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    /// Transient failures that may succeed on retry:
    /// - connection / timeout errors
    /// - 429 Too Many Requests
    /// - 502, 503, 504 from a proxy or an overloaded server
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport { .. } => true,
            ApiError::Status { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

impl From<ApiError> for tonic::Status {
    fn from(err: ApiError) -> Self {
        match &err {
            ApiError::NotFound { .. } => tonic::Status::not_found(err.to_string()),
            ApiError::Transport { .. } => tonic::Status::unavailable(err.to_string()),
            ApiError::Status { status, .. } if (400..500).contains(status) => {
                tonic::Status::invalid_argument(err.to_string())
            }
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateVolumeRequest<'a> {
    pub initiator_name: &'a str,
    pub capacity: i64,
}

/// Volume as returned by create and resize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VolumeResponse {
    pub volume_id: String,
    #[serde(rename = "targetPortal", default)]
    pub target_portal: String,
    #[serde(default)]
    pub iqn: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub lun: String,
    #[serde(rename = "discoveryCHAPAuth", default, deserialize_with = "string_or_bool")]
    pub discovery_chap_auth: String,
    #[serde(rename = "sessionCHAPAuth", default, deserialize_with = "string_or_bool")]
    pub session_chap_auth: String,
}

#[derive(Debug, Clone, Serialize)]
struct VolumeIdRequest<'a> {
    volume_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct ResizeVolumeRequest<'a> {
    volume_id: &'a str,
    capacity: i64,
}

#[derive(Debug, Clone, Serialize)]
struct SnapshotIdRequest<'a> {
    snapshot_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SnapshotResponse {
    pub snapshot_id: String,
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn string_or_bool<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or bool, got {}",
            other
        ))),
    }
}

/// Execute an async operation with exponential backoff retry.
///
/// Retries the operation up to MAX_RETRIES times for retryable errors,
/// with exponential backoff between attempts.
async fn with_retry<T, F, Fut>(operation_name: &str, mut operation: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                attempt += 1;

                if !err.is_retryable() || attempt > MAX_RETRIES {
                    if attempt > 1 {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %err,
                            "Operation failed after retries"
                        );
                    }
                    return Err(err);
                }

                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_retries = MAX_RETRIES,
                    error = %err,
                    backoff_ms = backoff_ms,
                    "Retryable error, backing off"
                );

                metrics::record_retry(operation_name);

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

                backoff_ms = (backoff_ms * BACKOFF_MULTIPLIER).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// Client for the volume-management API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ApiError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send one JSON request and return the response body of a 2xx reply.
    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<String, ApiError> {
        let mut request = self.http.request(method, self.url(path)).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|source| ApiError::Transport {
            path: path.to_string(),
            source,
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|source| ApiError::Transport {
            path: path.to_string(),
            source,
        })?;

        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound {
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: text.trim().to_string(),
            });
        }
        Ok(text)
    }

    async fn call_json<B, R>(&self, method: Method, path: &str, body: &B) -> Result<R, ApiError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let text = self.call(method, path, body).await?;
        decode(path, &text)
    }

    async fn call_empty<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<(), ApiError> {
        self.call(method, path, body).await.map(|_| ())
    }

    /// Create a volume of `capacity` bytes exported to `initiator_name`.
    ///
    /// Automatically retries on transient failures with exponential backoff.
    pub async fn create_volume(
        &self,
        initiator_name: &str,
        capacity: i64,
    ) -> Result<VolumeResponse, ApiError> {
        let body = CreateVolumeRequest {
            initiator_name,
            capacity,
        };
        debug!(capacity, "Creating volume with retry");

        with_retry("create_volume", || {
            self.call_json(Method::POST, "/api/volumes/create", &body)
        })
        .await
    }

    /// Delete a volume by its ID.
    ///
    /// Automatically retries on transient failures with exponential backoff.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<(), ApiError> {
        let body = VolumeIdRequest { volume_id };
        debug!(volume_id = volume_id, "Deleting volume with retry");

        with_retry("delete_volume", || {
            self.call_empty(Method::DELETE, "/api/volumes/delete", &body)
        })
        .await
    }

    /// Grow a volume to `capacity` bytes.
    ///
    /// Automatically retries on transient failures with exponential backoff.
    pub async fn resize_volume(
        &self,
        volume_id: &str,
        capacity: i64,
    ) -> Result<VolumeResponse, ApiError> {
        let body = ResizeVolumeRequest {
            volume_id,
            capacity,
        };
        debug!(volume_id = volume_id, capacity, "Resizing volume with retry");

        with_retry("resize_volume", || {
            self.call_json(Method::POST, "/api/volumes/resize", &body)
        })
        .await
    }

    /// Create a snapshot of a volume.
    ///
    /// Automatically retries on transient failures with exponential backoff.
    pub async fn create_snapshot(&self, volume_id: &str) -> Result<SnapshotResponse, ApiError> {
        let body = VolumeIdRequest { volume_id };
        debug!(volume_id = volume_id, "Creating snapshot with retry");

        with_retry("create_snapshot", || {
            self.call_json(Method::POST, "/api/snapshot/create", &body)
        })
        .await
    }

    /// Delete a snapshot by its ID.
    ///
    /// Automatically retries on transient failures with exponential backoff.
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), ApiError> {
        let body = SnapshotIdRequest { snapshot_id };
        debug!(snapshot_id = snapshot_id, "Deleting snapshot with retry");

        with_retry("delete_snapshot", || {
            self.call_empty(Method::DELETE, "/api/snapshot/delete", &body)
        })
        .await
    }
}

fn decode<R: DeserializeOwned>(path: &str, text: &str) -> Result<R, ApiError> {
    serde_json::from_str(text).map_err(|source| ApiError::Decode {
        path: path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn status(code: u16) -> ApiError {
        ApiError::Status {
            path: "/api/volumes/create".to_string(),
            status: code,
            body: "boom".to_string(),
        }
    }

    #[test]
    fn test_is_retryable() {
        // Retryable errors
        assert!(status(503).is_retryable());
        assert!(status(502).is_retryable());
        assert!(status(504).is_retryable());
        assert!(status(429).is_retryable());

        // Non-retryable errors
        assert!(!status(500).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(
            !ApiError::NotFound {
                path: "/api/volumes/delete".to_string()
            }
            .is_retryable()
        );
        assert!(!ApiError::Config("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        let s: tonic::Status = ApiError::NotFound {
            path: "/api/snapshot/delete".to_string(),
        }
        .into();
        assert_eq!(s.code(), tonic::Code::NotFound);
        assert_eq!(tonic::Status::from(status(400)).code(), tonic::Code::InvalidArgument);
        assert_eq!(tonic::Status::from(status(500)).code(), tonic::Code::Internal);
    }

    #[test]
    fn test_decode_volume_response() {
        let json = r#"{
            "volume_id": "vol-1",
            "targetPortal": "10.0.0.5:3260",
            "iqn": "iqn.2025-01.test:vol1",
            "lun": "0",
            "discoveryCHAPAuth": "false",
            "sessionCHAPAuth": true
        }"#;
        let volume: VolumeResponse = decode("/api/volumes/create", json).unwrap();
        assert_eq!(volume.volume_id, "vol-1");
        assert_eq!(volume.target_portal, "10.0.0.5:3260");
        assert_eq!(volume.lun, "0");
        assert_eq!(volume.discovery_chap_auth, "false");
        assert_eq!(volume.session_chap_auth, "true");

        let volume: VolumeResponse =
            decode("/api/volumes/resize", r#"{"volume_id":"vol-1","lun":3}"#).unwrap();
        assert_eq!(volume.lun, "3");
        assert_eq!(volume.iqn, "");
    }

    #[test]
    fn test_decode_error() {
        let err = decode::<SnapshotResponse>("/api/snapshot/create", "not json").unwrap_err();
        assert!(matches!(err, ApiError::Decode { .. }));
        assert!(err.to_string().contains("/api/snapshot/create"));
    }

    #[test]
    fn test_request_bodies() {
        let body = serde_json::to_value(CreateVolumeRequest {
            initiator_name: "iqn.2025-01.test:node-a",
            capacity: 1 << 30,
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"initiator_name": "iqn.2025-01.test:node-a", "capacity": 1073741824})
        );
        let body = serde_json::to_value(SnapshotIdRequest { snapshot_id: "snap-1" }).unwrap();
        assert_eq!(body, serde_json::json!({"snapshot_id": "snap-1"}));
    }

    #[test]
    fn test_client_trims_base_url() {
        let client = ApiClient::new(&ApiConfig {
            url: "http://api.local:8080/".to_string(),
            token: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://api.local:8080");
        assert_eq!(client.url("/api/volumes/create"), "http://api.local:8080/api/volumes/create");
    }

    #[tokio::test]
    async fn test_with_retry_success_after_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry("test", || {
            let c = counter_clone.clone();
            async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 { Err(status(503)) } else { Ok(42) }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_non_retryable_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<i32, ApiError> = with_retry("test", || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::NotFound {
                    path: "/api/volumes/delete".to_string(),
                })
            }
        })
        .await;

        assert!(result.unwrap_err().is_not_found());
        // Should not retry on non-retryable error
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhausted() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<i32, ApiError> = with_retry("test", || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(status(503))
            }
        })
        .await;

        assert!(result.is_err());
        // Should retry MAX_RETRIES + 1 times (initial + retries)
        assert_eq!(counter.load(Ordering::SeqCst), MAX_RETRIES + 1);
    }
}
