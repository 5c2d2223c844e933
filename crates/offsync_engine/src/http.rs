//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync engine.
//! The actual HTTP client is abstracted via a trait so tests can swap in
//! an in-process client; [`ReqwestClient`] is the production one.
//!
//! Endpoints, relative to the server URL:
//!
//! | Call | Method | Path |
//! |---|---|---|
//! | reconcile | POST | `/sync/reconcile` |
//! | register device | POST | `/devices/register` |
//! | fetch config | GET | `/devices/{id}/config` |
//! | update config | PUT | `/devices/{id}/config` |

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use offsync_protocol::{DeviceConfig, DeviceRegistration, ReconcileRequest, ReconcileResponse};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use url::Url;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
}

/// A failed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFailure {
    /// Response status, if the server answered.
    pub status: Option<u16>,
    /// Whether the request ran out of time.
    pub timed_out: bool,
    /// Description or response body.
    pub message: String,
}

impl HttpFailure {
    /// A failure before any response arrived.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            timed_out: false,
            message: message.into(),
        }
    }

    /// A non-success response.
    pub fn response(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            timed_out: false,
            message: message.into(),
        }
    }

    fn into_sync_error(self) -> SyncError {
        if self.timed_out {
            return SyncError::Timeout;
        }
        match self.status {
            None => SyncError::transport_retryable(self.message),
            Some(status) if status >= 500 => {
                SyncError::ServerError(format!("{status}: {}", self.message))
            }
            Some(status @ (408 | 429)) => {
                SyncError::transport_retryable(format!("{status}: {}", self.message))
            }
            Some(status) => SyncError::transport_fatal(format!("{status}: {}", self.message)),
        }
    }
}

/// HTTP client abstraction.
///
/// Bodies are JSON bytes.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response body.
    async fn send(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, HttpFailure>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// HTTP-based sync transport.
///
/// Uses JSON encoding for request/response bodies.
pub struct HttpTransport<C: HttpClient> {
    base_url: Url,
    client: C,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> std::fmt::Debug for HttpTransport<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_str())
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: &str, client: C) -> SyncResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::Config(format!("invalid server url {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Config(format!(
                "server url cannot be a base: {base_url}"
            )));
        }
        Ok(Self {
            base_url,
            client,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        })
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Checks if the transport is usable.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    /// Closes the transport; every later call fails with `NotConnected`.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| SyncError::Config(format!("server url cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn exchange<Req, Res>(
        &self,
        method: HttpMethod,
        segments: &[&str],
        request: Option<&Req>,
    ) -> SyncResult<Res>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let body = request
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| SyncError::Protocol(format!("failed to encode request: {e}")))?;

        let url = self.endpoint(segments)?;
        let response_body = match self.client.send(method, url.as_str(), body).await {
            Ok(body) => body,
            Err(failure) => {
                *self.last_error.write() = Some(failure.message.clone());
                return Err(failure.into_sync_error());
            }
        };

        *self.last_error.write() = None;

        serde_json::from_slice(&response_body)
            .map_err(|e| SyncError::Protocol(format!("failed to decode response: {e}")))
    }
}

impl HttpTransport<ReqwestClient> {
    /// Builds the production transport from engine configuration.
    pub fn from_config(config: &EngineConfig) -> SyncResult<Self> {
        let client = ReqwestClient::new(config.request_timeout, config.auth_token.as_deref())?;
        Self::new(&config.server_url, client)
    }
}

#[async_trait]
impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn reconcile(&self, request: &ReconcileRequest) -> SyncResult<ReconcileResponse> {
        self.exchange(HttpMethod::Post, &["sync", "reconcile"], Some(request))
            .await
    }

    async fn register_device(&self, registration: &DeviceRegistration) -> SyncResult<DeviceConfig> {
        self.exchange(HttpMethod::Post, &["devices", "register"], Some(registration))
            .await
    }

    async fn fetch_device_config(&self, device_id: &str) -> SyncResult<DeviceConfig> {
        self.exchange::<(), _>(HttpMethod::Get, &["devices", device_id, "config"], None)
            .await
    }

    async fn update_device_config(&self, config: &DeviceConfig) -> SyncResult<DeviceConfig> {
        self.exchange(
            HttpMethod::Put,
            &["devices", &config.device_id, "config"],
            Some(config),
        )
        .await
    }
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with a per-request timeout and optional bearer token.
    pub fn new(timeout: Duration, auth_token: Option<&str>) -> SyncResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        if let Some(token) = auth_token {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SyncError::Config(format!("invalid auth token: {e}")))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, HttpFailure> {
        let mut request = match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Put => self.client.put(url),
        };
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(failure_from)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(failure_from)?;
        if !status.is_success() {
            return Err(HttpFailure::response(
                status.as_u16(),
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
        Ok(bytes.to_vec())
    }
}

fn failure_from(error: reqwest::Error) -> HttpFailure {
    HttpFailure {
        status: error.status().map(|s| s.as_u16()),
        timed_out: error.is_timeout(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct TestClient {
        response: Mutex<Option<Result<Vec<u8>, HttpFailure>>>,
        calls: Mutex<Vec<(HttpMethod, String)>>,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                response: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn respond_json(&self, value: &impl Serialize) {
            *self.response.lock() = Some(Ok(serde_json::to_vec(value).unwrap()));
        }

        fn fail(&self, failure: HttpFailure) {
            *self.response.lock() = Some(Err(failure));
        }
    }

    #[async_trait]
    impl HttpClient for TestClient {
        async fn send(
            &self,
            method: HttpMethod,
            url: &str,
            _body: Option<Vec<u8>>,
        ) -> Result<Vec<u8>, HttpFailure> {
            self.calls.lock().push((method, url.to_string()));
            self.response
                .lock()
                .clone()
                .unwrap_or_else(|| Err(HttpFailure::network("no response set")))
        }
    }

    fn request() -> ReconcileRequest {
        ReconcileRequest {
            device_id: "dev-1".into(),
            upload_changes: Vec::new(),
            last_sync_time: None,
            entities: vec!["Customer".into()],
        }
    }

    #[test]
    fn rejects_invalid_url() {
        let result = HttpTransport::new("not a url", TestClient::new());
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn reconcile_posts_to_endpoint() {
        let client = TestClient::new();
        client.respond_json(&ReconcileResponse {
            upload_batch_id: "batch-9".into(),
            download_changes: Vec::new(),
            timestamp: Utc::now(),
            acknowledgements: None,
        });
        let transport = HttpTransport::new("https://sync.example.com/api/", client).unwrap();

        let response = transport.reconcile(&request()).await.unwrap();
        assert_eq!(response.upload_batch_id, "batch-9");
        assert_eq!(
            transport.client.calls.lock().clone(),
            vec![(
                HttpMethod::Post,
                "https://sync.example.com/api/sync/reconcile".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn device_id_is_escaped() {
        let client = TestClient::new();
        client.respond_json(&DeviceConfig::defaults_for("pos 7"));
        let transport = HttpTransport::new("https://sync.example.com", client).unwrap();

        transport.fetch_device_config("pos 7").await.unwrap();
        let calls = transport.client.calls.lock().clone();
        assert_eq!(calls[0].0, HttpMethod::Get);
        assert_eq!(calls[0].1, "https://sync.example.com/devices/pos%207/config");
    }

    #[tokio::test]
    async fn failures_are_classified() {
        let client = TestClient::new();
        let transport = HttpTransport::new("https://sync.example.com", client).unwrap();

        transport.client.fail(HttpFailure::network("connection refused"));
        let err = transport.reconcile(&request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.last_error().as_deref(), Some("connection refused"));

        transport.client.fail(HttpFailure::response(503, "maintenance"));
        assert!(matches!(
            transport.reconcile(&request()).await,
            Err(SyncError::ServerError(_))
        ));

        transport.client.fail(HttpFailure::response(400, "bad request"));
        let err = transport.reconcile(&request()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.is_transport());

        transport.client.fail(HttpFailure {
            status: None,
            timed_out: true,
            message: "deadline".into(),
        });
        assert!(matches!(
            transport.reconcile(&request()).await,
            Err(SyncError::Timeout)
        ));
    }

    #[tokio::test]
    async fn bad_body_is_protocol_error() {
        let client = TestClient::new();
        *client.response.lock() = Some(Ok(b"<html>".to_vec()));
        let transport = HttpTransport::new("https://sync.example.com", client).unwrap();

        assert!(matches!(
            transport.reconcile(&request()).await,
            Err(SyncError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn closed_transport_refuses_calls() {
        let transport = HttpTransport::new("https://sync.example.com", TestClient::new()).unwrap();
        assert!(transport.is_connected());
        transport.close();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.reconcile(&request()).await,
            Err(SyncError::NotConnected)
        ));
    }
}
