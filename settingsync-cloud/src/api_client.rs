//! HTTP client for the sync relay.
//!
//! Every call is a JSON POST under the configured base URL. The client is
//! stateless apart from its connection pool; identity headers are resolved
//! per request from the injected device and auth providers.

use crate::config::RelayClientConfig;
use crate::device::DeviceProvider;
use crate::error::{CloudError, CloudResult};
use crate::types::*;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

pub const PUSH_PATH: &str = "/v1/sync/push";
pub const PULL_PATH: &str = "/v1/sync/pull";
pub const SNAPSHOT_PATH: &str = "/v1/sync/snapshot";
pub const KEY_INIT_PATH: &str = "/v1/sync/key/init";
pub const KEY_FETCH_PATH: &str = "/v1/sync/key/fetch";
pub const KEY_RESET_PREPARE_PATH: &str = "/v1/sync/key/reset/prepare";
pub const KEY_RESET_PATH: &str = "/v1/sync/key/reset";

/// Change-stream endpoints.
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn push(&self, req: &PushRequest, trace_id: &str) -> CloudResult<PushResponse>;
    async fn pull(&self, req: &PullRequest, trace_id: &str) -> CloudResult<PullResponse>;
    async fn snapshot(&self, req: &PullRequest, trace_id: &str) -> CloudResult<PullResponse>;
}

/// Key-management endpoints.
#[async_trait]
pub trait KeyClient: Send + Sync {
    async fn init_key(&self, req: &KeyInitRequest, trace_id: &str)
    -> CloudResult<KeyInitResponse>;
    async fn fetch_key(
        &self,
        req: &KeyFetchRequest,
        trace_id: &str,
    ) -> CloudResult<KeyFetchResponse>;
    async fn prepare_key_reset(&self, trace_id: &str) -> CloudResult<KeyResetPrepareResponse>;
    async fn reset_key(&self, reset_token: &str, trace_id: &str) -> CloudResult<KeyResetResponse>;
}

/// Supplies the bearer token, if the host has one.
pub trait AuthProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed bearer token.
#[derive(Clone)]
pub struct StaticAuthProvider(String);

impl StaticAuthProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl AuthProvider for StaticAuthProvider {
    fn bearer_token(&self) -> Option<String> {
        let token = self.0.trim();
        (!token.is_empty()).then(|| token.to_string())
    }
}

// Never print the token.
impl std::fmt::Debug for StaticAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticAuthProvider(<redacted>)")
    }
}

/// Fresh trace id for one relay attempt.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// reqwest-backed relay client.
pub struct HttpRelayClient {
    client: Client,
    base_url: String,
    app_version: String,
    platform: String,
    device: Arc<dyn DeviceProvider>,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl HttpRelayClient {
    pub fn new(
        config: &RelayClientConfig,
        device: Arc<dyn DeviceProvider>,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> CloudResult<Self> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(CloudError::Config("relay base_url is empty".into()));
        }

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url,
            app_version: config.app_version.trim().to_string(),
            platform: config.resolved_platform(),
            device,
            auth,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends the request and maps any status >= 400 to [`CloudError::Api`].
    async fn send<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        trace_id: &str,
    ) -> CloudResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body);

        if let Some(token) = self.auth.as_ref().and_then(|a| a.bearer_token()) {
            req = req.bearer_auth(token);
        }
        if let Ok(device_id) = self.device.device_id() {
            req = req.header("X-Device-Id", device_id);
        }
        if !self.app_version.is_empty() {
            req = req.header("X-App-Version", &self.app_version);
        }
        if !self.platform.is_empty() {
            req = req.header("X-Platform", &self.platform);
        }
        if !trace_id.is_empty() {
            req = req.header("X-Trace-Id", trace_id);
        }

        debug!(trace_id, "POST {path}");
        let resp = req.send().await?;

        let status = resp.status();
        if status.as_u16() >= 400 {
            let body = resp.text().await.unwrap_or_default().trim().to_string();
            return Err(CloudError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn post<B, T>(&self, path: &str, body: &B, trace_id: &str) -> CloudResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self.send(path, body, trace_id).await?;
        Ok(resp.json().await?)
    }

    /// Like [`Self::post`], but an empty body decodes to `T::default()`.
    async fn post_lenient<B, T>(&self, path: &str, body: &B, trace_id: &str) -> CloudResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned + Default,
    {
        let text = self.send(path, body, trace_id).await?.text().await?;
        if text.trim().is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn push(&self, req: &PushRequest, trace_id: &str) -> CloudResult<PushResponse> {
        self.post(PUSH_PATH, req, trace_id).await
    }

    async fn pull(&self, req: &PullRequest, trace_id: &str) -> CloudResult<PullResponse> {
        self.post(PULL_PATH, req, trace_id).await
    }

    async fn snapshot(&self, req: &PullRequest, trace_id: &str) -> CloudResult<PullResponse> {
        self.post(SNAPSHOT_PATH, req, trace_id).await
    }
}

#[async_trait]
impl KeyClient for HttpRelayClient {
    async fn init_key(
        &self,
        req: &KeyInitRequest,
        trace_id: &str,
    ) -> CloudResult<KeyInitResponse> {
        self.post_lenient(KEY_INIT_PATH, req, trace_id).await
    }

    async fn fetch_key(
        &self,
        req: &KeyFetchRequest,
        trace_id: &str,
    ) -> CloudResult<KeyFetchResponse> {
        self.post(KEY_FETCH_PATH, req, trace_id).await
    }

    async fn prepare_key_reset(&self, trace_id: &str) -> CloudResult<KeyResetPrepareResponse> {
        self.post(KEY_RESET_PREPARE_PATH, &KeyResetPrepareRequest {}, trace_id)
            .await
    }

    async fn reset_key(&self, reset_token: &str, trace_id: &str) -> CloudResult<KeyResetResponse> {
        let req = KeyResetRequest {
            reset_token: reset_token.to_string(),
            confirm: true,
        };
        self.post_lenient(KEY_RESET_PATH, &req, trace_id).await
    }
}
