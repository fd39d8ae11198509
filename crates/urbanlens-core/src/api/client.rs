//! HTTP transport for the UrbanLens backend API.
//!
//! `ApiClient` sends JSON requests relative to the configured base URL,
//! attaches the bearer token from the shared `TokenStore`, and applies the
//! retry policy: 5xx responses, network errors and timeouts are retried up
//! to `max_retries` times with a linear backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::TokenStore;
use crate::config::{Config, DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_BACKOFF};
use crate::fetch::Fetch;

use super::ApiError;

/// Transport settings, usually taken from `Config`.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    /// Retry `n` (1-based) waits `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl From<&Config> for TransportConfig {
    fn from(config: &Config) -> Self {
        Self {
            base_url: config.api_base_url.clone(),
            request_timeout: config.request_timeout,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
        }
    }
}

/// API client for the UrbanLens backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenStore>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl ApiClient {
    pub fn new(config: TransportConfig, tokens: Arc<dyn TokenStore>) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            base_url: config.base_url,
            tokens,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
        })
    }

    pub fn from_config(config: &Config, tokens: Arc<dyn TokenStore>) -> Result<Self, ApiError> {
        Self::new(TransportConfig::from(config), tokens)
    }

    /// Absolute URLs pass through; anything else is appended to the base URL.
    pub fn resolve_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    fn transport_error(err: reqwest::Error) -> ApiError {
        if err.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Network(err)
        }
    }

    /// Drop the stored credentials after the backend rejected them.
    fn invalidate_session(&self, status: StatusCode) {
        info!(status = status.as_u16(), "Session rejected by backend, clearing stored token");
        if let Err(e) = self.tokens.clear() {
            warn!(error = %e, "Failed to clear stored token");
        }
    }

    async fn send_once(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Value, ApiError> {
        let mut request = self
            .client
            .request(method, url)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = self.tokens.token() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(Self::transport_error)?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.invalidate_session(status);
            return Err(ApiError::SessionExpired {
                status: status.as_u16(),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Object(Default::default()));
        }

        let bytes = response.bytes().await.map_err(Self::transport_error)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::InvalidResponse(format!("{} returned malformed JSON: {}", url, e)))
    }

    /// Linear backoff: retry `n` (1-based) waits `n * retry_backoff`.
    fn retry_delay(&self, retry: u32) -> Duration {
        self.retry_backoff * retry
    }

    /// Send a request with the retry policy applied.
    pub async fn request(&self, method: Method, endpoint: &str, body: Option<&Value>) -> Result<Value, ApiError> {
        let url = self.resolve_url(endpoint);
        let mut attempt: u32 = 0;

        loop {
            debug!(%method, url = %url, attempt, "Sending request");
            match self.send_once(method.clone(), &url, body).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.retry_delay(attempt);
                    warn!(
                        url = %url,
                        retry = attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// GET returning the raw JSON body.
    pub async fn get_value(&self, endpoint: &str) -> Result<Value, ApiError> {
        self.request(Method::GET, endpoint, None).await
    }

    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        let value = self.get_value(endpoint).await?;
        Self::decode(endpoint, value)
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, endpoint: &str, body: Option<&B>) -> Result<T, ApiError> {
        let body = Self::encode(body)?;
        let value = self.request(Method::POST, endpoint, body.as_ref()).await?;
        Self::decode(endpoint, value)
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize>(&self, endpoint: &str, body: Option<&B>) -> Result<T, ApiError> {
        let body = Self::encode(body)?;
        let value = self.request(Method::PATCH, endpoint, body.as_ref()).await?;
        Self::decode(endpoint, value)
    }

    pub async fn delete(&self, endpoint: &str) -> Result<(), ApiError> {
        self.request(Method::DELETE, endpoint, None).await?;
        Ok(())
    }

    fn encode<B: Serialize>(body: Option<&B>) -> Result<Option<Value>, ApiError> {
        body.map(serde_json::to_value)
            .transpose()
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))
    }

    fn decode<T: DeserializeOwned>(endpoint: &str, value: Value) -> Result<T, ApiError> {
        serde_json::from_value(value)
            .map_err(|e| ApiError::InvalidResponse(format!("Unexpected response shape from {}: {}", endpoint, e)))
    }
}

#[async_trait]
impl Fetch for ApiClient {
    fn resolve_key(&self, endpoint: &str) -> String {
        self.resolve_url(endpoint)
    }

    async fn fetch(&self, url: &str) -> Result<Value, ApiError> {
        self.get_value(url).await
    }
}
