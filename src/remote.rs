//! # External API Client
//!
//! Thin boundary around the remote system's create/update/delete endpoints:
//!
//! ```text
//! POST   /{resource}                -> assigned id
//! PATCH  /{resource}/{external_id}
//! DELETE /{resource}/{external_id}
//! ```
//!
//! Each call is a single round trip bounded by the configured timeout. Retry
//! policy lives in [`crate::retry`]; this module only reports what happened in
//! enough detail (status, body, retry-after hint) for it to be classified.

use crate::config::RemoteConfig;
use crate::error::{RemoteError, SyncError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_ERROR_BODY_CHARS: usize = 2000;

/// Result of a successful remote create
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedRecord {
    pub external_id: String,
    /// Full response body, for back-mapping into the local shape
    pub response: Value,
}

/// Remote system operations used by the dispatcher
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create(&self, resource: &str, body: &Value) -> Result<CreatedRecord, RemoteError>;

    async fn update(
        &self,
        resource: &str,
        external_id: &str,
        body: &Value,
    ) -> Result<(), RemoteError>;

    async fn delete(&self, resource: &str, external_id: &str) -> Result<(), RemoteError>;
}

/// reqwest-backed implementation of [`RemoteApi`]
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    client: Client,
    base_url: Url,
    timeout: Duration,
    id_pointer: String,
}

impl HttpRemoteClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, SyncError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| SyncError::Configuration(format!("Invalid remote base URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Configuration(format!(
                "Remote base URL cannot be a base: {}",
                config.base_url
            )));
        }

        let timeout = config.request_timeout();
        let mut builder = Client::builder()
            .timeout(timeout)
            .user_agent(format!("outbox-sync/{}", env!("CARGO_PKG_VERSION")));

        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {token}").parse().map_err(|e| {
                    SyncError::Configuration(format!("Invalid bearer token: {e}"))
                })?,
            );
            builder = builder.default_headers(headers);
        } else {
            warn!("No remote credential configured; requests will be unauthenticated");
        }

        let client = builder
            .build()
            .map_err(|e| SyncError::Configuration(format!("Failed to create HTTP client: {e}")))?;

        info!(
            base_url = %config.base_url,
            timeout_ms = timeout.as_millis() as u64,
            "Created remote API client"
        );

        Ok(Self {
            client,
            base_url,
            timeout,
            id_pointer: config.id_pointer.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn transport_error(&self, error: reqwest::Error) -> RemoteError {
        if error.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Network(error.to_string())
        }
    }

    /// Turn a non-2xx response into a classified error
    async fn error_from_response(response: reqwest::Response) -> RemoteError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let mut body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        if body.len() > MAX_ERROR_BODY_CHARS {
            body = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited { retry_after },
            s if s.is_server_error() => RemoteError::Server {
                status: s.as_u16(),
                body,
            },
            s if s.is_client_error() => RemoteError::Client {
                status: s.as_u16(),
                body,
            },
            s => RemoteError::Protocol(format!("unexpected status {s}: {body}")),
        }
    }

    fn extract_id(&self, response: &Value) -> Result<String, RemoteError> {
        match response.pointer(&self.id_pointer) {
            Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(RemoteError::Protocol(format!(
                "create response has no id at '{}'",
                self.id_pointer
            ))),
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteClient {
    async fn create(&self, resource: &str, body: &Value) -> Result<CreatedRecord, RemoteError> {
        let url = self.url(&[resource]);
        debug!(%url, "POST remote create");

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let response: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout(self.timeout)
            } else {
                RemoteError::Protocol(format!("create response is not JSON: {e}"))
            }
        })?;
        let external_id = self.extract_id(&response)?;

        Ok(CreatedRecord {
            external_id,
            response,
        })
    }

    async fn update(
        &self,
        resource: &str,
        external_id: &str,
        body: &Value,
    ) -> Result<(), RemoteError> {
        let url = self.url(&[resource, external_id]);
        debug!(%url, "PATCH remote update");

        let response = self
            .client
            .patch(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from_response(response).await)
        }
    }

    async fn delete(&self, resource: &str, external_id: &str) -> Result<(), RemoteError> {
        let url = self.url(&[resource, external_id]);
        debug!(%url, "DELETE remote record");

        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from_response(response).await)
        }
    }
}
