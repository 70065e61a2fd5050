//! JSON REST client for Azure Resource Manager and Microsoft Graph

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Provisioning of {path} ended in state {state}")]
    ProvisioningFailed { path: String, state: String },
    #[error("Timed out after {seconds}s waiting for {path}")]
    Timeout { path: String, seconds: u64 },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Exponential backoff bounded by a deadline
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    deadline: Instant,
}

impl Backoff {
    pub fn new(initial: Duration, max_delay: Duration, timeout: Duration) -> Self {
        Self {
            delay: initial,
            max_delay,
            deadline: Instant::now() + timeout,
        }
    }

    /// Sleep for the next interval; `false` once the deadline has passed
    pub async fn wait(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }
        sleep(self.delay.min(self.deadline - now)).await;
        self.delay = (self.delay * 2).min(self.max_delay);
        true
    }
}

/// Polling intervals for long-running operations
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub initial: Duration,
    pub max_delay: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// JSON REST client bound to one service endpoint
#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    poll: PollSettings,
}

impl RestClient {
    /// Create a new client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            poll: PollSettings::default(),
        })
    }

    /// Set the bearer token
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build headers for requests
    fn headers(&self, extra: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        for (name, value) in extra {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }

        headers
    }

    /// Send a request with optional JSON body and extra headers
    pub async fn request<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        extra_headers: &[(&'static str, &str)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "Sending request");

        let mut request = self
            .client
            .request(method, &url)
            .headers(self.headers(extra_headers));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        self.handle_response(path, response).await
    }

    /// GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request::<T, Value>(Method::GET, path, None, &[]).await
    }

    /// POST request
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.request(Method::POST, path, Some(body), &[]).await
    }

    /// PUT request
    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.request(Method::PUT, path, Some(body), &[]).await
    }

    /// PATCH request
    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.request(Method::PATCH, path, Some(body), &[]).await
    }

    /// DELETE request
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.request::<Value, Value>(Method::DELETE, path, None, &[])
            .await
            .map(|_| ())
    }

    /// Poll an ARM resource until `properties.provisioningState` settles
    pub async fn wait_for_provisioning(&self, path: &str, timeout: Duration) -> Result<Value> {
        let mut backoff = Backoff::new(self.poll.initial, self.poll.max_delay, timeout);
        loop {
            let resource: Value = self.get(path).await?;
            let state = resource["properties"]["provisioningState"]
                .as_str()
                .unwrap_or("Succeeded");
            match state {
                "Succeeded" => return Ok(resource),
                "Failed" | "Canceled" => {
                    return Err(ClientError::ProvisioningFailed {
                        path: path.to_string(),
                        state: state.to_string(),
                    })
                }
                _ => debug!(path, state, "Still provisioning"),
            }
            if !backoff.wait().await {
                return Err(ClientError::Timeout {
                    path: path.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
        }
    }

    /// Poll until the resource at `path` reports not found
    pub async fn wait_for_deletion(&self, path: &str, timeout: Duration) -> Result<()> {
        let mut backoff = Backoff::new(self.poll.initial, self.poll.max_delay, timeout);
        loop {
            match self.get::<Value>(path).await {
                Err(ClientError::NotFound(_)) => return Ok(()),
                Err(e) => warn!(path, error = %e, "Polling deletion failed"),
                Ok(_) => debug!(path, "Still deleting"),
            }
            if !backoff.wait().await {
                return Err(ClientError::Timeout {
                    path: path.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
        }
    }

    /// Handle API response
    async fn handle_response<T: DeserializeOwned>(
        &self,
        path: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            if body.trim().is_empty() {
                // 202/204 carry no body
                return Ok(serde_json::from_value(Value::Null)?);
            }
            Ok(serde_json::from_str(&body)?)
        } else if status.as_u16() == 401 {
            Err(ClientError::AuthFailed)
        } else if status.as_u16() == 404 {
            Err(ClientError::NotFound(path.to_string()))
        } else if status.as_u16() == 409 {
            let message = response.text().await.unwrap_or_default();
            Err(ClientError::Conflict(message))
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(ClientError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}
