use anyhow::Context;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::RefreshCoordinator;
use crate::error::{Result, SessionError};

/// Authenticated HTTP client for application API calls.
///
/// Every attempt attaches the latest access token from the credential store.
/// A 401 is handed to the [`RefreshCoordinator`]; 429 and 5xx are retried
/// with exponential backoff; transport failures are returned as-is.
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    coordinator: Arc<RefreshCoordinator>,

    base_url: String,

    /// Maximum number of retries for 429/5xx responses
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

/// Everything needed to repeat one request with a different token
#[derive(Clone)]
struct PreparedRequest {
    client: Client,
    method: Method,
    url: String,
    body: Option<Value>,
    max_retries: u32,
    base_delay_ms: u64,
}

impl ApiClient {
    pub fn new(
        coordinator: Arc<RefreshCoordinator>,
        base_url: &str,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, coordinator, base_url, max_retries))
    }

    pub fn with_client(
        client: Client,
        coordinator: Arc<RefreshCoordinator>,
        base_url: &str,
        max_retries: u32,
    ) -> Self {
        Self {
            client,
            coordinator,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
            base_delay_ms: 1000, // 1 second base delay
        }
    }

    /// Override the backoff base delay
    pub fn with_base_delay(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request_json(Method::GET, path, None).await
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let response = self.send(method, path, body).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SessionError::NetworkError(format!("Invalid response body: {}", e)))
    }

    /// Send a request whose response body is not needed
    pub async fn request_empty(&self, method: Method, path: &str, body: Option<Value>) -> Result<()> {
        self.send(method, path, body).await.map(|_| ())
    }

    /// Send through the refresh coordinator, returning a successful response
    pub async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Response> {
        let request = PreparedRequest {
            client: self.client.clone(),
            method,
            url: format!("{}{}", self.base_url, path),
            body,
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        };

        tracing::debug!(method = %request.method, url = %request.url, "Sending HTTP request");

        self.coordinator
            .execute(move |access_token| {
                let request = request.clone();
                async move { request.send(&access_token).await }
            })
            .await
    }
}

impl PreparedRequest {
    async fn send(&self, access_token: &str) -> Result<Response> {
        let mut attempt = 0;

        loop {
            let mut builder = self
                .client
                .request(self.method.clone(), &self.url)
                .bearer_auth(access_token);
            if let Some(ref body) = self.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                tracing::warn!(url = %self.url, error = %e, "HTTP request error");
                SessionError::from(e)
            })?;

            let status = response.status();
            if status.is_success() {
                tracing::debug!(status = %status, "Request successful");
                return Ok(response);
            }

            match status.as_u16() {
                401 => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(SessionError::Unauthorized(SessionError::truncate_message(
                        if body.is_empty() { "401 Unauthorized" } else { body.as_str() },
                    )));
                }

                // 429 or 5xx: Exponential backoff
                429 | 500..=599 if attempt < self.max_retries => {
                    let delay = backoff_delay(self.base_delay_ms, attempt);
                    tracing::warn!(
                        "Received {}, retrying after {}ms (attempt {}/{})",
                        status,
                        delay.as_millis(),
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }

                _ => {
                    let error_text = response.text().await.unwrap_or_default();
                    tracing::error!(
                        status = status.as_u16(),
                        url = %self.url,
                        response_body = %error_text,
                        attempt = attempt + 1,
                        "HTTP request failed with error response"
                    );
                    return Err(SessionError::Api {
                        status: status.as_u16(),
                        message: SessionError::truncate_message(&error_text),
                    });
                }
            }
        }
    }
}

/// Exponential backoff: base_delay * 2^attempt, plus up to 10% jitter to
/// avoid a thundering herd
pub(crate) fn backoff_delay(base_delay_ms: u64, attempt: u32) -> Duration {
    let delay = base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let jitter = (delay as f64 * 0.1 * rand::random::<f64>()) as u64;
    Duration::from_millis(delay.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let delay0 = backoff_delay(1000, 0).as_millis();
        let delay1 = backoff_delay(1000, 1).as_millis();
        let delay2 = backoff_delay(1000, 2).as_millis();

        // Each delay should be roughly double the previous (with jitter)
        assert!((1000..=1100).contains(&delay0));
        assert!((2000..=2200).contains(&delay1));
        assert!((4000..=4400).contains(&delay2));
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let delay = backoff_delay(u64::MAX / 2, 40);
        assert!(delay.as_millis() > 0);
    }
}
