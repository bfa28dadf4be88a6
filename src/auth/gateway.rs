// Remote authentication endpoints
// Stateless request/response; callers own credential persistence

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::types::{
    redact, AuthResponse, LoginRequest, MeResponse, RefreshResponse, RefreshTokenRequest,
    RegisterRequest, Session, TokenGrant, User,
};
use crate::error::{Result, SessionError};

/// Remote authentication capabilities
#[async_trait]
pub trait AuthGateway: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<Session>;

    async fn register(&self, email: &str, password: &str, display_name: &str) -> Result<Session>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;

    /// Invalidate the refresh token server-side. Best-effort.
    async fn logout(&self, refresh_token: &str) -> Result<()>;

    async fn current_user(&self, access_token: &str) -> Result<User>;
}

/// Which endpoint a response came from; drives status classification
#[derive(Debug, Clone, Copy, PartialEq)]
enum Endpoint {
    Login,
    Register,
    Refresh,
    Logout,
    Me,
}

/// [`AuthGateway`] over HTTP
#[derive(Clone)]
pub struct HttpAuthGateway {
    client: Client,
    base_url: String,
}

impl HttpAuthGateway {
    pub fn new(base_url: &str, connect_timeout: u64, request_timeout: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, base_url))
    }

    /// Share an existing client (and its connection pool)
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn parse<T: DeserializeOwned>(endpoint: Endpoint, response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(endpoint, status, &body));
        }

        response.json::<T>().await.map_err(|e| {
            SessionError::NetworkError(format!("Invalid {:?} response body: {}", endpoint, e))
        })
    }
}

#[async_trait]
impl AuthGateway for HttpAuthGateway {
    async fn login(&self, email: &str, password: &str) -> Result<Session> {
        tracing::debug!(email = %email, "Sending login request");

        let response = self
            .client
            .post(self.url("/auth/login"))
            .json(&LoginRequest { email, password })
            .send()
            .await?;

        let data: AuthResponse = Self::parse(Endpoint::Login, response).await?;
        tracing::info!(user_id = %data.user.id, "Login accepted");

        Ok(Session {
            access_token: data.token,
            refresh_token: data.refresh_token,
            user: data.user,
        })
    }

    async fn register(&self, email: &str, password: &str, display_name: &str) -> Result<Session> {
        tracing::debug!(email = %email, "Sending registration request");

        let response = self
            .client
            .post(self.url("/auth/register"))
            .json(&RegisterRequest {
                email,
                password,
                full_name: display_name,
            })
            .send()
            .await?;

        let data: AuthResponse = Self::parse(Endpoint::Register, response).await?;
        tracing::info!(user_id = %data.user.id, "Registration accepted");

        Ok(Session {
            access_token: data.token,
            refresh_token: data.refresh_token,
            user: data.user,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        tracing::debug!(refresh_token = %redact(refresh_token), "Sending refresh request");

        let response = self
            .client
            .post(self.url("/auth/refresh-token"))
            .json(&RefreshTokenRequest { refresh_token })
            .send()
            .await?;

        let data: RefreshResponse = Self::parse(Endpoint::Refresh, response).await?;
        if data.token.is_empty() {
            return Err(SessionError::RefreshTokenInvalid(
                "Refresh response does not contain a token".to_string(),
            ));
        }

        Ok(TokenGrant {
            access_token: data.token,
            refresh_token: data.refresh_token.filter(|t| !t.is_empty()),
        })
    }

    async fn logout(&self, refresh_token: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url("/auth/logout"))
            .json(&RefreshTokenRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(Endpoint::Logout, status, &body));
        }
        Ok(())
    }

    async fn current_user(&self, access_token: &str) -> Result<User> {
        let response = self
            .client
            .get(self.url("/auth/me"))
            .bearer_auth(access_token)
            .send()
            .await?;

        let data: MeResponse = Self::parse(Endpoint::Me, response).await?;
        Ok(data.user)
    }
}

/// Map a non-success response to the session error taxonomy
fn classify(endpoint: Endpoint, status: StatusCode, body: &str) -> SessionError {
    let message = error_message(status, body);

    match (endpoint, status.as_u16()) {
        (_, 429) | (_, 500..=599) => SessionError::NetworkError(format!("{} - {}", status, message)),

        (Endpoint::Login, 400 | 401 | 403 | 404) => SessionError::InvalidCredentials(message),
        (Endpoint::Login, 422) => SessionError::ValidationError(message),

        (Endpoint::Register, 409) => SessionError::EmailTaken(message),
        (Endpoint::Register, 400) if mentions_existing_email(&message) => {
            SessionError::EmailTaken(message)
        }
        (Endpoint::Register, 400 | 422) => SessionError::ValidationError(message),

        (Endpoint::Refresh, 400 | 401 | 403 | 404) => SessionError::RefreshTokenInvalid(message),

        (Endpoint::Me, 401) => SessionError::Unauthorized(message),

        (_, status) => SessionError::Api { status, message },
    }
}

/// Pull a human-readable message out of an error body
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let field = ["message", "error", "detail"]
            .iter()
            .find_map(|key| json.get(*key).and_then(|v| v.as_str()));
        if let Some(msg) = field {
            return SessionError::truncate_message(msg);
        }
    }

    if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string()
    } else {
        SessionError::truncate_message(body.trim())
    }
}

fn mentions_existing_email(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("email") && ["exist", "taken", "already", "in use"].iter().any(|w| lower.contains(w))
}
