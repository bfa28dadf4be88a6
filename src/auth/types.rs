// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// Identity of the authenticated user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(alias = "_id", deserialize_with = "string_or_number")]
    pub id: String,
    pub email: String,
    #[serde(alias = "fullName", alias = "name", default)]
    pub display_name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Authoritative authentication state produced by login/register
#[derive(Clone, PartialEq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub user: User,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("user", &self.user)
            .finish()
    }
}

/// Access/refresh pair as persisted by a credential store
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

/// Token data from a refresh response
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present only when the server rotated the refresh token
    pub refresh_token: Option<String>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .finish()
    }
}

/// Authentication state change, broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    LoggedIn(User),
    LoggedOut,
    TokenRefreshed,
    /// Refresh failed irrecoverably; callers should send the user to login
    SessionExpired,
}

/// Shorten a token for logs and debug output
pub fn redact(token: &str) -> String {
    let visible: String = token.chars().take(8).collect();
    format!("{}...", visible)
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Register request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub full_name: &'a str,
}

/// Refresh and logout request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest<'a> {
    pub refresh_token: &'a str,
}

/// Login/register response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
    pub refresh_token: String,
}

/// Refresh response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub token: String,
    pub refresh_token: Option<String>,
}

/// Current user response
#[derive(Deserialize)]
pub struct MeResponse {
    pub user: User,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_accepts_full_name_and_numeric_id() {
        let user: User = serde_json::from_value(json!({
            "id": 42,
            "email": "guide@test.io",
            "fullName": "Trail Guide",
            "role": "admin",
            "createdAt": "2025-01-12T10:30:00Z"
        }))
        .unwrap();

        assert_eq!(user.id, "42");
        assert_eq!(user.display_name, "Trail Guide");
        assert!(user.is_admin());
        assert!(user.created_at.is_some());
    }

    #[test]
    fn test_user_defaults() {
        let user: User = serde_json::from_value(json!({
            "id": "u-1",
            "email": "visitor@test.io"
        }))
        .unwrap();

        assert_eq!(user.role, Role::User);
        assert_eq!(user.display_name, "");
        assert_eq!(user.created_at, None);
    }

    #[test]
    fn test_user_serializes_camel_case() {
        let user = User {
            id: "u-1".to_string(),
            email: "visitor@test.io".to_string(),
            display_name: "Visitor".to_string(),
            role: Role::User,
            created_at: None,
        };
        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["displayName"], "Visitor");
        assert_eq!(value["role"], "user");
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let pair = TokenPair {
            access_token: "eyJhbGciOiJIUzI1NiJ9.secret-payload".to_string(),
            refresh_token: "refresh-secret-value".to_string(),
        };
        let debug = format!("{:?}", pair);
        assert!(!debug.contains("secret-payload"));
        assert!(!debug.contains("refresh-secret-value"));
        assert!(debug.contains("eyJhbGci..."));
    }

    #[test]
    fn test_register_request_uses_full_name() {
        let body = serde_json::to_value(RegisterRequest {
            email: "a@test.io",
            password: "pw",
            full_name: "A",
        })
        .unwrap();
        assert_eq!(body["fullName"], "A");
    }
}
