// Error handling module
// Defines the session error taxonomy and its tagged, caller-facing form

use serde::Serialize;
use thiserror::Error;

/// Maximum length for server-supplied messages carried in errors
const MAX_MESSAGE_LENGTH: usize = 300;

/// Errors surfaced by the session layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Login rejected by the server
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Registration conflict
    #[error("Email already registered: {0}")]
    EmailTaken(String),

    /// Registration payload rejected
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Refresh token rejected by the server
    #[error("Refresh token rejected: {0}")]
    RefreshTokenInvalid(String),

    /// Session could not be recovered; a fresh login is required
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// A request was rejected with an authorization failure
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Transport failure or transient server error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The credential store cannot be read or written
    #[error("Credential storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Another login/register/logout is running on the same context
    #[error("Another authentication operation is already in progress")]
    OperationInProgress,

    /// Unexpected response from the API
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
}

/// Discriminant of a [`SessionError`], as exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InvalidCredentials,
    EmailTaken,
    ValidationError,
    RefreshTokenInvalid,
    SessionExpired,
    Unauthorized,
    NetworkError,
    StorageUnavailable,
    OperationInProgress,
    Api,
}

/// Tagged error result: `{ kind, message }`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaggedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidCredentials(_) => ErrorKind::InvalidCredentials,
            SessionError::EmailTaken(_) => ErrorKind::EmailTaken,
            SessionError::ValidationError(_) => ErrorKind::ValidationError,
            SessionError::RefreshTokenInvalid(_) => ErrorKind::RefreshTokenInvalid,
            SessionError::SessionExpired(_) => ErrorKind::SessionExpired,
            SessionError::Unauthorized(_) => ErrorKind::Unauthorized,
            SessionError::NetworkError(_) => ErrorKind::NetworkError,
            SessionError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            SessionError::OperationInProgress => ErrorKind::OperationInProgress,
            SessionError::Api { .. } => ErrorKind::Api,
        }
    }

    /// Convert into the `{ kind, message }` form handed to callers
    pub fn to_tagged(&self) -> TaggedError {
        TaggedError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// True for failures that should send the caller back to the login screen
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            SessionError::SessionExpired(_)
                | SessionError::RefreshTokenInvalid(_)
                | SessionError::Unauthorized(_)
        )
    }

    /// Truncate a response body to avoid carrying excessive data in errors
    pub(crate) fn truncate_message(body: &str) -> String {
        if body.len() <= MAX_MESSAGE_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_MESSAGE_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connection_failed"
        } else if err.is_decode() {
            "decode_error"
        } else if err.is_body() {
            "body_error"
        } else {
            "request_error"
        };
        SessionError::NetworkError(format!("{} (kind: {})", err, kind))
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(err: rusqlite::Error) -> Self {
        SessionError::StorageUnavailable(err.to_string())
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
