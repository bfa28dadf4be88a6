// Authentication module
// Manages the session lifecycle: credential storage, token inspection,
// remote auth calls and single-flight refresh

mod context;
mod coordinator;
mod credentials;
mod gateway;
pub mod token;
mod types;

pub use context::{SessionContext, SessionState};
pub use coordinator::{RefreshCoordinator, RefreshSettings, RefreshState};
pub use credentials::{
    CredentialStore, MemoryCredentialStore, SqliteCredentialStore, StoredTokens,
};
pub use gateway::{AuthGateway, HttpAuthGateway};
pub use types::{redact, AuthEvent, Role, Session, TokenGrant, TokenPair, User};
