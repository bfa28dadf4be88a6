// Credential persistence
// Holds the access/refresh pair; no validation, no network I/O

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use super::token;
use super::types::TokenPair;
use crate::error::{Result, SessionError};

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Snapshot of what a store currently holds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredTokens {
    pair: Option<TokenPair>,
}

impl StoredTokens {
    pub fn empty() -> Self {
        Self { pair: None }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.pair.as_ref().map(|p| p.access_token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.pair.as_ref().map(|p| p.refresh_token.as_str())
    }

    /// Expiry derived from the access token's claim
    pub fn access_expires_at(&self) -> Option<DateTime<Utc>> {
        self.access_token().and_then(token::expires_at)
    }

    pub fn is_empty(&self) -> bool {
        self.pair.is_none()
    }

    pub fn into_pair(self) -> Option<TokenPair> {
        self.pair
    }
}

impl From<TokenPair> for StoredTokens {
    fn from(pair: TokenPair) -> Self {
        Self { pair: Some(pair) }
    }
}

/// Durable key/value holder for the current token pair.
///
/// Implementations write the pair atomically: a reader never observes an access
/// token next to a stale or missing refresh token.
pub trait CredentialStore: Send + Sync {
    fn put(&self, access_token: &str, refresh_token: &str) -> Result<()>;
    fn get(&self) -> Result<StoredTokens>;
    fn clear(&self) -> Result<()>;
}

/// Process-local store, lost on exit
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    pair: RwLock<Option<TokenPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(access_token: &str, refresh_token: &str) -> Self {
        Self {
            pair: RwLock::new(Some(TokenPair {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.to_string(),
            })),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn put(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let mut pair = self.pair.write().map_err(poisoned)?;
        *pair = Some(TokenPair {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
        });
        Ok(())
    }

    fn get(&self) -> Result<StoredTokens> {
        let pair = self.pair.read().map_err(poisoned)?;
        Ok(StoredTokens { pair: pair.clone() })
    }

    fn clear(&self) -> Result<()> {
        *self.pair.write().map_err(poisoned)? = None;
        Ok(())
    }
}

/// SQLite-backed store using a single `auth_kv` table
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SessionError::StorageUnavailable(format!(
                        "Failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        tracing::debug!("Opening credential store: {}", path.display());
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn read_key(conn: &Connection, key: &str) -> Result<Option<String>> {
        Ok(conn
            .query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?)
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn put(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let mut conn = self.conn.lock().map_err(poisoned)?;
        let tx = conn.transaction()?;
        for (key, value) in [
            (ACCESS_TOKEN_KEY, access_token),
            (REFRESH_TOKEN_KEY, refresh_token),
        ] {
            tx.execute(
                "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get(&self) -> Result<StoredTokens> {
        let mut conn = self.conn.lock().map_err(poisoned)?;
        let tx = conn.transaction()?;
        let access_token = Self::read_key(&tx, ACCESS_TOKEN_KEY)?;
        let refresh_token = Self::read_key(&tx, REFRESH_TOKEN_KEY)?;
        tx.commit()?;

        match (access_token, refresh_token) {
            (Some(access_token), Some(refresh_token)) => Ok(TokenPair {
                access_token,
                refresh_token,
            }
            .into()),
            (None, None) => Ok(StoredTokens::empty()),
            _ => {
                // Written outside this store; a half pair is unusable
                tracing::warn!("Credential store holds an incomplete token pair, ignoring it");
                Ok(StoredTokens::empty())
            }
        }
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            "DELETE FROM auth_kv WHERE key IN (?1, ?2)",
            params![ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY],
        )?;
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> SessionError {
    SessionError::StorageUnavailable("credential store lock poisoned".to_string())
}
