// Session Keeper - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;

pub use error::{ErrorKind, SessionError, TaggedError};
