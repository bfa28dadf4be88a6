use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::auth::RefreshSettings;

/// Application name used for the default data directory
const APP_NAME: &str = "session-keeper";

/// Database file name inside the data directory
const DB_FILE: &str = "session.sqlite3";

/// Session Keeper - authenticated API client with transparent token refresh
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the backend API (auth endpoints live under /auth)
    #[arg(short = 'u', long, env = "AUTH_API_URL")]
    pub api_url: Option<String>,

    /// Path to the SQLite credential store
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Seconds before token expiry at which it is refreshed
    #[arg(long, env = "TOKEN_REFRESH_MARGIN", default_value = "60")]
    pub refresh_margin: i64,

    /// Refresh tokens before sending when they are about to expire
    #[arg(long, env = "PROACTIVE_REFRESH", default_value_t = true, action = clap::ArgAction::Set)]
    pub proactive_refresh: bool,

    /// Retries of a refresh call that failed with a network error
    #[arg(long, env = "REFRESH_MAX_RETRIES", default_value = "2")]
    pub refresh_retries: u32,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP max retries for 429/5xx responses
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and persist the session
    Login {
        email: String,

        /// Password (prompted when omitted)
        #[arg(long, env = "SESSION_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Create an account and persist the session
    Register {
        email: String,

        /// Display name
        #[arg(long)]
        name: String,

        /// Password (prompted when omitted)
        #[arg(long, env = "SESSION_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// End the session locally and on the server
    Logout,

    /// Show the authenticated user, restoring the stored session
    Whoami,

    /// Show what the credential store holds
    Status,

    /// GET an API path with the current session and print the JSON response
    Get { path: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_url: String,

    // Credential storage
    pub db_file: PathBuf,

    // Token refresh
    pub token_refresh_margin: i64,
    pub proactive_refresh: bool,
    pub refresh_max_retries: u32,
    pub refresh_retry_base_delay_ms: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<(Self, Command)> {
        let config = Config {
            api_url: args
                .api_url
                .map(|s| s.trim_end_matches('/').to_string())
                .context("AUTH_API_URL is required (use -u or set AUTH_API_URL env var)")?,

            db_file: args
                .db_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_db_path),

            token_refresh_margin: args.refresh_margin,
            proactive_refresh: args.proactive_refresh,
            refresh_max_retries: args.refresh_retries,

            refresh_retry_base_delay_ms: std::env::var("REFRESH_RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(500),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,

            log_level: args.log_level,
        };

        Ok((config, args.command))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            anyhow::bail!(
                "AUTH_API_URL must start with http:// or https://: {}",
                self.api_url
            );
        }

        if self.token_refresh_margin < 0 {
            anyhow::bail!(
                "TOKEN_REFRESH_MARGIN must not be negative: {}",
                self.token_refresh_margin
            );
        }

        Ok(())
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            safety_margin_secs: self.token_refresh_margin,
            proactive_refresh: self.proactive_refresh,
            max_network_retries: self.refresh_max_retries,
            retry_base_delay_ms: self.refresh_retry_base_delay_ms,
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_NAME).join(DB_FILE))
        .unwrap_or_else(|| PathBuf::from(DB_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> (Config, Command) {
        let mut argv = vec!["session-keeper"];
        argv.extend_from_slice(args);
        Config::from_args(CliArgs::try_parse_from(argv).unwrap()).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_cli_values_and_subcommand() {
        let (config, command) = parse(&[
            "-u",
            "https://api.example.com/",
            "-d",
            "/tmp/session.db",
            "--refresh-margin",
            "120",
            "--proactive-refresh",
            "false",
            "login",
            "guide@test.io",
        ]);

        assert_eq!(config.api_url, "https://api.example.com");
        assert_eq!(config.db_file, PathBuf::from("/tmp/session.db"));
        assert_eq!(config.token_refresh_margin, 120);
        assert!(!config.proactive_refresh);
        assert!(matches!(command, Command::Login { ref email, .. } if email == "guide@test.io"));
    }

    #[test]
    fn test_refresh_settings_follow_config() {
        let (config, command) = parse(&["-u", "http://localhost:5000", "--refresh-retries", "5", "whoami"]);
        let settings = config.refresh_settings();

        assert_eq!(command, Command::Whoami);
        assert_eq!(settings.max_network_retries, 5);
        assert_eq!(settings.safety_margin_secs, config.token_refresh_margin);
        assert_eq!(settings.proactive_refresh, config.proactive_refresh);
    }

    #[test]
    fn test_register_requires_name() {
        let result = CliArgs::try_parse_from(["session-keeper", "-u", "http://x", "register", "a@test.io"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let (mut config, _) = parse(&["-u", "http://localhost:5000", "status"]);
        assert!(config.validate().is_ok());

        config.api_url = "localhost:5000".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_margin() {
        let (mut config, _) = parse(&["-u", "http://localhost:5000", "status"]);
        config.token_refresh_margin = -1;
        assert!(config.validate().is_err());
    }
}
