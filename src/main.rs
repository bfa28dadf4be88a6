use anyhow::{Context, Result};
use dialoguer::Password;
use std::sync::Arc;

use session_keeper::auth::{redact, HttpAuthGateway, SessionContext, SqliteCredentialStore};
use session_keeper::config::{Command, Config};
use session_keeper::http_client::ApiClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Credential store: {}", config.db_file.display());
    let store = Arc::new(
        SqliteCredentialStore::open(&config.db_file).with_context(|| {
            format!("Failed to open credential store: {}", config.db_file.display())
        })?,
    );

    let gateway = Arc::new(HttpAuthGateway::new(
        &config.api_url,
        config.http_connect_timeout,
        config.http_request_timeout,
    )?);

    let ctx = SessionContext::new(store, gateway, config.refresh_settings());

    run(command, &ctx, &config).await
}

async fn run(command: Command, ctx: &SessionContext, config: &Config) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let password = resolve_password(password, false)?;
            let user = ctx.login(&email, &password).await?;
            println!("Logged in as {} <{}>", user.display_name, user.email);
        }

        Command::Register {
            email,
            name,
            password,
        } => {
            let password = resolve_password(password, true)?;
            let user = ctx.register(&email, &password, &name).await?;
            println!("Registered and logged in as {} <{}>", user.display_name, user.email);
        }

        Command::Logout => {
            ctx.logout().await;
            println!("Logged out");
        }

        Command::Whoami => match ctx.initialize().await? {
            Some(user) => println!("{}", serde_json::to_string_pretty(&user)?),
            None => println!("Not logged in"),
        },

        Command::Status => {
            let tokens = ctx.store().get()?;
            match tokens.access_token() {
                Some(access_token) => {
                    println!("Session:      stored");
                    println!("Access token: {}", redact(access_token));
                    match tokens.access_expires_at() {
                        Some(exp) => println!("Expires at:   {}", exp.to_rfc3339()),
                        None => println!("Expires at:   unknown (token carries no exp claim)"),
                    }
                }
                None => println!("Session:      none"),
            }
            println!("Store:        {}", config.db_file.display());
        }

        Command::Get { path } => {
            if ctx.initialize().await?.is_none() {
                anyhow::bail!("Not logged in");
            }

            let api = ApiClient::new(
                ctx.coordinator().clone(),
                &config.api_url,
                config.http_connect_timeout,
                config.http_request_timeout,
                config.http_max_retries,
            )?;
            let body: serde_json::Value = api.get_json(&path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}

/// Use the supplied password or prompt for one
fn resolve_password(password: Option<String>, confirm: bool) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }

    let mut prompt = Password::new().with_prompt("Password");
    if confirm {
        prompt = prompt.with_confirmation("Confirm password", "Passwords do not match");
    }
    let password = prompt.interact().context("Failed to read password")?;

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    Ok(password)
}
