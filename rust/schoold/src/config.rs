use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use rusqlite::Connection;
use tracing::warn;

use crate::api::AppState;
use crate::auth::{TokenKeys, DEFAULT_PBKDF2_ROUNDS, MAX_TOKEN_TTL_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Command line and environment configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "schoold", version, about = "School management API server")]
pub struct Config {
    /// Address the HTTP server listens on.
    #[arg(long, env = "SCHOOLD_BIND", default_value = "127.0.0.1:5000")]
    pub bind: SocketAddr,

    /// SQLite database file; created on first start.
    #[arg(long, env = "SCHOOLD_DB", default_value = "schoold.sqlite3")]
    pub db: PathBuf,

    /// HS256 signing secret, at least 16 bytes. A random one is used when unset.
    #[arg(long, env = "SCHOOLD_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Bearer token lifetime, from one minute up to one year.
    #[arg(
        long,
        env = "SCHOOLD_TOKEN_TTL_SECS",
        default_value_t = 86_400,
        value_parser = clap::value_parser!(i64).range(60..=MAX_TOKEN_TTL_SECS)
    )]
    pub token_ttl_secs: i64,

    /// Domain used to derive an email from a bare username when matching
    /// family records.
    #[arg(long, env = "SCHOOLD_EMAIL_DOMAIN", default_value = "school.local")]
    pub email_domain: String,

    /// Global request budget; 0 disables rate limiting.
    #[arg(long, env = "SCHOOLD_RATE_LIMIT_PER_MINUTE", default_value_t = 300)]
    pub rate_limit_per_minute: u32,

    /// Allowed CORS origin; repeat or comma-separate. Any origin when empty.
    #[arg(long = "cors-origin", env = "SCHOOLD_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// PBKDF2 iterations for newly stored password hashes.
    #[arg(
        long,
        env = "SCHOOLD_PASSWORD_ROUNDS",
        default_value_t = DEFAULT_PBKDF2_ROUNDS,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub password_rounds: u32,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn token_keys(&self) -> anyhow::Result<TokenKeys> {
        match self.jwt_secret.as_deref() {
            Some(secret) => TokenKeys::new(secret.as_bytes().to_vec(), self.token_ttl_secs)
                .context("invalid --jwt-secret"),
            None => {
                warn!("no JWT secret configured; tokens will not survive a restart");
                TokenKeys::ephemeral(self.token_ttl_secs).context("invalid --token-ttl-secs")
            }
        }
    }

    pub fn app_state(&self, db: Connection) -> anyhow::Result<AppState> {
        Ok(AppState {
            db,
            keys: self.token_keys()?,
            email_domain: self.email_domain.trim().to_ascii_lowercase(),
            password_rounds: self.password_rounds,
        })
    }
}
