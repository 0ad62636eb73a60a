use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_LOCATION: &str = "us-central1";
const DEFAULT_ORIGINS: &[&str] = &["http://localhost:5173", "http://localhost:3000"];

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub google_api_key: String,
    pub google_cloud_project: Option<String>,
    pub google_cloud_location: String,
    pub google_credentials_json: Option<String>,
    pub database_url: Option<String>,
    pub rate_limit_rpm: u32,
    pub session_ttl: Duration,
    pub session_max_size: usize,
    /// Upper bound on one non-streaming generation, retries included.
    pub generate_budget: Duration,
    pub turnstile_secret: Option<String>,
    pub environment: String,
    pub frontend_url: Option<String>,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            google_api_key: require_env("GOOGLE_API_KEY")?,
            google_cloud_project: optional_env("GOOGLE_CLOUD_PROJECT"),
            google_cloud_location: optional_env("GOOGLE_CLOUD_LOCATION")
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            google_credentials_json: optional_env("GOOGLE_APPLICATION_CREDENTIALS_JSON"),
            database_url: optional_env("DATABASE_URL"),
            rate_limit_rpm: parse_env("RATE_LIMIT_RPM", 10)?,
            session_ttl: Duration::from_secs(parse_env("SESSION_TTL_SECS", 86_400)?),
            session_max_size: parse_env("SESSION_MAX_SIZE", 10_000)?,
            generate_budget: Duration::from_secs(parse_env("GENERATE_TIMEOUT_SECS", 45)?),
            turnstile_secret: optional_env("TURNSTILE_SECRET"),
            environment: optional_env("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            frontend_url: optional_env("FRONTEND_URL"),
            port: parse_env("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Origins allowed by CORS: local development plus the configured frontend.
    pub fn allowed_origins(&self) -> Vec<String> {
        let mut origins: Vec<String> = DEFAULT_ORIGINS.iter().map(|s| s.to_string()).collect();
        if let Some(url) = &self.frontend_url {
            let url = url.trim_end_matches('/').to_string();
            if !origins.contains(&url) {
                origins.push(url);
            }
        }
        origins
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

/// Unset and blank are treated alike.
fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        None => Ok(default),
    }
}
