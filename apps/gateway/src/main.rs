mod auth;
mod chat;
mod config;
mod db;
mod errors;
mod llm_client;
mod resilience;
mod routes;
mod state;
mod store;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::service_account::ServiceAccountCredentials;
use crate::auth::token_provider::TokenProvider;
use crate::auth::turnstile::TurnstileVerifier;
use crate::config::Config;
use crate::db::create_pool;
use crate::llm_client::{LlmClient, UpstreamSettings};
use crate::resilience::rate_limiter::RateLimiter;
use crate::resilience::session_cache::SessionCache;
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::{DisabledStore, PgSessionStore, SessionStore};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting gateway v{}", env!("CARGO_PKG_VERSION"));

    // Upstream credentials and client
    let token_provider = Arc::new(build_token_provider(&config));
    let http = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let llm = LlmClient::new(
        http.clone(),
        token_provider,
        UpstreamSettings {
            project_id: config.google_cloud_project.clone(),
            location: config.google_cloud_location.clone(),
            ..UpstreamSettings::default()
        },
    );
    let upstream_mode = llm.mode().as_str();

    // Durable store, or memory-only
    let store: Arc<dyn SessionStore> = match &config.database_url {
        Some(url) => match create_pool(url).await {
            Ok(pool) => Arc::new(PgSessionStore::new(pool)),
            Err(e) => {
                warn!(error = %e, "Database unavailable, running memory-only");
                Arc::new(DisabledStore)
            }
        },
        None => {
            warn!("DATABASE_URL not set, running memory-only");
            Arc::new(DisabledStore)
        }
    };

    let sessions = Arc::new(SessionCache::new(config.session_ttl, config.session_max_size));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_rpm));
    let captcha = Arc::new(TurnstileVerifier::new(
        http,
        config.turnstile_secret.clone(),
        &config.environment,
    ));

    info!(
        upstream = upstream_mode,
        durable_store = store.is_enabled(),
        rate_limit_rpm = config.rate_limit_rpm,
        captcha = captcha.is_enabled(),
        environment = %config.environment,
        session_ttl_secs = config.session_ttl.as_secs(),
        session_max_size = config.session_max_size,
        "Service status"
    );

    spawn_cache_sweeper(sessions.clone());

    let state = AppState {
        llm: Arc::new(llm),
        store,
        sessions,
        rate_limiter,
        captcha,
        generate_budget: config.generate_budget,
        upstream_mode,
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors(&config));

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

/// Dynamic bearer tokens when a service account and project are configured,
/// the static API key otherwise.
fn build_token_provider(config: &Config) -> TokenProvider {
    let (Some(json), Some(project)) = (
        config.google_credentials_json.as_deref(),
        config.google_cloud_project.as_deref(),
    ) else {
        info!("No service account configured, using static API key");
        return TokenProvider::static_key(config.google_api_key.clone());
    };

    match ServiceAccountCredentials::from_json(json) {
        Ok(credentials) => {
            info!(
                project,
                client_email = credentials.client_email(),
                "Using service account credentials"
            );
            TokenProvider::dynamic(Arc::new(credentials))
        }
        Err(e) => {
            warn!(error = %e, "Invalid service account credentials, falling back to static API key");
            TokenProvider::static_key(config.google_api_key.clone())
        }
    }
}

fn build_cors(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins()
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

fn spawn_cache_sweeper(sessions: Arc<SessionCache<chat::session::SessionRecord>>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = sessions.cleanup();
            info!(removed, remaining = sessions.len(), "Swept expired sessions");
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
