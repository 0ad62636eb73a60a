use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
/// Liveness plus a snapshot of each dependency. Never rate limited.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "upstream": state.upstream_mode,
            "durable_store": if state.store.is_enabled() { "connected" } else { "memory_only" },
            "session_cache": state.sessions.stats(),
            "captcha": if state.captcha.is_enabled() { "enabled" } else { "disabled" },
            "rate_limit_rpm": state.rate_limiter.limit(),
            "rate_limited_clients": state.rate_limiter.tracked_clients(),
        }
    }))
}
