use std::sync::Arc;
use std::time::Duration;

use crate::auth::turnstile::TurnstileVerifier;
use crate::chat::session::SessionRecord;
use crate::llm_client::ChatModel;
use crate::resilience::rate_limiter::RateLimiter;
use crate::resilience::session_cache::SessionCache;
use crate::store::SessionStore;

/// Shared application state injected into all route handlers via Axum extractors.
/// Everything is built once in `main` and shared by reference.
#[derive(Clone)]
pub struct AppState {
    /// Upstream provider. `LlmClient` in production, a fake in router tests.
    pub llm: Arc<dyn ChatModel>,
    /// Durable store, or `DisabledStore` in memory-only mode.
    pub store: Arc<dyn SessionStore>,
    pub sessions: Arc<SessionCache<SessionRecord>>,
    pub rate_limiter: Arc<RateLimiter>,
    /// CAPTCHA check on session creation; a no-op without a secret.
    pub captcha: Arc<TurnstileVerifier>,
    /// Deadline for a whole non-streaming generation.
    pub generate_budget: Duration,
    /// Reported by the health endpoint ("vertex_ai" or "ai_studio").
    pub upstream_mode: &'static str,
}
