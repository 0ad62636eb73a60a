use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::{header, HeaderName},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::chat::pipeline::{StreamOutcome, StreamPipeline};
use crate::chat::session::{resolve_session, SessionDefaults, SessionRecord, STORE_WRITE_TIMEOUT};
use crate::errors::AppError;
use crate::llm_client::prompts::DEFAULT_DECLINE;
use crate::llm_client::{ChatMessage, Classification, Generation, GenerationConfig, Intent};
use crate::resilience::timeout::{run_with_timeout, spawn_detached};
use crate::routes::admission::ClientId;
use crate::state::AppState;
use crate::store::{EventKind, EventRecord};

pub const MAX_MESSAGE_LENGTH: usize = 4000;
const MAX_NAME_LENGTH: usize = 100;
const CHAT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(15);
const STREAM_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(10);
const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub user_name: String,
    pub company: Option<String>,
    pub job_posting: Option<String>,
    pub turnstile_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub welcome_message: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub query: String,
    pub user_name: Option<String>,
    pub company: Option<String>,
    pub job_posting: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub intent: Intent,
    pub session_id: String,
    pub latency_ms: u64,
}

impl ChatRequest {
    /// Trimmed query, or a validation error.
    fn validated_query(&self) -> Result<&str, AppError> {
        if Uuid::parse_str(&self.session_id).is_err() {
            return Err(AppError::Validation("Invalid session ID format".to_string()));
        }
        let query = self.query.trim();
        if query.is_empty() {
            return Err(AppError::Validation("Query cannot be empty".to_string()));
        }
        if query.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(AppError::Validation(format!(
                "Message too long (max {MAX_MESSAGE_LENGTH} characters)"
            )));
        }
        Ok(query)
    }

    fn defaults(&self) -> SessionDefaults<'_> {
        SessionDefaults {
            user_name: self.user_name.as_deref(),
            company: self.company.as_deref(),
            job_posting: self.job_posting.as_deref(),
        }
    }
}

/// Collapses internal whitespace; `None` when nothing is left.
fn normalize_name(raw: &str) -> Option<String> {
    let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!name.is_empty()).then_some(name)
}

fn welcome_message(user_name: &str, company: Option<&str>, has_job_posting: bool) -> String {
    let from = company.map(|c| format!(" from {c}")).unwrap_or_default();
    if has_job_posting {
        format!(
            "Hi {user_name}{from}! I've reviewed the job description and will highlight the most \
             relevant experience. What would you like to know?"
        )
    } else {
        format!(
            "Hi {user_name}{from}! I'm the candidate's AI assistant. Ask me anything about their \
             skills, experience, or projects!"
        )
    }
}

/// Fire-and-forget analytics write. Skipped in memory-only mode.
fn record_event(state: &AppState, event: EventRecord) {
    if !state.store.is_enabled() {
        return;
    }
    let store = state.store.clone();
    spawn_detached("store.log_event", STORE_WRITE_TIMEOUT, async move {
        store.log_event(&event).await
    });
}

async fn classify_with_deadline(state: &AppState, query: &str, timeout: Duration) -> Classification {
    let llm = state.llm.clone();
    let query = query.to_string();
    run_with_timeout(
        "chat.classify",
        timeout,
        Classification::fallback("Classification timed out"),
        async move { Ok::<_, Infallible>(llm.classify(&query).await) },
    )
    .await
}

/// Whole generation, retries included, under the configured budget.
async fn generate_with_deadline(state: &AppState, messages: Vec<ChatMessage>) -> Generation {
    let llm = state.llm.clone();
    let budget = state.generate_budget;
    run_with_timeout(
        "chat.generate",
        budget,
        Generation::fallback(budget.as_millis() as u64),
        async move { Ok::<_, Infallible>(llm.generate(&messages, &GenerationConfig::chat()).await) },
    )
    .await
}

/// POST /api/v1/session
pub async fn handle_create_session(
    State(state): State<AppState>,
    ClientId(client_ip): ClientId,
    Json(req): Json<SessionRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let user_name = normalize_name(&req.user_name)
        .ok_or_else(|| AppError::Validation("Name cannot be empty".to_string()))?;
    if user_name.chars().count() > MAX_NAME_LENGTH {
        return Err(AppError::Validation(format!(
            "Name too long (max {MAX_NAME_LENGTH} characters)"
        )));
    }
    state
        .captcha
        .verify(req.turnstile_token.as_deref(), &client_ip)
        .await?;

    let company = req.company.as_deref().and_then(normalize_name);
    let job_posting = req
        .job_posting
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    let session_id = Uuid::new_v4().to_string();
    let welcome = welcome_message(&user_name, company.as_deref(), job_posting.is_some());

    state.sessions.put(
        session_id.clone(),
        SessionRecord::new(&session_id, &user_name, company.clone(), job_posting),
    );

    if state.store.is_enabled() {
        let store = state.store.clone();
        let (id, name) = (session_id.clone(), user_name.clone());
        spawn_detached("store.create_session", STORE_WRITE_TIMEOUT, async move {
            store.create_session(&id, &name, company.as_deref()).await
        });
    }
    record_event(&state, EventRecord::new(&session_id, EventKind::SessionStart));

    info!(session_id = %session_id, "Session started");
    Ok(Json(SessionResponse {
        session_id,
        welcome_message: welcome,
    }))
}

/// POST /api/v1/chat
pub async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let started = Instant::now();
    let query = req.validated_query()?;

    let session = resolve_session(&state.store, &state.sessions, &req.session_id, req.defaults()).await;
    let classification = classify_with_deadline(&state, query, CHAT_CLASSIFY_TIMEOUT).await;

    let mut event = EventRecord::new(&req.session_id, EventKind::Chat);
    event.intent = Some(classification.label.as_str().to_string());

    if classification.is_off_topic() {
        let latency_ms = started.elapsed().as_millis() as u64;
        event.latency_ms = Some(latency_ms as i64);
        record_event(&state, event);

        return Ok(Json(ChatResponse {
            response: classification
                .decline_message
                .unwrap_or_else(|| DEFAULT_DECLINE.to_string()),
            intent: Intent::OffTopic,
            session_id: req.session_id,
            latency_ms,
        }));
    }

    let generation = generate_with_deadline(&state, session.build_messages(query)).await;
    if !generation.degraded {
        state
            .sessions
            .update(&req.session_id, |record| record.push_exchange(query, &generation.text));
    }

    let latency_ms = started.elapsed().as_millis() as u64;
    event.tokens_in = Some(generation.tokens_in as i32);
    event.tokens_out = Some(generation.tokens_out as i32);
    event.latency_ms = Some(latency_ms as i64);
    record_event(&state, event);

    Ok(Json(ChatResponse {
        response: generation.text,
        intent: Intent::JobRelated,
        session_id: req.session_id,
        latency_ms,
    }))
}

/// POST /api/v1/chat/stream
///
/// Server-sent events: `data: {"chunk": "..."}` per fragment, then `data: [DONE]`.
pub async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, AppError> {
    let query = req.validated_query()?.to_string();

    let session = resolve_session(&state.store, &state.sessions, &req.session_id, req.defaults()).await;
    let messages = session.build_messages(&query);

    let on_complete = {
        let state = state.clone();
        let query = query.clone();
        let session_id = req.session_id.clone();
        move |outcome: StreamOutcome| {
            if outcome.intent == Intent::JobRelated && outcome.chunks > 0 {
                state
                    .sessions
                    .update(&session_id, |record| record.push_exchange(&query, &outcome.text));
            }

            let mut event = EventRecord::new(session_id, EventKind::ChatStream);
            event.intent = Some(outcome.intent.as_str().to_string());
            if let Some(usage) = outcome.usage {
                event.tokens_in = Some(usage.tokens_in as i32);
                event.tokens_out = Some(usage.tokens_out as i32);
            }
            event.latency_ms = Some(outcome.latency_ms as i64);
            record_event(&state, event);
        }
    };

    let events = StreamPipeline::new(state.llm.clone(), STREAM_CLASSIFY_TIMEOUT)
        .run(query, messages, on_complete)
        .map(|event| Ok::<_, Infallible>(event.into_sse()));

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    ))
}
