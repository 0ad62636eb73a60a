/// LLM client: the single point of entry for all provider calls in the gateway.
///
/// Handlers reach the provider only through the `ChatModel` trait, which
/// `LlmClient` implements. Every call degrades to a safe value instead of
/// returning an error: classification defaults to job-related, generation
/// and streaming fall back to an apology.
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::auth::token_provider::TokenProvider;
use crate::resilience::retry::RetryPolicy;

pub mod prompts;
mod stream;
mod wire;

use prompts::{CLASSIFIER_SYSTEM, GENERATION_APOLOGY, STREAM_APOLOGY};
use wire::{ApiErrorEnvelope, GenerateRequest, GenerateResponse};

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const AI_STUDIO_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("LLM returned no content (reason: {reason})")]
    EmptyContent { reason: String },

    #[error("No upstream credentials available")]
    Auth,
}

impl LlmError {
    /// Transport-level failures only. Well-formed provider errors, empty or
    /// filtered responses, and auth failures are terminal for the call.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Public types
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
}

impl GenerationConfig {
    /// Conversational replies.
    pub fn chat() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            max_output_tokens: 1024,
            response_mime_type: None,
        }
    }

    /// Low-temperature JSON output for the intent classifier.
    pub fn classification() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.95,
            max_output_tokens: 256,
            response_mime_type: Some("application/json".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: u32,
    pub tokens_out: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub latency_ms: u64,
    /// True when `text` is the fallback apology rather than model output.
    pub degraded: bool,
}

impl Generation {
    /// The apology reply, marked degraded.
    pub fn fallback(latency_ms: u64) -> Self {
        Self {
            text: GENERATION_APOLOGY.to_string(),
            tokens_in: 0,
            tokens_out: 0,
            latency_ms,
            degraded: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum Intent {
    #[default]
    JobRelated,
    OffTopic,
}

/// Anything other than `off_topic`, including labels the classifier
/// invents, is job-related.
impl From<String> for Intent {
    fn from(label: String) -> Self {
        if label.trim().eq_ignore_ascii_case("off_topic") {
            Intent::OffTopic
        } else {
            Intent::JobRelated
        }
    }
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::JobRelated => "job_related",
            Intent::OffTopic => "off_topic",
        }
    }
}

fn default_confidence() -> f32 {
    0.8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "intent", default)]
    pub label: Intent,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub decline_message: Option<String>,
}

impl Classification {
    /// Safe default: an on-topic query wrongly declined is worse than an
    /// off-topic one answered.
    pub fn fallback(reasoning: impl Into<String>) -> Self {
        Self {
            label: Intent::JobRelated,
            confidence: 0.5,
            reasoning: reasoning.into(),
            decline_message: None,
        }
    }

    pub fn is_off_topic(&self) -> bool {
        self.label == Intent::OffTopic
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPart {
    Text(String),
    Usage(TokenUsage),
}

/// Lazy, finite, single-use sequence of stream parts.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamPart> + Send>>;

/// The provider as the request layer sees it. None of these fail: degraded
/// paths return fallback content.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn classify(&self, text: &str) -> Classification;

    async fn generate(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Generation;

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> ChunkStream;
}

// ──────────────────────────────────────────────────────────────────────────────
// Client
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMode {
    /// Regional endpoint, bearer token.
    Vertex,
    /// Public endpoint, static API key.
    AiStudio,
}

impl ApiMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiMode::Vertex => "vertex_ai",
            ApiMode::AiStudio => "ai_studio",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub model: String,
    pub project_id: Option<String>,
    pub location: String,
    /// Replaces the derived model URL (everything before `:generateContent`).
    pub base_url: Option<String>,
    pub classify_timeout: Duration,
    pub generate_timeout: Duration,
    pub stream_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            project_id: None,
            location: "us-central1".to_string(),
            base_url: None,
            classify_timeout: Duration::from_secs(10),
            generate_timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    auth: Arc<TokenProvider>,
    mode: ApiMode,
    model_url: String,
    settings: UpstreamSettings,
}

impl LlmClient {
    /// Mode follows the token provider and does not change afterwards.
    pub fn new(http: Client, auth: Arc<TokenProvider>, settings: UpstreamSettings) -> Self {
        let mode = if auth.is_dynamic() {
            ApiMode::Vertex
        } else {
            ApiMode::AiStudio
        };

        let model_url = settings.base_url.clone().unwrap_or_else(|| match mode {
            ApiMode::Vertex => format!(
                "https://{loc}-aiplatform.googleapis.com/v1/projects/{project}/locations/{loc}/publishers/google/models/{model}",
                loc = settings.location,
                project = settings.project_id.as_deref().unwrap_or_default(),
                model = settings.model,
            ),
            ApiMode::AiStudio => format!("{AI_STUDIO_BASE}/{}", settings.model),
        });

        info!(mode = mode.as_str(), model = %settings.model, "LLM client initialized");

        Self {
            http,
            auth,
            mode,
            model_url,
            settings,
        }
    }

    pub fn mode(&self) -> ApiMode {
        self.mode
    }

    fn generate_url(&self) -> String {
        format!("{}:generateContent", self.model_url)
    }

    fn stream_url(&self) -> String {
        format!("{}:streamGenerateContent?alt=sse", self.model_url)
    }

    /// One attempt at a non-streaming call.
    async fn call(
        &self,
        request: &GenerateRequest<'_>,
        timeout: Duration,
    ) -> Result<GenerateResponse, LlmError> {
        let headers = self.auth.headers().await;
        if headers.is_empty() {
            return Err(LlmError::Auth);
        }

        let response = self
            .http
            .post(self.generate_url())
            .headers(headers)
            .timeout(timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorEnvelope>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }

    /// Labels `text` as job-related or off-topic. Never fails.
    pub async fn classify(&self, text: &str) -> Classification {
        let prompt = format!("{CLASSIFIER_SYSTEM}\n\nMessage: {text}");
        let messages = [ChatMessage::user(prompt)];
        let config = GenerationConfig::classification();
        let request = GenerateRequest::new(&messages, &config);

        let result = self
            .settings
            .retry
            .run(
                "llm.classify",
                || self.call(&request, self.settings.classify_timeout),
                LlmError::is_transient,
            )
            .await
            .and_then(|response| response.require_text())
            .and_then(|raw| {
                serde_json::from_str::<Classification>(strip_json_fences(&raw))
                    .map_err(LlmError::from)
            });

        match result {
            Ok(classification) => {
                debug!(
                    intent = ?classification.label,
                    confidence = classification.confidence,
                    "Query classified"
                );
                classification
            }
            Err(e) => {
                warn!(error = %e, "Classification failed, defaulting to job-related");
                Classification::fallback(if e.is_transient() {
                    "Classification timed out"
                } else {
                    "Classification failed"
                })
            }
        }
    }

    /// Single-shot generation with retry on transport failures.
    pub async fn generate(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Generation {
        let started = Instant::now();
        let request = GenerateRequest::new(messages, config);

        let result = self
            .settings
            .retry
            .run(
                "llm.generate",
                || self.call(&request, self.settings.generate_timeout),
                LlmError::is_transient,
            )
            .await
            .and_then(|response| {
                let text = response.require_text()?;
                Ok((text, response.usage().unwrap_or_default()))
            });

        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok((text, usage)) => {
                info!(
                    latency_ms,
                    tokens_in = usage.tokens_in,
                    tokens_out = usage.tokens_out,
                    "Generation complete"
                );
                Generation {
                    text,
                    tokens_in: usage.tokens_in,
                    tokens_out: usage.tokens_out,
                    latency_ms,
                    degraded: false,
                }
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, latency_ms, "Generation retries exhausted, returning fallback");
                Generation::fallback(latency_ms)
            }
            Err(e) => {
                error!(error = %e, latency_ms, "Generation failed, returning fallback");
                Generation::fallback(latency_ms)
            }
        }
    }

    /// Opens a streaming generation. Not retried: a half-consumed stream
    /// cannot be replayed. Failure to open yields a one-chunk apology.
    pub async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> ChunkStream {
        let headers = self.auth.headers().await;
        if headers.is_empty() {
            error!("Stream aborted: no upstream credentials");
            return apology_stream();
        }

        let response = self
            .http
            .post(self.stream_url())
            .headers(headers)
            .timeout(self.settings.stream_timeout)
            .json(&GenerateRequest::new(messages, config))
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                Box::pin(stream::parse_sse_stream(response.bytes_stream()))
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(%status, body = %body, "Stream request rejected");
                apology_stream()
            }
            Err(e) => {
                warn!(error = %e, "Stream request failed");
                apology_stream()
            }
        }
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn classify(&self, text: &str) -> Classification {
        LlmClient::classify(self, text).await
    }

    async fn generate(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Generation {
        LlmClient::generate(self, messages, config).await
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> ChunkStream {
        LlmClient::generate_stream(self, messages, config).await
    }
}

fn apology_stream() -> ChunkStream {
    Box::pin(futures::stream::once(async {
        StreamPart::Text(STREAM_APOLOGY.to_string())
    }))
}

/// Canned `ChatModel` for handler and router tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    /// Serves one chunked SSE response carrying a single text event, then
    /// closes the socket without the terminating chunk. Returns the base URL.
    pub(crate) async fn truncated_sse_upstream(text: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let event = format!(
            "data: {{\"candidates\": [{{\"content\": {{\"parts\": [{{\"text\": {}}}]}}}}]}}\r\n\r\n",
            serde_json::to_string(text).unwrap()
        );

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
                event.len(),
                event
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            // Dropped here: the body ends mid-stream.
        });

        format!("http://{addr}/v1beta/models/test-model")
    }

    /// Consumes headers and a Content-Length body so the close is a clean FIN.
    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let body_len = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                return;
            }
        }
    }

    pub(crate) struct ScriptedModel {
        pub classification: Classification,
        pub reply: String,
        pub chunks: Vec<String>,
        pub generate_calls: AtomicU32,
    }

    impl ScriptedModel {
        pub(crate) fn answering(reply: &str, chunks: &[&str]) -> Self {
            Self {
                classification: Classification {
                    label: Intent::JobRelated,
                    confidence: 0.9,
                    reasoning: "about the candidate".to_string(),
                    decline_message: None,
                },
                reply: reply.to_string(),
                chunks: chunks.iter().map(|c| c.to_string()).collect(),
                generate_calls: AtomicU32::new(0),
            }
        }

        pub(crate) fn declining(decline: &str) -> Self {
            Self {
                classification: Classification {
                    label: Intent::OffTopic,
                    confidence: 0.95,
                    reasoning: "unrelated".to_string(),
                    decline_message: Some(decline.to_string()),
                },
                ..Self::answering("unused", &[])
            }
        }

        pub(crate) fn generate_calls(&self) -> u32 {
            self.generate_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn classify(&self, _text: &str) -> Classification {
            self.classification.clone()
        }

        async fn generate(&self, _messages: &[ChatMessage], _config: &GenerationConfig) -> Generation {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            Generation {
                text: self.reply.clone(),
                tokens_in: 12,
                tokens_out: 5,
                latency_ms: 3,
                degraded: false,
            }
        }

        async fn generate_stream(
            &self,
            _messages: &[ChatMessage],
            _config: &GenerationConfig,
        ) -> ChunkStream {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            let parts: Vec<StreamPart> = self
                .chunks
                .iter()
                .map(|c| StreamPart::Text(c.clone()))
                .collect();
            Box::pin(futures::stream::iter(parts))
        }
    }
}

/// Strips ```json ... ``` or ``` ... ``` code fences from LLM output.
fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else {
        text
    }
}
