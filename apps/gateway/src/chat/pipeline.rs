//! Classify-then-stream pipeline behind `POST /chat/stream`.
//!
//! Per invocation: `Init -> Classifying -> (OffTopic | Generating) -> Done`.
//! `Done` is yielded exactly once, always last, whatever happened upstream.
//! The completion callback runs only after `Done` has been handed to the
//! consumer, so persistence never delays delivery.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::llm_client::prompts::DEFAULT_DECLINE;
use crate::llm_client::{
    ChatMessage, ChatModel, Classification, GenerationConfig, Intent, StreamPart, TokenUsage,
};
use crate::resilience::timeout::run_with_timeout;

/// Terminal SSE payload.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Chunk(String),
    Done,
}

impl PipelineEvent {
    /// `data: {"chunk": "..."}` or `data: [DONE]`.
    pub fn into_sse(self) -> Event {
        match self {
            PipelineEvent::Chunk(text) => Event::default().data(json!({ "chunk": text }).to_string()),
            PipelineEvent::Done => Event::default().data(DONE_SENTINEL),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Classifying,
    OffTopic,
    Generating,
    Done,
}

/// What the stream delivered, handed to the completion callback.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub intent: Intent,
    pub text: String,
    pub chunks: usize,
    pub usage: Option<TokenUsage>,
    pub latency_ms: u64,
}

pub struct StreamPipeline {
    model: Arc<dyn ChatModel>,
    classify_timeout: Duration,
    state: StreamState,
}

impl StreamPipeline {
    pub fn new(model: Arc<dyn ChatModel>, classify_timeout: Duration) -> Self {
        Self {
            model,
            classify_timeout,
            state: StreamState::Init,
        }
    }

    fn advance(&mut self, next: StreamState) {
        debug!(from = ?self.state, to = ?next, "Stream state change");
        self.state = next;
    }

    /// Consumes the pipeline; a second run is impossible by construction.
    pub fn run<F>(
        self,
        query: String,
        messages: Vec<ChatMessage>,
        on_complete: F,
    ) -> impl Stream<Item = PipelineEvent> + Send + 'static
    where
        F: FnOnce(StreamOutcome) + Send + 'static,
    {
        let mut pipeline = self;
        async_stream::stream! {
            let started = Instant::now();

            pipeline.advance(StreamState::Classifying);
            let model = pipeline.model.clone();
            let classification = run_with_timeout(
                "stream.classify",
                pipeline.classify_timeout,
                Classification::fallback("Classification timed out"),
                async move { Ok::<_, Infallible>(model.classify(&query).await) },
            )
            .await;

            let mut text = String::new();
            let mut chunks = 0usize;
            let mut usage = None;

            if classification.is_off_topic() {
                pipeline.advance(StreamState::OffTopic);
                let decline = classification
                    .decline_message
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DECLINE.to_string());
                text.push_str(&decline);
                chunks += 1;
                yield PipelineEvent::Chunk(decline);
            } else {
                pipeline.advance(StreamState::Generating);
                let mut parts = pipeline
                    .model
                    .generate_stream(&messages, &GenerationConfig::chat())
                    .await;
                while let Some(part) = parts.next().await {
                    match part {
                        StreamPart::Text(fragment) => {
                            text.push_str(&fragment);
                            chunks += 1;
                            yield PipelineEvent::Chunk(fragment);
                        }
                        StreamPart::Usage(u) => usage = Some(u),
                    }
                }
            }

            pipeline.advance(StreamState::Done);
            yield PipelineEvent::Done;

            let latency_ms = started.elapsed().as_millis() as u64;
            info!(intent = ?classification.label, chunks, latency_ms, "Stream complete");
            on_complete(StreamOutcome {
                intent: classification.label,
                text,
                chunks,
                usage,
                latency_ms,
            });
        }
    }
}
