//! Request/response bodies for the `generateContent` family of endpoints.

use serde::{Deserialize, Serialize};

use crate::llm_client::{ChatMessage, GenerationConfig, LlmError, Role, TokenUsage};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: &'a GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: Role,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

impl<'a> GenerateRequest<'a> {
    pub(crate) fn new(messages: &'a [ChatMessage], config: &'a GenerationConfig) -> Self {
        Self {
            contents: messages
                .iter()
                .map(|m| Content {
                    role: m.role,
                    parts: vec![Part { text: &m.text }],
                })
                .collect(),
            generation_config: config,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl GenerateResponse {
    /// Text of the first part of the first candidate, if any.
    pub(crate) fn first_text(&self) -> Option<&str> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .first()?
            .text
            .as_deref()
    }

    pub(crate) fn usage(&self) -> Option<TokenUsage> {
        self.usage_metadata.as_ref().map(|u| TokenUsage {
            tokens_in: u.prompt_token_count,
            tokens_out: u.candidates_token_count,
        })
    }

    /// Like `first_text`, but reports why nothing came back (safety filter,
    /// quota, no candidates) as a terminal error.
    pub(crate) fn require_text(&self) -> Result<String, LlmError> {
        if let Some(text) = self.first_text() {
            return Ok(text.to_string());
        }
        let reason = self
            .candidates
            .first()
            .map(|c| c.finish_reason.clone().unwrap_or_else(|| "UNKNOWN".to_string()))
            .unwrap_or_else(|| "NO_CANDIDATES".to_string());
        Err(LlmError::EmptyContent { reason })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorEnvelope {
    pub(crate) error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub(crate) message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_camel_case_config() {
        let messages = vec![ChatMessage::user("hi"), ChatMessage::model("hello")];
        let config = GenerationConfig::classification();
        let value = serde_json::to_value(GenerateRequest::new(&messages, &config)).unwrap();

        assert_eq!(value["contents"][0]["role"], "user");
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(value["contents"][1]["parts"][0]["text"], "hello");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(value["generationConfig"]["responseMimeType"], "application/json");
    }

    #[test]
    fn test_chat_config_omits_mime_type() {
        let messages = vec![ChatMessage::user("hi")];
        let config = GenerationConfig::chat();
        let value = serde_json::to_value(GenerateRequest::new(&messages, &config)).unwrap();
        assert!(value["generationConfig"].get("responseMimeType").is_none());
        assert_eq!(value["generationConfig"]["topP"].as_f64().unwrap() as f32, 0.95);
    }

    #[test]
    fn test_response_text_and_usage() {
        let json = r#"{
            "candidates": [{"content": {"parts": [{"text": "Hello"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3}
        }"#;
        let response: GenerateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.first_text(), Some("Hello"));
        assert_eq!(
            response.usage(),
            Some(TokenUsage {
                tokens_in: 12,
                tokens_out: 3
            })
        );
    }

    #[test]
    fn test_safety_block_reports_finish_reason() {
        let json = r#"{"candidates": [{"finishReason": "SAFETY"}]}"#;
        let response: GenerateResponse = serde_json::from_str(json).unwrap();
        match response.require_text() {
            Err(LlmError::EmptyContent { reason }) => assert_eq!(reason, "SAFETY"),
            other => panic!("expected EmptyContent, got {other:?}"),
        }
    }

    #[test]
    fn test_no_candidates_reports_reason() {
        let response: GenerateResponse = serde_json::from_str("{}").unwrap();
        match response.require_text() {
            Err(LlmError::EmptyContent { reason }) => assert_eq!(reason, "NO_CANDIDATES"),
            other => panic!("expected EmptyContent, got {other:?}"),
        }
    }
}
