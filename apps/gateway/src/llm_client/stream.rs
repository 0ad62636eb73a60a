//! Server-sent-event parsing for `streamGenerateContent?alt=sse`.
//!
//! Usage metadata may ride on any chunk, so every chunk is inspected for it.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::warn;

use crate::llm_client::prompts::STREAM_APOLOGY;
use crate::llm_client::wire::GenerateResponse;
use crate::llm_client::StreamPart;

/// Turns the raw response body into text and usage parts, in arrival order.
///
/// A transport error mid-body ends the stream with one apology chunk.
pub(crate) fn parse_sse_stream<S>(byte_stream: S) -> impl Stream<Item = StreamPart> + Send + 'static
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    async_stream::stream! {
        let mut byte_stream = Box::pin(byte_stream);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(error = %e, "Upstream stream failed mid-response");
                    yield StreamPart::Text(STREAM_APOLOGY.to_string());
                    return;
                }
            };

            buffer.extend_from_slice(&chunk);
            // Split on raw bytes so multi-byte characters spanning chunks survive.
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                for part in parse_line(&String::from_utf8_lossy(&line)) {
                    yield part;
                }
            }
        }

        if !buffer.is_empty() {
            for part in parse_line(&String::from_utf8_lossy(&buffer)) {
                yield part;
            }
        }
    }
}

fn parse_line(line: &str) -> Vec<StreamPart> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Vec::new();
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Vec::new();
    }

    let response: GenerateResponse = match serde_json::from_str(data) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Skipping undecodable stream chunk");
            return Vec::new();
        }
    };

    let mut parts = Vec::with_capacity(2);
    if let Some(usage) = response.usage() {
        parts.push(StreamPart::Usage(usage));
    }
    if let Some(text) = response.first_text() {
        parts.push(StreamPart::Text(text.to_string()));
    }
    parts
}
