//! Generative backend boundary.
//!
//! A [`Backend`] reports its limits through [`BackendCapabilities`] and
//! turns a [`ChatRequest`] into a stream of [`BackendEvent`]s. The
//! [`OpenAiBackend`] speaks the OpenAI-compatible `/chat/completions`
//! streaming protocol (server-sent events, `data: [DONE]` sentinel).

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};

use crate::assembler::{AssembledRequest, RequestMessage};
use crate::config::Config;
use crate::error::{Error, Result, StreamError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendCapabilities {
    pub max_context_tokens: usize,
    pub max_output_tokens: usize,
    pub tokenizer: String,
}

/// A fragment of one tool call. Fragments for parallel calls interleave and
/// are told apart by `index`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendEvent {
    pub content_delta: Option<String>,
    pub tool_call_deltas: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
    pub done: bool,
    pub error: Option<String>,
}

impl BackendEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content_delta: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}

pub type BackendStream = BoxStream<'static, std::result::Result<BackendEvent, StreamError>>;

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<RequestMessage>,
    pub max_tokens: usize,
}

impl From<&AssembledRequest> for ChatRequest {
    fn from(request: &AssembledRequest) -> Self {
        Self {
            messages: request.messages.clone(),
            max_tokens: request.response_cap,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn capabilities(&self) -> BackendCapabilities;

    /// Start one streaming call. Connection and status failures surface
    /// here; failures mid-stream arrive as stream items.
    async fn stream(&self, request: &ChatRequest)
        -> std::result::Result<BackendStream, StreamError>;
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    capabilities: BackendCapabilities,
}

impl OpenAiBackend {
    pub fn from_config(config: &Config) -> Result<Self> {
        let backend = config.backend.as_ref().ok_or_else(|| {
            Error::Validation("no [backend] section in config".to_string())
        })?;
        let api_key = std::env::var(&backend.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            tracing::warn!(
                env = %backend.api_key_env,
                "backend API key not set; sending unauthenticated requests"
            );
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("context-loom/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Validation(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: backend.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: backend
                .model
                .clone()
                .unwrap_or_else(|| config.model.name.clone()),
            capabilities: BackendCapabilities {
                max_context_tokens: config.model.max_context_tokens,
                max_output_tokens: config.model.max_output_tokens,
                tokenizer: config.model.tokenizer.clone(),
            },
        })
    }

    fn request_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();
        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "stream": true,
        })
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities.clone()
    }

    async fn stream(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<BackendStream, StreamError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(&self.request_body(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| StreamError::Transient {
            message: format!("request failed: {}", e),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), &body));
        }
        tracing::debug!(model = %self.model, "backend stream opened");

        let mut decoder = SseDecoder::default();
        let events = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(StreamError::Transient {
                    message: format!("failed to read stream: {}", e),
                })],
            })
            .flat_map(futures::stream::iter);
        Ok(events.boxed())
    }
}

/// Rate limits and server errors are worth another attempt; other statuses
/// are reported as they are.
pub fn map_status(status: u16, body: &str) -> StreamError {
    let message = if body.trim().is_empty() {
        format!("HTTP {}", status)
    } else {
        body.trim().to_string()
    };
    if status == 429 || status >= 500 {
        StreamError::Transient { message }
    } else {
        StreamError::Backend { status, message }
    }
}

/// Splits a byte stream into SSE lines, tolerating lines and UTF-8
/// sequences cut across network chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<BackendEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_sse_line(&line) {
                events.push(event);
            }
        }
        events
    }
}

/// Parse one SSE line. Comments, blank lines, and non-data fields yield
/// `None`.
pub fn parse_sse_line(line: &str) -> Option<BackendEvent> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(BackendEvent::done());
    }
    let value: Value = serde_json::from_str(data).ok()?;

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Some(BackendEvent {
            error: Some(message),
            ..BackendEvent::default()
        });
    }

    let choice = value.get("choices").and_then(|c| c.get(0))?;
    let mut event = BackendEvent::default();

    if let Some(delta) = choice.get("delta") {
        event.content_delta = delta
            .get("content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        if let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            event.tool_call_deltas = calls
                .iter()
                .map(|tc| {
                    let function = tc.get("function");
                    ToolCallDelta {
                        index: tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize,
                        id: tc.get("id").and_then(|i| i.as_str()).map(str::to_string),
                        name: function
                            .and_then(|f| f.get("name"))
                            .and_then(|n| n.as_str())
                            .map(str::to_string),
                        arguments: function
                            .and_then(|f| f.get("arguments"))
                            .and_then(|a| a.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    }
                })
                .collect();
        }
    }

    event.finish_reason = choice
        .get("finish_reason")
        .and_then(|f| f.as_str())
        .map(str::to_string);
    Some(event)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_line() {
        let line = r#"data: {"id":"c1","choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        let event = parse_sse_line(line).unwrap();
        assert_eq!(event.content_delta.as_deref(), Some("Hello"));
        assert!(!event.done);
        assert!(event.finish_reason.is_none());
    }

    #[test]
    fn test_parse_done_and_ignored_lines() {
        assert!(parse_sse_line("data: [DONE]").unwrap().done);
        assert!(parse_sse_line(": keep-alive").is_none());
        assert!(parse_sse_line("").is_none());
        assert!(parse_sse_line("event: ping").is_none());
    }

    #[test]
    fn test_parse_tool_call_and_finish() {
        let line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"lookup","arguments":"{\"q\""}}]},"finish_reason":"tool_calls"}]}"#;
        let event = parse_sse_line(line).unwrap();
        assert_eq!(
            event.tool_call_deltas,
            vec![ToolCallDelta {
                index: 1,
                id: Some("call_b".into()),
                name: Some("lookup".into()),
                arguments: "{\"q\"".into(),
            }]
        );
        assert_eq!(event.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_parse_error_payload() {
        let event = parse_sse_line(r#"data: {"error":{"message":"overloaded"}}"#).unwrap();
        assert_eq!(event.error.as_deref(), Some("overloaded"));
    }

    #[test]
    fn test_decoder_joins_split_lines() {
        let mut decoder = SseDecoder::default();
        let first = decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel");
        assert!(first.is_empty());
        let rest = decoder.push(b"lo\"}}]}\n\ndata: [DONE]\n");
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].content_delta.as_deref(), Some("Hello"));
        assert!(rest[1].done);
    }

    #[test]
    fn test_decoder_multibyte_split() {
        let mut decoder = SseDecoder::default();
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"é\"}}]}\n".as_bytes();
        let cut = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&line[..cut]).is_empty());
        let events = decoder.push(&line[cut..]);
        assert_eq!(events[0].content_delta.as_deref(), Some("é"));
    }

    #[test]
    fn test_map_status() {
        assert!(matches!(map_status(429, "slow down"), StreamError::Transient { .. }));
        assert!(matches!(map_status(503, ""), StreamError::Transient { .. }));
        assert_eq!(
            map_status(401, "bad key"),
            StreamError::Backend {
                status: 401,
                message: "bad key".into()
            }
        );
    }
}
