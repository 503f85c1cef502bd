//! Transport-agnostic provider types.
//!
//! The engine treats "call provider P with model M" as an abstract streaming
//! operation: a [`ChatTransport`] turns a [`ChatRequest`] into a
//! [`DeltaStream`], and transport-level failures surface as
//! [`ProviderError`]s, distinct from conversational content.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::session::Message;
use crate::tools::ToolDefinition;

/// Categories of provider transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// HTTP status error (4xx, 5xx)
    HttpStatus,
    /// Connection or request timeout
    Timeout,
    /// Failed to parse the response (JSON parse error, invalid SSE)
    Parse,
    /// API-level error returned by the provider mid-stream
    ApiError,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderErrorKind::HttpStatus => "http_status",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::Parse => "parse",
            ProviderErrorKind::ApiError => "api_error",
        };
        f.write_str(label)
    }
}

/// Structured transport error with kind and optional raw details.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// One-line summary suitable for display.
    pub message: String,
    /// Optional additional details (e.g. raw error body).
    pub details: Option<String>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Creates an HTTP status error, extracting the provider's error message
    /// from a JSON body when one is present.
    pub fn http_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}");
        let details = if body.is_empty() {
            None
        } else {
            if let Ok(json) = serde_json::from_str::<Value>(body)
                && let Some(error_obj) = json.get("error")
                && let Some(msg) = error_obj.get("message").and_then(|v| v.as_str())
            {
                return Self {
                    kind: ProviderErrorKind::HttpStatus,
                    message: format!("HTTP {status}: {msg}"),
                    details: Some(body.to_string()),
                };
            }
            Some(body.to_string())
        };
        Self {
            kind: ProviderErrorKind::HttpStatus,
            message,
            details,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Parse, message)
    }

    /// Creates an API error from a mid-stream error event.
    pub fn api_error(error_type: &str, message: &str) -> Self {
        Self {
            kind: ProviderErrorKind::ApiError,
            message: format!("{error_type}: {message}"),
            details: None,
        }
    }
}

/// One increment of streamed model output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamDelta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
}

impl StreamDelta {
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.reasoning.is_none() && self.tool_calls.is_empty()
    }
}

/// Fragment of a streamed tool call.
///
/// The transport resolves provider-side indexes to correlation ids before
/// deltas leave it; a fragment without an id extends the most recently
/// started call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Boxed stream of deltas, terminated by stream end.
pub type DeltaStream = BoxStream<'static, Result<StreamDelta, ProviderError>>;

/// Streaming request handed to a transport.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub base_url: String,
    pub api_key: Option<String>,
    pub extra_headers: HashMap<String, String>,
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub system_prompt: Option<String>,
}

/// Abstract streaming chat operation against one provider.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Opens a streaming completion for the given request.
    ///
    /// # Errors
    /// Fails with a [`ProviderError`] on connection, auth, or protocol
    /// problems; mid-stream failures surface as `Err` items on the stream.
    async fn stream_chat(&self, request: ChatRequest) -> Result<DeltaStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_extracts_json_error_message() {
        let err = ProviderError::http_status(
            429,
            r#"{"error":{"type":"rate_limit","message":"slow down"}}"#,
        );
        assert_eq!(err.kind, ProviderErrorKind::HttpStatus);
        assert_eq!(err.message, "HTTP 429: slow down");
        assert!(err.details.is_some());
    }

    #[test]
    fn http_status_keeps_opaque_bodies_as_details() {
        let err = ProviderError::http_status(502, "bad gateway");
        assert_eq!(err.message, "HTTP 502");
        assert_eq!(err.details.as_deref(), Some("bad gateway"));
    }

    #[test]
    fn empty_delta_detection() {
        assert!(StreamDelta::default().is_empty());
        let delta = StreamDelta {
            content: Some("hi".to_string()),
            ..StreamDelta::default()
        };
        assert!(!delta.is_empty());
    }
}
