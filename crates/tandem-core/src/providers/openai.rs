//! OpenAI-compatible chat-completions streaming transport.
//!
//! Speaks the `/chat/completions` SSE protocol against any configured base
//! URL. Provider-side tool-call indexes are resolved to correlation ids
//! before deltas leave this module, so downstream consumers merge purely by
//! id.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::{EventStream, Eventsource};
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::providers::shared::{
    ChatRequest, ChatTransport, DeltaStream, ProviderError, ProviderErrorKind, StreamDelta,
    ToolCallDelta,
};
use crate::session::{Message, ToolCall};
use crate::tools::ToolDefinition;

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Streaming transport for OpenAI-compatible chat-completions endpoints.
pub struct HttpChatTransport {
    http: reqwest::Client,
}

impl HttpChatTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpChatTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn stream_chat(&self, request: ChatRequest) -> Result<DeltaStream, ProviderError> {
        let payload = ChatCompletionRequest::new(&request);
        let url = format!(
            "{}{}",
            request.base_url.trim_end_matches('/'),
            CHAT_COMPLETIONS_PATH
        );
        let headers = build_headers(request.api_key.as_deref(), &request.extra_headers);

        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(&payload)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ProviderError::http_status(status.as_u16(), &error_body));
        }

        Ok(SseDeltaParser::new(response.bytes_stream()).boxed())
    }
}

fn build_headers(api_key: Option<&str>, extra_headers: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key {
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {key}"))
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );
    }
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    headers.insert("content-type", HeaderValue::from_static("application/json"));

    for (name, value) in extra_headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid extra header"),
        }
    }

    headers
}

fn classify_reqwest_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::timeout(format!("Connection failed: {e}"))
    } else if e.is_request() {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Request error: {e}"))
    } else {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Network error: {e}"))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    stream: bool,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireToolDefinition>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

impl From<&ToolCall> for WireToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            tool_type: "function",
            function: WireFunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct WireToolDefinition {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunctionDefinition,
}

#[derive(Debug, Serialize)]
struct WireFunctionDefinition {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolDefinition> for WireToolDefinition {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            tool_type: "function",
            function: WireFunctionDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            },
        }
    }
}

impl ChatCompletionRequest {
    fn new(request: &ChatRequest) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if let Some(prompt) = &request.system_prompt
            && !prompt.trim().is_empty()
        {
            messages.push(WireMessage {
                role: "system",
                content: Some(prompt.clone()),
                reasoning_content: None,
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for message in &request.messages {
            messages.push(WireMessage::from(message));
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(WireToolDefinition::from).collect())
        };

        Self {
            model: request.model.clone(),
            stream: true,
            messages,
            tools,
        }
    }
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        let tool_calls: Option<Vec<WireToolCall>> = message
            .tool_calls
            .as_ref()
            .filter(|calls| !calls.is_empty())
            .map(|calls| calls.iter().map(WireToolCall::from).collect());

        // Assistant turns that only carry tool calls omit the content field.
        let content = if message.content.is_empty() && tool_calls.is_some() {
            None
        } else {
            Some(message.content.clone())
        };

        Self {
            role: message.role.as_str(),
            content,
            reasoning_content: message.reasoning_content.clone(),
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

/// Re-emits a trailing blank line so the final SSE event is flushed even
/// when the server body ends without one.
struct SseTerminatedStream<S> {
    inner: S,
    emitted_terminator: bool,
}

impl<S> SseTerminatedStream<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            emitted_terminator: false,
        }
    }
}

impl<S, E> Stream for SseTerminatedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.emitted_terminator {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(item)),
            Poll::Ready(None) => {
                self.emitted_terminator = true;
                Poll::Ready(Some(Ok(Bytes::from_static(b"\n\n"))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// SSE parser translating chat-completion chunks into [`StreamDelta`]s.
struct SseDeltaParser<S> {
    inner: EventStream<SseTerminatedStream<S>>,
    tool_call_ids: HashMap<u64, String>,
    done: bool,
}

impl<S> SseDeltaParser<S> {
    fn new<E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
    {
        Self {
            inner: SseTerminatedStream::new(stream).eventsource(),
            tool_call_ids: HashMap::new(),
            done: false,
        }
    }

    fn handle_event_data(&mut self, data: &str) -> Result<Option<StreamDelta>, ProviderError> {
        let trimmed = data.trim();
        if trimmed == "[DONE]" {
            self.done = true;
            return Ok(None);
        }
        if trimmed.is_empty() {
            return Ok(None);
        }

        let value = serde_json::from_str::<Value>(trimmed)
            .map_err(|err| ProviderError::parse(format!("Failed to parse SSE JSON: {err}")))?;

        // Mid-stream API errors are terminal; nothing follows them.
        if let Some(error) = value.get("error") {
            self.done = true;
            let error_type = error
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("error");
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error");
            return Err(ProviderError::api_error(error_type, message));
        }

        let Some(delta) = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("delta"))
        else {
            // Usage-only or keepalive chunk.
            return Ok(None);
        };

        let parsed = self.parse_delta(delta);
        Ok((!parsed.is_empty()).then_some(parsed))
    }

    fn parse_delta(&mut self, delta: &Value) -> StreamDelta {
        let mut out = StreamDelta::default();

        if let Some(text) = delta.get("content").and_then(|v| v.as_str())
            && !text.is_empty()
        {
            out.content = Some(text.to_string());
        }

        if let Some(reasoning) = delta
            .get("reasoning_content")
            .or_else(|| delta.get("reasoning"))
            .and_then(|v| v.as_str())
            && !reasoning.is_empty()
        {
            out.reasoning = Some(reasoning.to_string());
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for call in tool_calls {
                let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let id = call
                    .get("id")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty());
                let function = call.get("function").unwrap_or(&Value::Null);
                let name = function
                    .get("name")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty());
                let arguments = function
                    .get("arguments")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty());

                let resolved = self
                    .tool_call_ids
                    .entry(index)
                    .or_insert_with(|| {
                        id.map_or_else(|| format!("toolcall-{index}"), ToString::to_string)
                    })
                    .clone();

                out.tool_calls.push(ToolCallDelta {
                    id: Some(resolved),
                    name: name.map(ToString::to_string),
                    arguments: arguments.map(ToString::to_string),
                });
            }
        }

        out
    }
}

impl<S, E> Stream for SseDeltaParser<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<StreamDelta, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    let data = event.data;
                    match self.handle_event_data(&data) {
                        Ok(Some(delta)) => return Poll::Ready(Some(Ok(delta))),
                        Ok(None) => {}
                        Err(err) => return Poll::Ready(Some(Err(err))),
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(ProviderError::parse(format!(
                        "SSE stream error: {e}"
                    )))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures_util::stream;
    use serde_json::json;

    use super::*;
    use crate::session::Role;

    async fn parse_sse(body: &str) -> Vec<Result<StreamDelta, ProviderError>> {
        let chunks: Vec<Result<Bytes, Infallible>> = vec![Ok(Bytes::from(body.to_string()))];
        SseDeltaParser::new(stream::iter(chunks)).collect().await
    }

    fn only_deltas(items: Vec<Result<StreamDelta, ProviderError>>) -> Vec<StreamDelta> {
        items.into_iter().map(Result::unwrap).collect()
    }

    #[tokio::test]
    async fn parses_content_deltas_in_order() {
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let deltas = only_deltas(parse_sse(body).await);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].content.as_deref(), Some("Hel"));
        assert_eq!(deltas[1].content.as_deref(), Some("lo"));
    }

    #[tokio::test]
    async fn parses_reasoning_under_either_field_name() {
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"reasoning_content\":\"thinking \"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"reasoning\":\"more\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let deltas = only_deltas(parse_sse(body).await);
        assert_eq!(deltas[0].reasoning.as_deref(), Some("thinking "));
        assert_eq!(deltas[1].reasoning.as_deref(), Some("more"));
    }

    #[tokio::test]
    async fn resolves_tool_call_fragments_to_one_id() {
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"read\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"path\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"a.txt\\\"}\"}}]}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let deltas = only_deltas(parse_sse(body).await);
        assert_eq!(deltas.len(), 3);
        for delta in &deltas {
            assert_eq!(delta.tool_calls[0].id.as_deref(), Some("call_1"));
        }
        assert_eq!(deltas[0].tool_calls[0].name.as_deref(), Some("read"));
        assert_eq!(
            deltas[1].tool_calls[0].arguments.as_deref(),
            Some("{\"path\":")
        );
    }

    #[tokio::test]
    async fn synthesizes_ids_when_provider_omits_them() {
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":2,\"function\":{\"name\":\"bash\"}}]}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let deltas = only_deltas(parse_sse(body).await);
        assert_eq!(deltas[0].tool_calls[0].id.as_deref(), Some("toolcall-2"));
    }

    #[tokio::test]
    async fn midstream_error_is_terminal() {
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"partial\"}}]}\n\n",
            "data: {\"error\":{\"type\":\"overloaded_error\",\"message\":\"try later\"}}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"never seen\"}}]}\n\n",
        );
        let items = parse_sse(body).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        let err = items[1].as_ref().unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::ApiError);
        assert_eq!(err.message, "overloaded_error: try later");
    }

    #[tokio::test]
    async fn final_event_without_trailing_terminator_still_parses() {
        let body = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"tail\"}}]}";
        let deltas = only_deltas(parse_sse(body).await);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].content.as_deref(), Some("tail"));
    }

    #[test]
    fn request_prepends_system_prompt_and_maps_tool_turns() {
        let mut assistant = Message::assistant("");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call_9".to_string(),
            name: "bash".to_string(),
            arguments: "{\"command\":\"ls\"}".to_string(),
        }]);
        let request = ChatRequest {
            base_url: "http://localhost".to_string(),
            api_key: None,
            extra_headers: HashMap::new(),
            model: "test-model".to_string(),
            messages: vec![
                Message::user("hi"),
                assistant,
                Message::tool_result("call_9", "file.txt"),
            ],
            tools: vec![ToolDefinition {
                name: "bash".to_string(),
                description: "run a command".to_string(),
                input_schema: json!({"type": "object"}),
            }],
            system_prompt: Some("be brief".to_string()),
        };

        let payload = ChatCompletionRequest::new(&request);
        assert_eq!(payload.messages.len(), 4);
        assert_eq!(payload.messages[0].role, "system");
        assert_eq!(payload.messages[1].role, Role::User.as_str());
        // Tool-call-only assistant turns drop the content field entirely.
        assert!(payload.messages[2].content.is_none());
        assert_eq!(
            payload.messages[2].tool_calls.as_ref().unwrap()[0].id,
            "call_9"
        );
        assert_eq!(
            payload.messages[3].tool_call_id.as_deref(),
            Some("call_9")
        );
        assert!(payload.tools.is_some());

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["stream"], json!(true));
        assert_eq!(json["tools"][0]["type"], json!("function"));
    }
}
