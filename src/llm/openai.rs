//! OpenAI-compatible streaming chat client
//!
//! Speaks `POST {base_url}/chat/completions` with `stream: true` and decodes
//! the SSE response incrementally. Works against any endpoint that follows
//! the OpenAI chat-completions wire format.

use super::{ChatModel, CompletionEvent, CompletionRequest, CompletionResponse, CompletionStream};
use crate::error::ChatAgentError;
use crate::models::{ChatMessage, MessageRole, ToolCall, ToolDefinition};
use crate::Result;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Reusable model client (connection-pooled)
pub struct OpenAiCompatClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        // No overall timeout: a streamed answer may legitimately run long.
        // The read timeout bounds silence between chunks instead.
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    fn build_request(&self, request: &CompletionRequest) -> WireRequest {
        WireRequest {
            model: self.model.clone(),
            messages: request.messages.iter().map(WireMessage::from).collect(),
            tools: request.tools.iter().map(WireTool::from).collect(),
            stream: true,
        }
    }
}

#[async_trait::async_trait]
impl ChatModel for OpenAiCompatClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request(&request);

        debug!(
            model = %self.model,
            message_count = body.messages.len(),
            tool_count = body.tools.len(),
            "Starting streaming completion"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Model request failed: {}", e);
                ChatAgentError::LlmError(format!("Model request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Model endpoint error response: {}", error_text);
            return Err(ChatAgentError::LlmError(format!(
                "Model endpoint returned {}: {}",
                status, error_text
            )));
        }

        Ok(decode_stream(Box::pin(response.bytes_stream())))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

struct StreamState {
    inner: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<Result<CompletionEvent>>,
    finished: bool,
}

/// Turn a raw SSE byte stream into completion events.
fn decode_stream(inner: ByteStream) -> CompletionStream {
    let state = StreamState {
        inner,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    let events = futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    trace!(bytes_len = chunk.len(), "Received SSE data chunk");
                    match state.decoder.push(&chunk) {
                        Ok(events) => state.pending.extend(events.into_iter().map(Ok)),
                        Err(e) => {
                            state.finished = true;
                            state.pending.push_back(Err(e));
                        }
                    }
                    if state.decoder.is_done() {
                        state.finished = true;
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.push_back(Err(ChatAgentError::LlmError(format!(
                        "Model stream interrupted: {}",
                        e
                    ))));
                }
                None => {
                    state.finished = true;
                    if let Some(event) = state.decoder.finish() {
                        state.pending.push_back(Ok(event));
                    }
                }
            }
        }
    });

    Box::pin(events)
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental decoder for OpenAI chat-completion SSE bodies.
///
/// Bytes may split lines (and UTF-8 sequences) arbitrarily, so input is
/// buffered until a full line is available.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    content: String,
    tool_calls: BTreeMap<u32, PartialToolCall>,
    finish_reason: Option<String>,
    done: bool,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a chunk of bytes and return every event it completes.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<Vec<CompletionEvent>> {
        let mut events = Vec::new();
        if self.done {
            return Ok(events);
        }

        self.buffer.extend_from_slice(chunk);

        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8(raw).map_err(|e| {
                ChatAgentError::LlmError(format!("Invalid UTF-8 in model stream: {}", e))
            })?;
            let line = line.trim_end_matches(['\n', '\r']);

            // blank separators and `:` comments carry nothing
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                debug!("Received [DONE] marker");
                self.done = true;
                events.push(CompletionEvent::Completed(self.take_response()));
                return Ok(events);
            }

            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => self.apply_chunk(chunk, &mut events),
                Err(parse_error) => {
                    if let Ok(api_error) = serde_json::from_str::<ApiErrorBody>(data) {
                        return Err(ChatAgentError::LlmError(api_error.error.message));
                    }
                    warn!(error = %parse_error, data = data, "Failed to parse stream chunk");
                }
            }
        }

        Ok(events)
    }

    /// Called when the byte stream ends without a `[DONE]` marker.
    pub(crate) fn finish(&mut self) -> Option<CompletionEvent> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(CompletionEvent::Completed(self.take_response()))
    }

    fn apply_chunk(&mut self, chunk: StreamChunk, events: &mut Vec<CompletionEvent>) {
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }

            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                self.content.push_str(&content);
                events.push(CompletionEvent::TextDelta(content));
            }

            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let call = self.tool_calls.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    call.id = id;
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        call.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        call.arguments.push_str(&arguments);
                    }
                }
            }
        }
    }

    fn take_response(&mut self) -> CompletionResponse {
        let tool_calls = std::mem::take(&mut self.tool_calls)
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| {
                let arguments = if call.arguments.trim().is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    serde_json::from_str(&call.arguments)
                        .unwrap_or(Value::String(call.arguments))
                };
                ToolCall {
                    id: call.id,
                    name: call.name,
                    arguments,
                }
            })
            .collect();

        CompletionResponse {
            content: std::mem::take(&mut self.content),
            tool_calls,
            finish_reason: self.finish_reason.take(),
        }
    }
}

//
// ================= Wire Types =================
//

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role.to_string(),
            content: message.content.clone(),
            tool_calls: if message.role == MessageRole::Assistant {
                message.tool_calls.iter().map(WireToolCall::from).collect()
            } else {
                Vec::new()
            },
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
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
            kind: "function",
            function: WireFunctionCall {
                name: call.name.clone(),
                arguments: match &call.arguments {
                    // unparseable arguments are kept as the model sent them
                    Value::String(raw) => raw.clone(),
                    other => other.to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ToolDefinition,
}

impl From<&ToolDefinition> for WireTool {
    fn from(definition: &ToolDefinition) -> Self {
        Self {
            kind: "function",
            function: definition.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: u32,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str, timeout: Duration) -> OpenAiCompatClient {
        OpenAiCompatClient::new(base_url, "test-api-key", "test-model", timeout).unwrap()
    }

    fn user_request(content: &str) -> CompletionRequest {
        CompletionRequest {
            messages: vec![ChatMessage::user(content)],
            tools: vec![],
        }
    }

    fn text_chunk(text: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": text}, "finish_reason": null}]})
        )
    }

    #[test]
    fn test_text_deltas_then_done() {
        let mut decoder = SseDecoder::new();

        let mut events = decoder.push(text_chunk("Apple ").as_bytes()).unwrap();
        events.extend(decoder.push(text_chunk("closed at 185.64").as_bytes()).unwrap());
        events.extend(decoder.push(b": keep-alive\n\ndata: [DONE]\n\n").unwrap());

        assert_eq!(
            events,
            vec![
                CompletionEvent::TextDelta("Apple ".to_string()),
                CompletionEvent::TextDelta("closed at 185.64".to_string()),
                CompletionEvent::Completed(CompletionResponse {
                    content: "Apple closed at 185.64".to_string(),
                    tool_calls: vec![],
                    finish_reason: None,
                }),
            ]
        );
        assert!(decoder.is_done());
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let line = text_chunk("héllo");
        let (head, tail) = line.as_bytes().split_at(20);

        assert!(decoder.push(head).unwrap().is_empty());
        let events = decoder.push(tail).unwrap();
        assert_eq!(events, vec![CompletionEvent::TextDelta("héllo".to_string())]);
    }

    #[test]
    fn test_tool_call_fragments_are_accumulated() {
        let mut decoder = SseDecoder::new();
        let first = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "function": {"name": "get_stock_price", "arguments": "{\"tic"}}
        ]}}]});
        let second = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "ker\": \"AAPL\"}"}}
        ]}, "finish_reason": "tool_calls"}]});

        let body = format!("data: {}\n\ndata: {}\n\n", first, second);
        assert!(decoder.push(body.as_bytes()).unwrap().is_empty());

        let Some(CompletionEvent::Completed(response)) = decoder.finish() else {
            panic!("expected completion");
        };
        assert_eq!(response.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(
            response.tool_calls,
            vec![ToolCall {
                id: "call_1".to_string(),
                name: "get_stock_price".to_string(),
                arguments: json!({"ticker": "AAPL"}),
            }]
        );
    }

    #[test]
    fn test_embedded_error_is_reported() {
        let mut decoder = SseDecoder::new();
        let body = format!(
            "data: {}\n\n",
            json!({"error": {"message": "model overloaded", "type": "server_error"}})
        );

        let result = decoder.push(body.as_bytes());
        assert!(matches!(result, Err(ChatAgentError::LlmError(msg)) if msg == "model overloaded"));
    }

    #[tokio::test]
    async fn test_decode_stream_yields_events_in_order() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from(text_chunk("one "))),
            Ok(Bytes::from(text_chunk("two"))),
        ];
        let events: Vec<_> = decode_stream(Box::pin(futures::stream::iter(chunks)))
            .collect()
            .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], Ok(CompletionEvent::TextDelta(t)) if t == "one "));
        assert!(matches!(
            &events[2],
            Ok(CompletionEvent::Completed(r)) if r.content == "one two"
        ));
    }

    #[test]
    fn test_wire_request_shape() {
        let client = OpenAiCompatClient::new(
            "http://localhost:9000/v1/",
            "key",
            "test-model",
            Duration::from_secs(5),
        )
        .unwrap();

        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system("sys"),
                ChatMessage::assistant(
                    "",
                    vec![ToolCall {
                        id: "call_1".to_string(),
                        name: "get_stock_price".to_string(),
                        arguments: json!({"ticker": "AAPL"}),
                    }],
                ),
                ChatMessage::tool("call_1", "{\"price\":1.0}"),
            ],
            tools: vec![],
        };

        let wire = serde_json::to_value(client.build_request(&request)).unwrap();
        assert_eq!(client.base_url, "http://localhost:9000/v1");
        assert_eq!(wire["model"], "test-model");
        assert_eq!(wire["stream"], true);
        assert!(wire.get("tools").is_none());
        assert_eq!(wire["messages"][1]["tool_calls"][0]["type"], "function");
        assert_eq!(
            wire["messages"][1]["tool_calls"][0]["function"]["arguments"],
            "{\"ticker\":\"AAPL\"}"
        );
        assert_eq!(wire["messages"][2]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_unparseable_arguments_round_trip_verbatim() {
        let mut decoder = SseDecoder::new();
        let chunk = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_9", "function": {"name": "get_stock_price", "arguments": "{\"ticker\": AAPL"}}
        ]}}]});
        decoder.push(format!("data: {}\n\n", chunk).as_bytes()).unwrap();

        let Some(CompletionEvent::Completed(response)) = decoder.finish() else {
            panic!("expected completion");
        };
        let wire = serde_json::to_value(WireToolCall::from(&response.tool_calls[0])).unwrap();
        assert_eq!(wire["function"]["arguments"], "{\"ticker\": AAPL");
    }

    #[tokio::test]
    async fn test_stream_sends_bearer_auth_and_body() {
        let server = MockServer::start().await;
        let sse = format!("{}{}data: [DONE]\n\n", text_chunk("Hello "), text_chunk("there"));

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test-api-key"))
            .and(body_partial_json(json!({
                "model": "test-model",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&format!("{}/v1", server.uri()), Duration::from_secs(5));
        let events: Vec<_> = client
            .stream(user_request("hi"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], Ok(CompletionEvent::TextDelta(t)) if t == "Hello "));
        assert!(matches!(
            &events[2],
            Ok(CompletionEvent::Completed(r)) if r.content == "Hello there"
        ));
    }

    #[tokio::test]
    async fn test_error_status_is_llm_error_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"error": {"message": "invalid api key"}})),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), Duration::from_secs(5));
        let Err(ChatAgentError::LlmError(message)) = client.stream(user_request("hi")).await else {
            panic!("expected LlmError");
        };
        assert!(message.contains("401"));
        assert!(message.contains("invalid api key"));
    }

    #[tokio::test]
    async fn test_silent_stream_times_out() {
        use axum::{body::Body, routing::post, Router};

        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                let first = futures::stream::once(async {
                    Ok::<_, std::convert::Infallible>(Bytes::from(text_chunk("hi")))
                });
                Body::from_stream(first.chain(futures::stream::pending()))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = test_client(&format!("http://{}", address), Duration::from_millis(300));
        let mut stream = client.stream(user_request("hi")).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, CompletionEvent::TextDelta("hi".to_string()));

        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stalled stream was not cut off");
        assert!(matches!(next, Some(Err(ChatAgentError::LlmError(_)))));
    }
}
