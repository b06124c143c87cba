//! OpenAI-compatible reference backend.
//!
//! Implements [`ModelBackend`] against the Chat Completions API, which also
//! covers OpenAI-compatible endpoints such as Ollama, Together, and vLLM,
//! in both streaming SSE and non-streaming modes.
//!
//! The streaming format sends `data:` lines in standard SSE framing with
//! JSON payloads containing `choices[].delta` objects and terminates with a
//! `data: [DONE]` sentinel.  [`SseChunkDecoder`] translates those lines into
//! the neutral [`StreamChunk`] union: explicit start/delta framing for text,
//! reasoning, and per-call tool input, with terminal [`StreamChunk::ToolCall`]
//! records and a [`StreamChunk::Finish`] flushed at the end.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{AgentError, Result};
use crate::llm::backend::{BackendRequest, ModelBackend};
use crate::llm::types::{
    ChunkStream, Content, FinishReason, Message, ModelTurn, Role, StreamChunk, ToolChoice,
    ToolDefinition, Usage,
};

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Chat Completions backend.  Cheaply cloneable; the inner `reqwest::Client`
/// pools connections.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    http: reqwest::Client,
}

impl OpenAiBackend {
    /// Create a backend with a fresh HTTP client.
    ///
    /// No request timeout is set here: the gateway owns all streaming
    /// bounds, and non-streaming calls are bounded by the caller.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::Provider {
                provider: "openai-compatible".into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }

    /// Send the HTTP request to the `chat/completions` endpoint.
    async fn send_request(&self, request: &BackendRequest, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", request.endpoint.trim_end_matches('/'));

        let mut headers = HeaderMap::new();
        let auth_value = format!("Bearer {}", request.credential);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value).map_err(|e| AgentError::Provider {
                provider: "openai-compatible".into(),
                reason: format!("invalid authorization header: {e}"),
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::debug!(url = %url, model = %body["model"], "sending model request");

        let send = self.http.post(&url).headers(headers).json(body).send();
        tokio::select! {
            _ = request.cancel.cancelled() => Err(AgentError::Cancelled),
            result = send => result.map_err(AgentError::from),
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn kind(&self) -> &str {
        "openai-compatible"
    }

    async fn generate(&self, request: BackendRequest) -> Result<ModelTurn> {
        let body = build_request_body(&request, false);
        let resp = self.send_request(&request, &body).await?;

        let status = resp.status();
        let read = resp.text();
        let text = tokio::select! {
            _ = request.cancel.cancelled() => return Err(AgentError::Cancelled),
            result = read => result.map_err(|e| AgentError::Provider {
                provider: "openai-compatible".into(),
                reason: format!("failed to read response body: {e}"),
            })?,
        };

        if !status.is_success() {
            return Err(AgentError::Provider {
                provider: "openai-compatible".into(),
                reason: format!("API returned {status}: {text}"),
            });
        }

        let v: Value = serde_json::from_str(&text).map_err(|e| AgentError::ParseFailed {
            reason: format!("invalid JSON response: {e}"),
        })?;

        parse_response(&v)
    }

    async fn open_stream(&self, request: BackendRequest) -> Result<ChunkStream> {
        let body = build_request_body(&request, true);
        let resp = self.send_request(&request, &body).await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::Provider {
                provider: "openai-compatible".into(),
                reason: format!("API returned {status}: {text}"),
            });
        }

        let cancel = request.cancel.clone();
        let (tx, rx) = mpsc::channel::<Result<StreamChunk>>(64);

        tokio::spawn(async move {
            let mut decoder = SseChunkDecoder::new();
            let mut byte_stream = resp.bytes_stream();
            let mut line_buffer = String::new();

            'read: loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(AgentError::Cancelled)).await;
                        return;
                    }
                    chunk = byte_stream.next() => chunk,
                };

                let bytes = match next {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(AgentError::Provider {
                                provider: "openai-compatible".into(),
                                reason: format!("stream read error: {e}"),
                            }))
                            .await;
                        return;
                    }
                    None => break 'read,
                };

                let text = match std::str::from_utf8(&bytes) {
                    Ok(t) => t,
                    Err(e) => {
                        let _ = tx
                            .send(Err(AgentError::ParseFailed {
                                reason: format!("invalid UTF-8 in stream: {e}"),
                            }))
                            .await;
                        return;
                    }
                };
                line_buffer.push_str(text);

                while let Some(newline_pos) = line_buffer.find('\n') {
                    let line = line_buffer[..newline_pos].to_owned();
                    line_buffer = line_buffer[newline_pos + 1..].to_owned();

                    match decoder.feed_line(&line) {
                        Ok(chunks) => {
                            for chunk in chunks {
                                if tx.send(Ok(chunk)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                    if decoder.is_done() {
                        break 'read;
                    }
                }
            }

            // Connection closed without [DONE], or [DONE] seen: flush
            // whatever is still open so the consumer always sees Finish.
            match decoder.finish() {
                Ok(chunks) => {
                    for chunk in chunks {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ---------------------------------------------------------------------------
// Request building (free functions)
// ---------------------------------------------------------------------------

/// Build the JSON body for the Chat Completions API.
fn build_request_body(request: &BackendRequest, stream: bool) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": messages_to_wire(&request.messages),
    });

    if let Some(max_tokens) = request.params.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.params.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.params.top_p {
        body["top_p"] = json!(top_p);
    }

    if !request.tools.is_empty() {
        body["tools"] = tools_to_wire(&request.tools);
        match &request.tool_choice {
            ToolChoice::Auto => {}
            ToolChoice::Required => body["tool_choice"] = json!("required"),
            ToolChoice::None => body["tool_choice"] = json!("none"),
            ToolChoice::Tool { name } => {
                body["tool_choice"] = json!({
                    "type": "function",
                    "function": {"name": name},
                });
            }
        }
    }

    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({"include_usage": true});
    }

    body
}

/// Convert neutral messages to the Chat Completions wire format.
///
/// System messages stay in the `messages` array, assistant tool calls go in
/// `tool_calls` with arguments serialized as a JSON string, and each
/// `ToolResult` block becomes its own `role: "tool"` wire message.
fn messages_to_wire(messages: &[Message]) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => wire.push(json!({"role": "system", "content": msg.text()})),
            Role::User => wire.push(json!({"role": "user", "content": msg.text()})),
            Role::Assistant => {
                let mut tool_calls: Vec<Value> = Vec::new();
                for block in &msg.content {
                    if let Content::ToolUse { id, name, input } = block {
                        tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        }));
                    }
                }

                let mut m = json!({"role": "assistant"});
                let text = msg.text();
                if !text.is_empty() {
                    m["content"] = json!(text);
                }
                if !tool_calls.is_empty() {
                    m["tool_calls"] = json!(tool_calls);
                }
                wire.push(m);
            }
            Role::Tool => {
                for block in &msg.content {
                    if let Content::ToolResult {
                        tool_call_id,
                        output,
                        ..
                    } = block
                    {
                        let content = match output {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        wire.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "content": content,
                        }));
                    }
                }
            }
        }
    }

    wire
}

/// Convert tool definitions to the Chat Completions format.
fn tools_to_wire(tools: &[ToolDefinition]) -> Value {
    let tool_values: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            })
        })
        .collect();
    json!(tool_values)
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" => FinishReason::ToolUse,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_owned()),
    }
}

fn parse_usage(v: &Value) -> Usage {
    Usage {
        input_tokens: v["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: v["completion_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

/// Parse a non-streaming Chat Completions response into a [`ModelTurn`].
fn parse_response(v: &Value) -> Result<ModelTurn> {
    let choice = &v["choices"][0];
    let message = &choice["message"];
    if message.is_null() {
        return Err(AgentError::ParseFailed {
            reason: "missing `choices[0].message` in response".into(),
        });
    }

    let mut parts: Vec<Content> = Vec::new();

    if let Some(reasoning) = message["reasoning_content"].as_str()
        && !reasoning.is_empty()
    {
        parts.push(Content::Reasoning {
            text: reasoning.to_owned(),
        });
    }

    if let Some(text) = message["content"].as_str()
        && !text.is_empty()
    {
        parts.push(Content::Text {
            text: text.to_owned(),
        });
    }

    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for tc in tool_calls {
            let func = &tc["function"];
            let name = func["name"].as_str().unwrap_or_default().to_owned();
            let args_str = func["arguments"].as_str().unwrap_or("{}");
            let input: Value =
                serde_json::from_str(args_str).map_err(|e| AgentError::ParseFailed {
                    reason: format!("invalid JSON in tool call `{name}` arguments: {e}"),
                })?;
            parts.push(Content::ToolUse {
                id: tc["id"].as_str().unwrap_or_default().to_owned(),
                name,
                input,
            });
        }
    }

    Ok(ModelTurn {
        parts,
        provider: None,
        finish_reason: choice["finish_reason"].as_str().map(map_finish_reason),
        usage: parse_usage(&v["usage"]),
    })
}

// ---------------------------------------------------------------------------
// SSE chunk decoder
// ---------------------------------------------------------------------------

/// Translates Chat Completions SSE lines into [`StreamChunk`]s.
///
/// Text and reasoning sub-streams get start markers the first time a delta
/// arrives; tool calls are keyed by the wire `index`, accumulate their
/// argument fragments, and are flushed as terminal [`StreamChunk::ToolCall`]
/// records when the stream finishes.
#[derive(Debug, Default)]
pub struct SseChunkDecoder {
    text_open: bool,
    reasoning_open: bool,
    tool_builders: Vec<ToolCallBuilder>,
    finish_reason: Option<FinishReason>,
    usage: Usage,
    done: bool,
    finished: bool,
}

/// In-progress tool call assembled from streaming deltas.
#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

impl SseChunkDecoder {
    /// Create a fresh decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` sentinel has been received.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one SSE line, producing zero or more chunks.
    pub fn feed_line(&mut self, line: &str) -> Result<Vec<StreamChunk>> {
        let line = line.trim_end();

        // Skip blanks, comments, and non-data SSE fields.
        if line.is_empty() || line.starts_with(':') {
            return Ok(Vec::new());
        }
        let Some(data) = line.strip_prefix("data: ") else {
            return Ok(Vec::new());
        };
        let data = data.trim();

        if data == "[DONE]" {
            self.done = true;
            return Ok(Vec::new());
        }

        let v: Value = serde_json::from_str(data).map_err(|e| AgentError::ParseFailed {
            reason: format!("invalid JSON in SSE data: {e}"),
        })?;

        let mut out: Vec<StreamChunk> = Vec::new();

        // Some providers surface errors as a structured payload instead of
        // an HTTP status.
        if let Some(error) = v.get("error").filter(|e| !e.is_null()) {
            out.push(StreamChunk::Error {
                message: error["message"]
                    .as_str()
                    .unwrap_or("provider error")
                    .to_owned(),
            });
            return Ok(out);
        }

        if let Some(usage_obj) = v.get("usage").filter(|u| !u.is_null()) {
            self.usage = parse_usage(usage_obj);
        }

        let choice = &v["choices"][0];
        let delta = &choice["delta"];

        if let Some(reasoning) = delta["reasoning_content"].as_str()
            && !reasoning.is_empty()
        {
            if !self.reasoning_open {
                self.reasoning_open = true;
                out.push(StreamChunk::ReasoningStart {
                    id: "reasoning-0".into(),
                });
            }
            out.push(StreamChunk::ReasoningDelta {
                id: "reasoning-0".into(),
                text: reasoning.to_owned(),
            });
        }

        if let Some(text) = delta["content"].as_str()
            && !text.is_empty()
        {
            if self.reasoning_open {
                self.reasoning_open = false;
                out.push(StreamChunk::ReasoningEnd {
                    id: "reasoning-0".into(),
                });
            }
            if !self.text_open {
                self.text_open = true;
                out.push(StreamChunk::TextStart { id: "text-0".into() });
            }
            out.push(StreamChunk::TextDelta {
                id: "text-0".into(),
                text: text.to_owned(),
            });
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;
                while self.tool_builders.len() <= index {
                    self.tool_builders.push(ToolCallBuilder::default());
                }
                let builder = &mut self.tool_builders[index];

                if let Some(id) = tc["id"].as_str() {
                    builder.id = id.to_owned();
                }
                let func = &tc["function"];
                if let Some(name) = func["name"].as_str() {
                    builder.name.push_str(name);
                }

                if !builder.started && !builder.name.is_empty() {
                    builder.started = true;
                    if builder.id.is_empty() {
                        builder.id = format!("call-{index}");
                    }
                    out.push(StreamChunk::ToolInputStart {
                        id: builder.id.clone(),
                        name: builder.name.clone(),
                    });
                }

                if let Some(args) = func["arguments"].as_str()
                    && !args.is_empty()
                {
                    builder.arguments.push_str(args);
                    if builder.started {
                        out.push(StreamChunk::ToolInputDelta {
                            id: builder.id.clone(),
                            fragment: args.to_owned(),
                        });
                    }
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(map_finish_reason(reason));
        }

        Ok(out)
    }

    /// Flush all open state: close open sub-streams, emit terminal
    /// [`StreamChunk::ToolCall`] records, and emit [`StreamChunk::Finish`].
    /// Idempotent.
    pub fn finish(&mut self) -> Result<Vec<StreamChunk>> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.finished = true;

        let mut out: Vec<StreamChunk> = Vec::new();

        if self.reasoning_open {
            self.reasoning_open = false;
            out.push(StreamChunk::ReasoningEnd {
                id: "reasoning-0".into(),
            });
        }
        if self.text_open {
            self.text_open = false;
            out.push(StreamChunk::TextEnd { id: "text-0".into() });
        }

        for builder in self.tool_builders.drain(..) {
            let arguments: Value = if builder.arguments.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&builder.arguments).map_err(|e| AgentError::ParseFailed {
                    reason: format!("invalid JSON in tool call `{}` arguments: {e}", builder.name),
                })?
            };
            out.push(StreamChunk::ToolCall {
                id: builder.id,
                name: builder.name,
                arguments,
            });
        }

        let reason = match self.finish_reason.take() {
            Some(reason) => reason,
            None => FinishReason::Other("disconnect".into()),
        };
        out.push(StreamChunk::Finish {
            reason,
            usage: self.usage,
        });

        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_kernel::CancellationToken;

    fn backend_request() -> BackendRequest {
        BackendRequest {
            model: "test-model".into(),
            credential: "sk-test".into(),
            endpoint: "http://localhost:11434/v1".into(),
            messages: vec![Message::system("You are helpful."), Message::user("Hello")],
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            params: crate::llm::types::GenerationParams {
                temperature: Some(0.7),
                max_tokens: Some(1024),
                top_p: None,
            },
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn build_request_body_basic() {
        let body = build_request_body(&backend_request(), false);

        assert_eq!(body["model"], "test-model");
        assert_eq!(body["max_tokens"], 1024);
        let temp = body["temperature"].as_f64().unwrap();
        assert!((temp - 0.7).abs() < 1e-6, "temperature was {temp}");
        assert!(body.get("stream").is_none());

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "Hello");
    }

    #[test]
    fn build_request_body_with_tools_and_stream() {
        let mut request = backend_request();
        request.tools = vec![ToolDefinition {
            name: "read_file".into(),
            description: "Read a file".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        }];
        request.tool_choice = ToolChoice::Required;

        let body = build_request_body(&request, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["tool_choice"], "required");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "read_file");
    }

    #[test]
    fn tool_results_become_tool_wire_messages() {
        let mut request = backend_request();
        request.messages = vec![
            Message::user("Read test.txt"),
            Message::assistant(vec![Content::ToolUse {
                id: "tc_01".into(),
                name: "read_file".into(),
                input: json!({"path": "test.txt"}),
            }]),
            Message::tool_results(vec![Content::ToolResult {
                tool_call_id: "tc_01".into(),
                tool_name: "read_file".into(),
                output: json!("file contents here"),
                is_error: false,
            }]),
        ];

        let body = build_request_body(&request, false);
        let messages = body["messages"].as_array().unwrap();

        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["tool_calls"][0]["id"], "tc_01");
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "tc_01");
        assert_eq!(messages[2]["content"], "file contents here");
    }

    #[test]
    fn parse_text_response() {
        let v = json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello there!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });

        let turn = parse_response(&v).unwrap();
        assert_eq!(turn.text(), "Hello there!");
        assert_eq!(turn.finish_reason, Some(FinishReason::Stop));
        assert_eq!(turn.usage.input_tokens, 10);
        assert!(!turn.has_tool_calls());
    }

    #[test]
    fn parse_tool_call_response() {
        let v = json!({
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_xyz",
                        "type": "function",
                        "function": {
                            "name": "read_file",
                            "arguments": "{\"path\":\"/tmp/test.txt\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 20, "completion_tokens": 15}
        });

        let turn = parse_response(&v).unwrap();
        let uses = turn.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "call_xyz");
        assert_eq!(uses[0].1, "read_file");
        assert_eq!(uses[0].2["path"], "/tmp/test.txt");
        assert_eq!(turn.finish_reason, Some(FinishReason::ToolUse));
    }

    // -- decoder -------------------------------------------------------------

    #[test]
    fn decoder_frames_text_with_start_marker() {
        let mut decoder = SseChunkDecoder::new();

        let first = decoder
            .feed_line(r#"data: {"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#)
            .unwrap();
        assert_eq!(
            first,
            vec![
                StreamChunk::TextStart { id: "text-0".into() },
                StreamChunk::TextDelta {
                    id: "text-0".into(),
                    text: "Hel".into()
                },
            ]
        );

        let second = decoder
            .feed_line(r#"data: {"choices":[{"index":0,"delta":{"content":"lo"}}]}"#)
            .unwrap();
        assert_eq!(
            second,
            vec![StreamChunk::TextDelta {
                id: "text-0".into(),
                text: "lo".into()
            }]
        );
    }

    #[test]
    fn decoder_accumulates_tool_fragments_and_flushes_tool_call() {
        let mut decoder = SseChunkDecoder::new();

        let start = decoder.feed_line(
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"read_file","arguments":""}}]}}]}"#,
        )
        .unwrap();
        assert_eq!(
            start,
            vec![StreamChunk::ToolInputStart {
                id: "call_abc".into(),
                name: "read_file".into()
            }]
        );

        decoder.feed_line(
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":"}}]}}]}"#,
        )
        .unwrap();
        decoder.feed_line(
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"test.txt\"}"}}]}}]}"#,
        )
        .unwrap();
        decoder
            .feed_line(r#"data: {"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#)
            .unwrap();
        decoder.feed_line("data: [DONE]").unwrap();
        assert!(decoder.is_done());

        let flushed = decoder.finish().unwrap();
        assert_eq!(flushed.len(), 2);
        match &flushed[0] {
            StreamChunk::ToolCall {
                id,
                name,
                arguments,
            } => {
                assert_eq!(id, "call_abc");
                assert_eq!(name, "read_file");
                assert_eq!(arguments["path"], "test.txt");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
        match &flushed[1] {
            StreamChunk::Finish { reason, .. } => assert_eq!(*reason, FinishReason::ToolUse),
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn decoder_surfaces_structured_errors() {
        let mut decoder = SseChunkDecoder::new();
        let chunks = decoder
            .feed_line(r#"data: {"error":{"message":"quota exhausted"}}"#)
            .unwrap();
        assert_eq!(
            chunks,
            vec![StreamChunk::Error {
                message: "quota exhausted".into()
            }]
        );
    }

    #[test]
    fn decoder_finish_is_idempotent_and_handles_disconnect() {
        let mut decoder = SseChunkDecoder::new();
        decoder
            .feed_line(r#"data: {"choices":[{"index":0,"delta":{"content":"partial"}}]}"#)
            .unwrap();

        // No [DONE]: stream dropped.
        let flushed = decoder.finish().unwrap();
        assert!(matches!(flushed[0], StreamChunk::TextEnd { .. }));
        assert!(matches!(
            flushed.last(),
            Some(StreamChunk::Finish {
                reason: FinishReason::Other(_),
                ..
            })
        ));

        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn decoder_ignores_keepalives_and_other_fields() {
        let mut decoder = SseChunkDecoder::new();
        assert!(decoder.feed_line("").unwrap().is_empty());
        assert!(decoder.feed_line(": keepalive").unwrap().is_empty());
        assert!(decoder.feed_line("event: message").unwrap().is_empty());
    }

    #[test]
    fn decoder_rejects_invalid_json() {
        let mut decoder = SseChunkDecoder::new();
        assert!(decoder.feed_line("data: {invalid json}").is_err());
    }
}
