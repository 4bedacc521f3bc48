use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ApiConfig;

use super::registry::ToolSchema;

/// Total attempts per request, including the first one.
const MAX_ATTEMPTS: u32 = 3;
/// Base delay for exponential backoff between attempts.
const RETRY_BACKOFF_SECS: f64 = 1.5;
/// Status codes worth retrying. Everything else fails immediately.
const RETRYABLE_STATUS: [u16; 4] = [429, 500, 502, 503];
/// Raw provider error bodies are clipped to this many characters.
const ERROR_DETAIL_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content: plain text for most turns, typed parts when an image
/// rides along with the text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageRef },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One turn of the conversation.
///
/// An assistant turn that requests tools carries `tool_calls`; each of
/// those calls must be answered by a tool turn carrying the matching
/// `tool_call_id` before the next user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
            reasoning: None,
        }
    }

    /// Assistant turn that requests tool calls, with whatever text
    /// accompanied them (possibly none).
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.map(MessageContent::Text),
            tool_calls: Some(calls),
            tool_call_id: None,
            reasoning: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
            reasoning: None,
        }
    }

    /// Attaches the model's thinking trace to an assistant turn. Reasoning
    /// models reject a conversation where their own trace went missing, so
    /// it stays on the message and goes back out on the wire.
    pub fn with_reasoning(mut self, reasoning: &str) -> Self {
        if !reasoning.is_empty() {
            self.reasoning = Some(reasoning.to_string());
        }
        self
    }

    /// The text portion of the content, ignoring any image parts.
    pub fn content_text(&self) -> &str {
        match &self.content {
            Some(MessageContent::Text(text)) => text,
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .find_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .unwrap_or(""),
            None => "",
        }
    }
}

/// A tool invocation requested by the model. `arguments` is the raw JSON
/// string exactly as the provider sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Some gateways omit `total_tokens`; fill it in from the parts.
    pub fn normalized(mut self) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.prompt_tokens + self.completion_tokens;
        }
        self
    }
}

/// Final text reply from one model request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmReply {
    pub content: String,
    pub reasoning: String,
}

/// Tool calls requested by one model request, plus any text and reasoning
/// that came with them.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallBatch {
    pub calls: Vec<ToolCallRequest>,
    pub content: String,
    pub reasoning: String,
}

/// Events emitted by an in-flight model request.
///
/// Exactly one terminal event (`Finished`, `ToolCalls` or `Error`) closes
/// a request, except when it was cancelled: then the channel simply
/// closes with no terminal event.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Chunk(String),
    Reasoning(String),
    Retrying {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    Usage(TokenUsage),
    Finished(LlmReply),
    ToolCalls(ToolCallBatch),
    Error(ClientError),
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("no API key configured; set api.key in the config file")]
    MissingApiKey,
    #[error("HTTP {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("HTTP {status}: {detail} (retried {attempts} times)")]
    Exhausted {
        status: u16,
        detail: String,
        attempts: u32,
    },
    #[error("network error: {message} (retried {attempts} times)")]
    Network { attempts: u32, message: String },
    #[error("stream interrupted: {0}")]
    Stream(String),
    #[error("{0}")]
    Protocol(String),
}

/// Cooperative cancellation shared between the conversation controller
/// and whatever request is currently in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    /// Force a text-only reply; used on the last permitted tool round.
    None,
}

impl ToolChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolChoice::Auto => "auto",
            ToolChoice::None => "none",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: ToolChoice,
    pub stream: bool,
}

/// Seam between the controller and the wire. The production backend talks
/// HTTP; tests script event sequences instead.
pub trait ChatBackend: Send + Sync {
    fn request(&self, request: ChatRequest, cancel: CancelFlag) -> mpsc::UnboundedReceiver<LlmEvent>;
}

/// OpenAI-compatible chat completions client.
pub struct LlmClient {
    http: Client,
    api: ApiConfig,
}

impl LlmClient {
    pub fn new(api: ApiConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs))
            .build()?;
        Ok(Self { http, api })
    }
}

impl ChatBackend for LlmClient {
    fn request(&self, request: ChatRequest, cancel: CancelFlag) -> mpsc::UnboundedReceiver<LlmEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let http = self.http.clone();
        let api = self.api.clone();
        tokio::spawn(async move {
            run_request(http, api, request, cancel, tx).await;
        });
        rx
    }
}

async fn run_request(
    http: Client,
    api: ApiConfig,
    request: ChatRequest,
    cancel: CancelFlag,
    tx: mpsc::UnboundedSender<LlmEvent>,
) {
    if api.key.trim().is_empty() {
        let _ = tx.send(LlmEvent::Error(ClientError::MissingApiKey));
        return;
    }

    debug!(
        "chat request: {} messages, {} tools, tool_choice={}, stream={}",
        request.messages.len(),
        request.tools.len(),
        request.tool_choice.as_str(),
        request.stream
    );

    let mut payload = build_payload(&api, &request);
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match send_request(&http, &api, &payload).await {
            Ok(response) => {
                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    let outcome = if request.stream {
                        read_stream(response, &cancel, &tx).await
                    } else {
                        read_body(response, &cancel, &tx).await
                    };
                    if let Err(err) = outcome {
                        let _ = tx.send(LlmEvent::Error(err));
                    }
                    return;
                }

                let body = response.text().await.unwrap_or_default();

                // Some gateways reject stream_options with a 400. Drop the
                // usage hint and retry right away; this does not count as
                // a retry attempt.
                if status == 400 && payload.get("stream_options").is_some() {
                    debug!("provider rejected stream_options, dropping usage reporting");
                    if let Some(map) = payload.as_object_mut() {
                        map.remove("stream_options");
                    }
                    continue;
                }

                let retryable = RETRYABLE_STATUS.contains(&status);
                if retryable && attempt + 1 < MAX_ATTEMPTS {
                    attempt += 1;
                    let delay = backoff_delay(attempt - 1);
                    warn!(
                        "chat request got HTTP {}, retrying ({}/{}) in {:.1}s",
                        status,
                        attempt,
                        MAX_ATTEMPTS,
                        delay.as_secs_f64()
                    );
                    let _ = tx.send(LlmEvent::Retrying {
                        attempt,
                        max_attempts: MAX_ATTEMPTS,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                    continue;
                }

                let detail = status_detail(status, &body);
                let err = if retryable {
                    ClientError::Exhausted {
                        status,
                        detail,
                        attempts: MAX_ATTEMPTS,
                    }
                } else {
                    ClientError::Status { status, detail }
                };
                let _ = tx.send(LlmEvent::Error(err));
                return;
            }
            Err(err) => {
                if attempt + 1 < MAX_ATTEMPTS {
                    attempt += 1;
                    let delay = backoff_delay(attempt - 1);
                    warn!(
                        "chat request failed ({}), retrying ({}/{}) in {:.1}s",
                        err,
                        attempt,
                        MAX_ATTEMPTS,
                        delay.as_secs_f64()
                    );
                    let _ = tx.send(LlmEvent::Retrying {
                        attempt,
                        max_attempts: MAX_ATTEMPTS,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                    continue;
                }
                let _ = tx.send(LlmEvent::Error(ClientError::Network {
                    attempts: MAX_ATTEMPTS,
                    message: err.to_string(),
                }));
                return;
            }
        }
    }
}

async fn send_request(
    http: &Client,
    api: &ApiConfig,
    payload: &Value,
) -> reqwest::Result<reqwest::Response> {
    http.post(format!(
        "{}/chat/completions",
        api.base_url.trim_end_matches('/')
    ))
    .header("Authorization", format!("Bearer {}", api.key.trim()))
    .header("Content-Type", "application/json")
    .json(payload)
    .send()
    .await
}

fn build_payload(api: &ApiConfig, request: &ChatRequest) -> Value {
    let mut payload = json!({
        "model": api.model,
        "messages": request.messages.iter().map(wire_message).collect::<Vec<Value>>(),
        "max_tokens": api.max_tokens,
    });
    if !request.tools.is_empty() {
        payload["tools"] = Value::Array(request.tools.iter().map(wire_tool).collect());
        payload["tool_choice"] = json!(request.tool_choice.as_str());
    }
    if request.stream {
        payload["stream"] = json!(true);
        payload["stream_options"] = json!({ "include_usage": true });
    }
    payload
}

fn wire_tool(schema: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": schema.name,
            "description": schema.description,
            "parameters": schema.parameters,
        }
    })
}

fn wire_message(message: &Message) -> Value {
    let mut wire = json!({
        "role": message.role,
        "content": message.content,
    });
    if let Some(ref calls) = message.tool_calls {
        wire["tool_calls"] = Value::Array(
            calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments },
                    })
                })
                .collect(),
        );
    }
    if let Some(ref id) = message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    if let Some(ref reasoning) = message.reasoning {
        wire["reasoning_content"] = json!(reasoning);
    }
    wire
}

fn backoff_delay(failed_attempts: u32) -> Duration {
    Duration::from_secs_f64(RETRY_BACKOFF_SECS * f64::powi(2.0, failed_attempts as i32))
}

async fn read_stream(
    response: reqwest::Response,
    cancel: &CancelFlag,
    tx: &mpsc::UnboundedSender<LlmEvent>,
) -> Result<(), ClientError> {
    let mut acc = SseAccumulator::default();
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    'read: while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let bytes = chunk.map_err(|e| ClientError::Stream(e.to_string()))?;
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim().to_string();
            buffer.drain(..=pos);

            if cancel.is_cancelled() {
                return Ok(());
            }
            for delta in acc.feed_line(&line) {
                let event = match delta {
                    StreamDelta::Content(text) => LlmEvent::Chunk(text),
                    StreamDelta::Reasoning(text) => LlmEvent::Reasoning(text),
                };
                if tx.send(event).is_err() {
                    return Ok(());
                }
            }
            if acc.is_done() {
                break 'read;
            }
        }
    }

    if cancel.is_cancelled() {
        return Ok(());
    }

    let (usage, terminal) = acc.finish();
    if let Some(usage) = usage {
        let _ = tx.send(LlmEvent::Usage(usage));
    }
    let _ = tx.send(match terminal {
        StreamTerminal::Text(reply) => LlmEvent::Finished(reply),
        StreamTerminal::Calls(batch) => LlmEvent::ToolCalls(batch),
    });
    Ok(())
}

async fn read_body(
    response: reqwest::Response,
    cancel: &CancelFlag,
    tx: &mpsc::UnboundedSender<LlmEvent>,
) -> Result<(), ClientError> {
    let body: Value = response
        .json()
        .await
        .map_err(|e| ClientError::Protocol(format!("invalid response body: {e}")))?;

    if cancel.is_cancelled() {
        return Ok(());
    }

    if let Some(usage) = body.get("usage").filter(|u| !u.is_null())
        && let Ok(usage) = serde_json::from_value::<TokenUsage>(usage.clone())
    {
        let _ = tx.send(LlmEvent::Usage(usage.normalized()));
    }

    let Some(choice) = body.get("choices").and_then(Value::as_array).and_then(|c| c.first()) else {
        return Err(ClientError::Protocol(
            "no choices in provider response".to_string(),
        ));
    };

    let message = &choice["message"];
    let content = message["content"].as_str().unwrap_or("").to_string();
    let reasoning = message["reasoning_content"].as_str().unwrap_or("").to_string();
    let calls = parse_wire_tool_calls(message.get("tool_calls"));

    let event = if calls.is_empty() {
        LlmEvent::Finished(LlmReply { content, reasoning })
    } else {
        LlmEvent::ToolCalls(ToolCallBatch {
            calls,
            content,
            reasoning,
        })
    };
    let _ = tx.send(event);
    Ok(())
}

fn parse_wire_tool_calls(value: Option<&Value>) -> Vec<ToolCallRequest> {
    let Some(list) = value.and_then(Value::as_array) else {
        return Vec::new();
    };
    list.iter()
        .enumerate()
        .filter_map(|(i, tc)| {
            let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
            if name.is_empty() {
                return None;
            }
            let id = match tc["id"].as_str() {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => format!("call_{i}"),
            };
            let arguments = tc["function"]["arguments"].as_str().unwrap_or("{}").to_string();
            Some(ToolCallRequest {
                id,
                name,
                arguments,
            })
        })
        .collect()
}

enum StreamDelta {
    Content(String),
    Reasoning(String),
}

enum StreamTerminal {
    Text(LlmReply),
    Calls(ToolCallBatch),
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates one SSE stream: merges content and reasoning deltas,
/// reassembles tool call fragments by index and captures the usage frame.
#[derive(Default)]
struct SseAccumulator {
    content: String,
    reasoning: String,
    calls: Vec<PartialToolCall>,
    usage: Option<TokenUsage>,
    done: bool,
}

impl SseAccumulator {
    /// Feed one line from the stream. Returns the visible deltas it
    /// produced. Comment lines, heartbeats and malformed frames are
    /// skipped without aborting the stream.
    fn feed_line(&mut self, line: &str) -> Vec<StreamDelta> {
        let mut deltas = Vec::new();
        if line.is_empty() || line.starts_with(':') {
            return deltas;
        }
        let Some(data) = line.strip_prefix("data: ") else {
            return deltas;
        };
        if data == "[DONE]" {
            self.done = true;
            return deltas;
        }
        let Ok(frame) = serde_json::from_str::<Value>(data) else {
            debug!("skipping malformed stream frame");
            return deltas;
        };

        if let Some(usage) = frame.get("usage").filter(|u| !u.is_null())
            && let Ok(usage) = serde_json::from_value::<TokenUsage>(usage.clone())
        {
            self.usage = Some(usage.normalized());
        }

        let Some(delta) = frame
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("delta"))
        else {
            return deltas;
        };

        if let Some(text) = delta["content"].as_str()
            && !text.is_empty()
        {
            self.content.push_str(text);
            deltas.push(StreamDelta::Content(text.to_string()));
        }
        if let Some(text) = delta["reasoning_content"].as_str()
            && !text.is_empty()
        {
            self.reasoning.push_str(text);
            deltas.push(StreamDelta::Reasoning(text.to_string()));
        }
        if let Some(fragments) = delta["tool_calls"].as_array() {
            for fragment in fragments {
                self.merge_tool_call(fragment);
            }
        }
        deltas
    }

    fn merge_tool_call(&mut self, fragment: &Value) {
        let index = fragment["index"].as_u64().unwrap_or(0) as usize;
        while self.calls.len() <= index {
            self.calls.push(PartialToolCall::default());
        }
        let slot = &mut self.calls[index];
        if let Some(id) = fragment["id"].as_str()
            && !id.is_empty()
        {
            slot.id = id.to_string();
        }
        if let Some(function) = fragment.get("function") {
            if let Some(name) = function["name"].as_str() {
                slot.name.push_str(name);
            }
            if let Some(args) = function["arguments"].as_str() {
                slot.arguments.push_str(args);
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn finish(self) -> (Option<TokenUsage>, StreamTerminal) {
        let calls: Vec<ToolCallRequest> = self
            .calls
            .into_iter()
            .enumerate()
            .filter(|(_, c)| !c.name.is_empty())
            .map(|(i, c)| ToolCallRequest {
                id: if c.id.is_empty() {
                    format!("call_{i}")
                } else {
                    c.id
                },
                name: c.name,
                arguments: if c.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    c.arguments
                },
            })
            .collect();

        let terminal = if calls.is_empty() {
            StreamTerminal::Text(LlmReply {
                content: self.content,
                reasoning: self.reasoning,
            })
        } else {
            StreamTerminal::Calls(ToolCallBatch {
                calls,
                content: self.content,
                reasoning: self.reasoning,
            })
        };
        (self.usage, terminal)
    }
}

fn status_hint(status: u16) -> Option<&'static str> {
    match status {
        401 => Some("invalid or expired API key"),
        402 => Some("insufficient account balance"),
        403 => Some("access denied for this API key or model"),
        404 => Some("endpoint or model not found, check api.base_url and api.model"),
        429 => Some("rate limited, try again later"),
        500 => Some("provider internal error"),
        502 => Some("bad gateway, provider temporarily unreachable"),
        503 => Some("provider overloaded or under maintenance"),
        _ => None,
    }
}

fn status_detail(status: u16, body: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(hint) = status_hint(status) {
        parts.push(hint.to_string());
    }
    let provider = provider_error_message(body);
    if !provider.is_empty() {
        parts.push(provider);
    }
    if parts.is_empty() {
        "unexpected provider response".to_string()
    } else {
        parts.join("; ")
    }
}

fn provider_error_message(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return String::new();
    }
    if let Ok(parsed) = serde_json::from_str::<Value>(body)
        && let Some(message) = parsed["error"]["message"]
            .as_str()
            .or_else(|| parsed["message"].as_str())
    {
        return truncate_chars(message, ERROR_DETAIL_MAX_CHARS);
    }
    truncate_chars(body, ERROR_DETAIL_MAX_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut clipped: String = text.chars().take(max).collect();
        clipped.push_str("...");
        clipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(acc: &mut SseAccumulator, lines: &[&str]) -> (String, String) {
        let mut content = String::new();
        let mut reasoning = String::new();
        for line in lines {
            for delta in acc.feed_line(line) {
                match delta {
                    StreamDelta::Content(t) => content.push_str(&t),
                    StreamDelta::Reasoning(t) => reasoning.push_str(&t),
                }
            }
        }
        (content, reasoning)
    }

    #[test]
    fn stream_merges_content_and_reasoning() {
        let mut acc = SseAccumulator::default();
        let (content, reasoning) = feed_all(
            &mut acc,
            &[
                ": keepalive",
                r#"data: {"choices":[{"delta":{"reasoning_content":"thinking"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
                "not an sse line",
                r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
                "data: [DONE]",
            ],
        );
        assert!(acc.is_done());
        assert_eq!(content, "Hello");
        assert_eq!(reasoning, "thinking");

        let (usage, terminal) = acc.finish();
        assert!(usage.is_none());
        match terminal {
            StreamTerminal::Text(reply) => {
                assert_eq!(reply.content, "Hello");
                assert_eq!(reply.reasoning, "thinking");
            }
            StreamTerminal::Calls(_) => panic!("expected text terminal"),
        }
    }

    #[test]
    fn stream_reassembles_fragmented_tool_calls() {
        let mut acc = SseAccumulator::default();
        feed_all(
            &mut acc,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"set_key","arguments":""}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"fra"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_def","function":{"name":"zero_out","arguments":"{}"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"me\": 12}"}}]}}]}"#,
                "data: [DONE]",
            ],
        );

        let (_, terminal) = acc.finish();
        match terminal {
            StreamTerminal::Calls(batch) => {
                assert_eq!(batch.calls.len(), 2);
                assert_eq!(batch.calls[0].id, "call_abc");
                assert_eq!(batch.calls[0].name, "set_key");
                assert_eq!(batch.calls[0].arguments, "{\"frame\": 12}");
                assert_eq!(batch.calls[1].id, "call_def");
                assert_eq!(batch.calls[1].name, "zero_out");
            }
            StreamTerminal::Text(_) => panic!("expected tool call terminal"),
        }
    }

    #[test]
    fn stream_captures_usage_frame() {
        let mut acc = SseAccumulator::default();
        feed_all(
            &mut acc,
            &[
                r#"data: {"choices":[{"delta":{"content":"ok"}}]}"#,
                r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
                "data: [DONE]",
            ],
        );
        let (usage, _) = acc.finish();
        let usage = usage.expect("usage captured");
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn empty_tool_names_fall_back_to_text() {
        let mut acc = SseAccumulator::default();
        feed_all(
            &mut acc,
            &[
                r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"x","function":{"arguments":"{}"}}]}}]}"#,
            ],
        );
        let (_, terminal) = acc.finish();
        assert!(matches!(terminal, StreamTerminal::Text(_)));
    }

    #[test]
    fn wire_message_expands_tool_calls() {
        let message = Message::assistant_tool_calls(
            None,
            vec![ToolCallRequest {
                id: "call_1".to_string(),
                name: "get_scene_info".to_string(),
                arguments: "{}".to_string(),
            }],
        );
        let wire = wire_message(&message);
        assert_eq!(wire["role"], "assistant");
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["id"], "call_1");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "get_scene_info");

        let tool = Message::tool("call_1", r#"{"success":true,"message":"done"}"#);
        let wire = wire_message(&tool);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_1");
    }

    #[test]
    fn wire_message_keeps_image_parts() {
        let message = Message {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "look at this".to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageRef {
                        url: "data:image/png;base64,AAAA".to_string(),
                        detail: Some("high".to_string()),
                    },
                },
            ])),
            tool_calls: None,
            tool_call_id: None,
            reasoning: None,
        };
        let wire = wire_message(&message);
        assert_eq!(wire["content"][0]["type"], "text");
        assert_eq!(wire["content"][1]["type"], "image_url");
        assert_eq!(wire["content"][1]["image_url"]["detail"], "high");
    }

    #[test]
    fn wire_message_echoes_reasoning() {
        let plain = wire_message(&Message::assistant("done"));
        assert!(plain.get("reasoning_content").is_none());

        let traced = wire_message(&Message::assistant("done").with_reasoning("let me think"));
        assert_eq!(traced["reasoning_content"], "let me think");
        assert_eq!(traced["content"], "done");

        // An empty trace is not worth carrying.
        let empty = Message::assistant("done").with_reasoning("");
        assert_eq!(empty.reasoning, None);
    }

    #[test]
    fn payload_omits_tools_when_empty() {
        let api = ApiConfig::default();
        let request = ChatRequest {
            messages: vec![Message::user("hi")],
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            stream: false,
        };
        let payload = build_payload(&api, &request);
        assert!(payload.get("tools").is_none());
        assert!(payload.get("tool_choice").is_none());
        assert!(payload.get("stream").is_none());
    }

    #[test]
    fn payload_carries_stream_options_and_tool_choice() {
        let api = ApiConfig::default();
        let request = ChatRequest {
            messages: vec![Message::user("hi")],
            tools: vec![ToolSchema {
                name: "zero_out_transforms".to_string(),
                description: "zero".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            }],
            tool_choice: ToolChoice::None,
            stream: true,
        };
        let payload = build_payload(&api, &request);
        assert_eq!(payload["tool_choice"], "none");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["stream_options"]["include_usage"], true);
        assert_eq!(payload["tools"][0]["type"], "function");
    }

    #[test]
    fn provider_error_details_are_extracted_and_clipped() {
        let detail = status_detail(429, r#"{"error":{"message":"slow down"}}"#);
        assert!(detail.contains("rate limited"));
        assert!(detail.contains("slow down"));

        let long_body = "x".repeat(900);
        let detail = status_detail(418, &long_body);
        assert!(detail.chars().count() <= ERROR_DETAIL_MAX_CHARS + 3);
        assert!(detail.ends_with("..."));
    }

    #[test]
    fn usage_total_is_backfilled() {
        let usage = TokenUsage {
            prompt_tokens: 7,
            completion_tokens: 3,
            total_tokens: 0,
        }
        .normalized();
        assert_eq!(usage.total_tokens, 10);

        let usage = TokenUsage {
            prompt_tokens: 7,
            completion_tokens: 3,
            total_tokens: 99,
        }
        .normalized();
        assert_eq!(usage.total_tokens, 99);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1500));
        assert_eq!(backoff_delay(1), Duration::from_millis(3000));
        assert_eq!(backoff_delay(2), Duration::from_millis(6000));
    }

    #[test]
    fn message_content_text_reads_parts() {
        let plain = Message::user("hello");
        assert_eq!(plain.content_text(), "hello");

        let parts = Message {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "caption".to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageRef {
                        url: "data:image/png;base64,AAAA".to_string(),
                        detail: None,
                    },
                },
            ])),
            tool_calls: None,
            tool_call_id: None,
            reasoning: None,
        };
        assert_eq!(parts.content_text(), "caption");
    }
}
