//! Provider adapters: translate the engine's delta vocabulary to/from a
//! specific LLM wire protocol.
//!
//! The trait shape (`async_trait` + a boxed `Stream` of fallible events)
//! mirrors an `LlmProvider::chat_stream`-style adapter trait; the SSE
//! buffering primitive below is a `drain_data_lines`/`sse_response_stream`
//! style helper widened to this engine's richer delta set. The OpenAI-
//! compatible adapter mirrors a standard chat-completions request shape;
//! the retry/backoff module implements full-jitter exponential backoff with
//! `Retry-After` honored.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use serde_json::Value;

use sa_domain::error::{Error, Result};

use crate::cancel::CancelToken;
use crate::message::{Message, Part, Role};
use crate::tool_registry::ToolDescriptor;

pub type BoxDeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

/// One increment of a provider's response, per spec §4.F.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Start,
    StepStart,
    TextDelta(String),
    ReasoningDelta(String),
    ToolCall { call_id: String, tool_name: String },
    ToolCallArgsDelta { call_id: String, delta: String },
    ToolCallEnd { call_id: String },
    ToolResult { call_id: String, result: String, is_error: bool },
    StepFinish { usage: StepUsage },
    Finish { reason: FinishKind, usage: StepUsage },
    Error(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StepUsage {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cached: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishKind {
    EndTurn,
    MaxTokens,
    ToolUse,
}

/// Sampling/iteration controls for one `stream` call. Temperature is fixed at
/// 0 for determinism per spec; only `max_steps` and the cancellation handle
/// vary per call.
pub struct StreamControls {
    pub max_steps: u32,
    pub cancel: CancelToken,
}

impl Default for StreamControls {
    fn default() -> Self {
        Self {
            max_steps: 1000,
            cancel: CancelToken::new(),
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn stream(
        &self,
        history: &[Message],
        tools: &[ToolDescriptor],
        controls: &StreamControls,
    ) -> Result<BoxDeltaStream>;

    fn provider_id(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE buffering primitive, shared by every HTTP-based adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract complete `data:` payloads from an SSE buffer, draining consumed
/// bytes in place and leaving a trailing partial event for the next call.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);
        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    lines.push(data.to_string());
                }
            }
        }
    }
    lines
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry policy: HTTP 429/5xx, full jitter, base 2s, doubling, max 6 tries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MAX_ATTEMPTS: u32 = 6;
const BASE_DELAY: Duration = Duration::from_secs(2);

/// Outcome of a single attempt, used to decide whether `retry_with_backoff`
/// should try again.
pub enum Attempt<T> {
    Done(T),
    Retry { retry_after: Option<Duration> },
    Fatal(Error),
}

/// Retries `f` up to [`MAX_ATTEMPTS`] times with full-jitter exponential
/// backoff (`rand::thread_rng` draws uniformly in `[0, base * 2^n)`),
/// honoring a server-supplied `Retry-After` when present. Cancellation
/// collapses any in-flight wait.
pub async fn retry_with_backoff<F, Fut, T>(cancel: &CancelToken, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Attempt<T>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        match f().await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fatal(err) => return Err(err),
            Attempt::Retry { retry_after } => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(Error::ProviderTransient(format!(
                        "exhausted {MAX_ATTEMPTS} retry attempts"
                    )));
                }
                let delay = retry_after.unwrap_or_else(|| jittered_delay(attempt));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(Error::Canceled),
                }
            }
        }
    }
}

fn jittered_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let max = BASE_DELAY.as_millis() as u64 * 2u64.pow(attempt.min(20));
    let jittered = rand::thread_rng().gen_range(0..=max.max(1));
    Duration::from_millis(jittered)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire-format translation shared by HTTP adapters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Flatten the engine's `Message`/`Part` model into OpenAI-compatible chat
/// messages: text/reasoning parts concatenate into `content`, tool-invocation
/// parts in `call` state become `tool_calls`, and `result` state parts become
/// their own `tool` role messages.
fn to_openai_messages(history: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    for message in history {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for part in &message.parts {
            match part {
                Part::Text { text } | Part::Reasoning { text } => content.push_str(text),
                Part::ToolInvocation(ti) => {
                    if ti.state == crate::message::ToolInvocationState::Call {
                        tool_calls.push(serde_json::json!({
                            "id": ti.tool_call_id,
                            "type": "function",
                            "function": { "name": ti.tool_name, "arguments": ti.args.to_string() },
                        }));
                    } else if let Some(result) = &ti.result {
                        out.push(serde_json::json!({
                            "role": "tool",
                            "tool_call_id": ti.tool_call_id,
                            "content": result,
                        }));
                    }
                }
                _ => {}
            }
        }
        let mut entry = serde_json::json!({ "role": role_str(message.role), "content": content });
        if !tool_calls.is_empty() {
            entry["tool_calls"] = Value::Array(tool_calls);
        }
        out.push(entry);
    }
    out
}

fn to_openai_tools(tools: &[ToolDescriptor]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": { "name": t.name, "description": t.description, "parameters": t.parameters },
            })
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// OpenAI-compatible adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    provider_id: String,
}

impl OpenAiCompatAdapter {
    pub fn new(provider_id: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            provider_id: provider_id.into(),
        }
    }

    async fn open_stream(&self, body: &Value) -> Attempt<reqwest::Response> {
        let result = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => Attempt::Done(resp),
            Ok(resp) if resp.status() == 429 || resp.status().is_server_error() => {
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                Attempt::Retry { retry_after }
            }
            Ok(resp) => Attempt::Fatal(Error::ProviderFatal(format!(
                "provider returned {}",
                resp.status()
            ))),
            Err(e) => {
                tracing::warn!(error = %e, "provider request failed, will retry");
                Attempt::Retry { retry_after: None }
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    async fn stream(
        &self,
        history: &[Message],
        tools: &[ToolDescriptor],
        controls: &StreamControls,
    ) -> Result<BoxDeltaStream> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": to_openai_messages(history),
            "tools": to_openai_tools(tools),
            "temperature": 0.0,
            "stream": true,
        });

        let response = retry_with_backoff(&controls.cancel, || self.open_stream(&body)).await?;
        Ok(Box::pin(openai_sse_stream(response)))
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }
}

fn openai_sse_stream(response: reqwest::Response) -> impl Stream<Item = Result<StreamDelta>> {
    async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut call_id_by_index: std::collections::HashMap<u64, String> = std::collections::HashMap::new();
        yield Ok(StreamDelta::Start);

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_data_lines(&mut buffer) {
                        if data == "[DONE]" {
                            yield Ok(StreamDelta::Finish { reason: FinishKind::EndTurn, usage: StepUsage::default() });
                            return;
                        }
                        for delta in parse_openai_chunk(&data, &mut call_id_by_index) {
                            yield delta;
                        }
                    }
                }
                Ok(None) => {
                    yield Ok(StreamDelta::Finish { reason: FinishKind::EndTurn, usage: StepUsage::default() });
                    return;
                }
                Err(e) => {
                    yield Ok(StreamDelta::Error(e.to_string()));
                    return;
                }
            }
        }
    }
}

fn parse_openai_chunk(
    data: &str,
    call_id_by_index: &mut std::collections::HashMap<u64, String>,
) -> Vec<Result<StreamDelta>> {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Ok(StreamDelta::Error(format!("malformed chunk: {e}")))],
    };
    let mut out = Vec::new();
    let Some(choice) = value["choices"].get(0) else { return out };
    let delta = &choice["delta"];

    if let Some(text) = delta.get("content").and_then(Value::as_str) {
        out.push(Ok(StreamDelta::TextDelta(text.to_string())));
    }
    if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            if let Some(id) = call.get("id").and_then(Value::as_str) {
                call_id_by_index.insert(index, id.to_string());
                let name = call["function"]["name"].as_str().unwrap_or_default().to_string();
                out.push(Ok(StreamDelta::ToolCall { call_id: id.to_string(), tool_name: name }));
            }
            if let Some(args) = call["function"].get("arguments").and_then(Value::as_str) {
                if let Some(id) = call_id_by_index.get(&index) {
                    out.push(Ok(StreamDelta::ToolCallArgsDelta {
                        call_id: id.clone(),
                        delta: args.to_string(),
                    }));
                }
            }
        }
    }
    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        let kind = match reason {
            "tool_calls" => FinishKind::ToolUse,
            "length" => FinishKind::MaxTokens,
            _ => FinishKind::EndTurn,
        };
        out.push(Ok(StreamDelta::StepFinish { usage: StepUsage::default() }));
        out.push(Ok(StreamDelta::Finish { reason: kind, usage: StepUsage::default() }));
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deterministic mock adapter, used by tests and scenario replay
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fixed sequence of deltas a `MockAdapter` replays verbatim, for
/// scripting tool-call scenarios in tests.
pub type Script = Vec<StreamDelta>;

pub enum MockBehavior {
    /// Uppercase the latest user message's text.
    UppercaseEcho,
    /// Replay a fixed delta sequence.
    Scripted(Script),
}

pub struct MockAdapter {
    provider_id: String,
    behavior: MockBehavior,
}

impl MockAdapter {
    pub fn new(provider_id: impl Into<String>, behavior: MockBehavior) -> Self {
        Self {
            provider_id: provider_id.into(),
            behavior,
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    async fn stream(
        &self,
        history: &[Message],
        _tools: &[ToolDescriptor],
        _controls: &StreamControls,
    ) -> Result<BoxDeltaStream> {
        let deltas: Vec<StreamDelta> = match &self.behavior {
            MockBehavior::Scripted(script) => script.clone(),
            MockBehavior::UppercaseEcho => {
                let latest_user_text = history
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .and_then(|m| m.parts.iter().find_map(|p| p.text()))
                    .unwrap_or_default()
                    .to_uppercase();
                vec![
                    StreamDelta::Start,
                    StreamDelta::StepStart,
                    StreamDelta::TextDelta(latest_user_text),
                    StreamDelta::StepFinish { usage: StepUsage::default() },
                    StreamDelta::Finish { reason: FinishKind::EndTurn, usage: StepUsage::default() },
                ]
            }
        };
        let stream = async_stream::stream! {
            for delta in deltas {
                yield Ok(delta);
            }
        };
        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn drain_data_lines_extracts_complete_events() {
        let mut buf = String::from("data: hello\n\ndata: world\n\n");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["hello", "world"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_data_lines_keeps_partial_event_buffered() {
        let mut buf = String::from("data: complete\n\ndata: partial");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["complete"]);
        assert_eq!(buf, "data: partial");
    }

    #[tokio::test]
    async fn mock_adapter_uppercases_latest_user_text() {
        let adapter = MockAdapter::new("mock", MockBehavior::UppercaseEcho);
        let history = vec![Message::new(
            "msg_1".into(),
            "ses_1".into(),
            Role::User,
            vec![Part::Text { text: "hello".into() }],
        )];
        let controls = StreamControls::default();
        let mut stream = adapter.stream(&history, &[], &controls).await.unwrap();
        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            if let Ok(StreamDelta::TextDelta(t)) = delta {
                text.push_str(&t);
            }
        }
        assert_eq!(text, "HELLO");
    }

    #[tokio::test]
    async fn mock_adapter_replays_scripted_sequence() {
        let script = vec![
            StreamDelta::Start,
            StreamDelta::ToolCall { call_id: "tc_1".into(), tool_name: "read".into() },
            StreamDelta::ToolCallEnd { call_id: "tc_1".into() },
            StreamDelta::Finish { reason: FinishKind::ToolUse, usage: StepUsage::default() },
        ];
        let adapter = MockAdapter::new("mock", MockBehavior::Scripted(script));
        let controls = StreamControls::default();
        let mut stream = adapter.stream(&[], &[], &controls).await.unwrap();
        let mut count = 0;
        while stream.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn retry_with_backoff_gives_up_after_max_attempts() {
        let cancel = CancelToken::new();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&cancel, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Attempt::<()>::Retry { retry_after: Some(Duration::from_millis(1)) } }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn retry_with_backoff_returns_on_first_success() {
        let cancel = CancelToken::new();
        let result = retry_with_backoff(&cancel, || async { Attempt::Done(42) }).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn retry_with_backoff_propagates_fatal_immediately() {
        let cancel = CancelToken::new();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&cancel, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Attempt::Fatal(Error::ProviderFatal("bad request".into())) }
        })
        .await;
        assert!(matches!(result, Err(Error::ProviderFatal(_))));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
