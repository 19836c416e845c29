//! The chat-turn orchestrator — the centerpiece that drives a conversation
//! from a user message through provider streaming, tool dispatch, and
//! finalization.
//!
//! One provider call per turn, iterating its event stream and dispatching
//! tool calls inline while accumulating into a running `Message`/`Part`
//! state machine. Session admission uses
//! [`crate::cancel::PendingTurnTable`], which returns `busy` immediately for
//! a session with a turn already in flight rather than queuing behind a
//! lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde_json::Value;

use sa_domain::error::{Error, Result};

use crate::cancel::{CancelToken, PendingTurnTable};
use crate::event_bus::{BusEvent, EventBus};
use crate::identifier::{Direction, Identifier, Kind};
use crate::message::{
    AssistantMeta, FinishReason, Message, Part, Role, TokenUsage,
};
use crate::provider::{FinishKind, ProviderAdapter, StreamControls, StreamDelta};
use crate::session_store::SessionStore;
use crate::tool_registry::ToolRegistry;

/// A named bundle of (optional provider/model override, optional system
/// prompt, subset of enabled tool names). Resolved once at turn start.
#[derive(Debug, Clone, Default)]
pub struct Mode {
    pub name: String,
    pub provider_override: Option<String>,
    pub model_override: Option<String>,
    pub system_prompt: Option<String>,
    pub tool_names: Option<Vec<String>>,
}

/// Text delta is persisted at most this often during streaming, so a chatty
/// provider doesn't turn every token into a storage write.
const PERSIST_INTERVAL: Duration = Duration::from_millis(100);
const PERSIST_CHAR_THRESHOLD: usize = 40;

pub struct SessionEngine {
    store: Arc<SessionStore>,
    tools: Arc<ToolRegistry>,
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    events: Arc<EventBus>,
    ids: Arc<Identifier>,
    pending: Arc<PendingTurnTable>,
    auto_share: bool,
}

impl SessionEngine {
    pub fn new(
        store: Arc<SessionStore>,
        tools: Arc<ToolRegistry>,
        providers: HashMap<String, Arc<dyn ProviderAdapter>>,
        events: Arc<EventBus>,
        ids: Arc<Identifier>,
        pending: Arc<PendingTurnTable>,
        auto_share: bool,
    ) -> Self {
        Self {
            store,
            tools,
            providers,
            events,
            ids,
            pending,
            auto_share,
        }
    }

    pub async fn create_session(&self, title: Option<String>) -> Result<crate::message::SessionInfo> {
        let info = self.store.create(title).await?;
        if self.auto_share {
            return self.store.share(&info.id).await;
        }
        Ok(info)
    }

    pub fn abort(&self, session_id: &str) -> bool {
        self.pending.cancel(session_id)
    }

    /// Remove a session and prune its File-Time Guard entries so per-session
    /// read-tracking state doesn't accumulate for the lifetime of the
    /// process.
    pub async fn remove_session(&self, session_id: &str) -> Result<bool> {
        let removed = self.store.remove(session_id).await?;
        self.tools.forget_session(session_id);
        Ok(removed)
    }

    /// Run one full chat turn to completion (or until cancelled/errored).
    /// Per spec §4.H this is the entry point that drives the whole state
    /// machine; callers observe progress via the event bus, not the return
    /// value.
    pub async fn chat(
        self: &Arc<Self>,
        session_id: &str,
        provider_id: &str,
        model_id: &str,
        parts: Vec<Part>,
        mode: Option<Mode>,
    ) -> Result<()> {
        // 1. Admission.
        let cancel = self
            .pending
            .admit(session_id)
            .ok_or_else(|| Error::Busy(session_id.to_string()))?;

        let result = self
            .run_turn(session_id, provider_id, model_id, parts, mode, cancel)
            .await;
        self.pending.finish(session_id);
        result
    }

    async fn run_turn(
        self: &Arc<Self>,
        session_id: &str,
        provider_id: &str,
        model_id: &str,
        parts: Vec<Part>,
        mode: Option<Mode>,
        cancel: CancelToken,
    ) -> Result<()> {
        let provider = self
            .providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| Error::SchemaError(format!("unknown provider: {provider_id}")))?;

        // 2. Bootstrap: synthesize the system message on the very first turn
        // and kick off title generation in the background.
        if !self.store.has_messages(session_id) {
            let system_id = self.ids.next(Kind::Message, Direction::Ascending);
            let prompt = mode
                .as_ref()
                .and_then(|m| m.system_prompt.clone())
                .unwrap_or_else(default_system_prompt);
            let system_message = Message::new(
                system_id,
                session_id.to_string(),
                Role::System,
                vec![Part::Text { text: prompt }],
            );
            self.store.append_message(session_id, system_message).await?;

            let engine = self.clone();
            let session_id_owned = session_id.to_string();
            let provider_id_owned = provider_id.to_string();
            let model_id_owned = model_id.to_string();
            tokio::spawn(async move {
                engine
                    .generate_title(&session_id_owned, &provider_id_owned, &model_id_owned)
                    .await;
            });
        }

        // 3. User append.
        let user_id = self.ids.next(Kind::Message, Direction::Ascending);
        let user_message = Message::new(user_id, session_id.to_string(), Role::User, parts);
        self.store.append_message(session_id, user_message).await?;

        // 4. Assistant skeleton.
        let assistant_id = self.ids.next(Kind::Message, Direction::Ascending);
        let mut assistant = Message::new(assistant_id.clone(), session_id.to_string(), Role::Assistant, vec![]);
        assistant.assistant_meta = Some(AssistantMeta {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            ..Default::default()
        });
        self.store.append_message(session_id, assistant.clone()).await?;

        let tool_names = mode.as_ref().and_then(|m| m.tool_names.clone());
        let tool_descriptors = self.tools.descriptors(tool_names.as_deref());

        let outcome = self
            .stream_and_dispatch(session_id, &provider, &mut assistant, &tool_descriptors, &cancel)
            .await;

        let finish_reason = match outcome {
            Ok(reason) => reason,
            Err(Error::Canceled) => FinishReason::Canceled,
            Err(_) => FinishReason::Error,
        };

        // 6. Finalize.
        assistant.finalize(finish_reason);
        self.store.save_message(session_id, &assistant, true).await?;
        self.store.publish_idle(session_id);

        if let Err(e) = outcome {
            if !matches!(e, Error::Canceled) {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn stream_and_dispatch(
        &self,
        session_id: &str,
        provider: &Arc<dyn ProviderAdapter>,
        assistant: &mut Message,
        tool_descriptors: &[crate::tool_registry::ToolDescriptor],
        cancel: &CancelToken,
    ) -> Result<FinishReason> {
        let history = self.store.get_messages(session_id)?;
        let controls = StreamControls {
            max_steps: 1000,
            cancel: cancel.clone(),
        };
        let mut stream = provider.stream(&history, tool_descriptors, &controls).await?;

        // call_id -> buffered raw JSON-arg text, assembled across
        // tool-call-args-delta increments before the call ends.
        let mut arg_buffers: HashMap<String, String> = HashMap::new();
        let mut last_persist = Instant::now();
        let mut chars_since_persist = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Ok(FinishReason::Canceled);
            }
            let Some(delta) = stream.next().await else {
                return Ok(FinishReason::EndTurn);
            };
            let delta = delta?;

            match delta {
                StreamDelta::Start => {}
                StreamDelta::StepStart => {
                    assistant.start_step();
                    self.maybe_persist(session_id, assistant, &mut last_persist, &mut chars_since_persist, true)
                        .await?;
                }
                StreamDelta::TextDelta(text) => {
                    chars_since_persist += text.len();
                    assistant.append_text_delta(&text, false);
                    self.maybe_persist(session_id, assistant, &mut last_persist, &mut chars_since_persist, false)
                        .await?;
                }
                StreamDelta::ReasoningDelta(text) => {
                    chars_since_persist += text.len();
                    assistant.append_text_delta(&text, true);
                    self.maybe_persist(session_id, assistant, &mut last_persist, &mut chars_since_persist, false)
                        .await?;
                }
                StreamDelta::ToolCall { call_id, tool_name } => {
                    assistant.append_tool_call(call_id.clone(), tool_name, Value::Null);
                    arg_buffers.insert(call_id, String::new());
                    self.store.save_message(session_id, assistant, false).await?;
                }
                StreamDelta::ToolCallArgsDelta { call_id, delta } => {
                    arg_buffers.entry(call_id).or_default().push_str(&delta);
                }
                StreamDelta::ToolCallEnd { call_id } => {
                    let raw_args = arg_buffers.remove(&call_id).unwrap_or_default();
                    let args: Value = if raw_args.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&raw_args).unwrap_or(Value::Null)
                    };
                    let tool_name = assistant
                        .parts
                        .iter()
                        .rev()
                        .find_map(|p| match p {
                            Part::ToolInvocation(ti) if ti.tool_call_id == call_id => {
                                Some(ti.tool_name.clone())
                            }
                            _ => None,
                        })
                        .unwrap_or_default();
                    if let Some(Part::ToolInvocation(ti)) = assistant
                        .parts
                        .iter_mut()
                        .rev()
                        .find(|p| matches!(p, Part::ToolInvocation(ti) if ti.tool_call_id == call_id))
                    {
                        ti.args = args.clone();
                    }

                    match self.tools.invoke(session_id, &tool_name, &args, cancel).await {
                        Ok((output, is_error)) => {
                            assistant.attach_tool_result(&call_id, output, is_error);
                            if let Some(meta) = assistant.assistant_meta.as_mut() {
                                meta.tool.insert(
                                    call_id.clone(),
                                    serde_json::json!({ "name": tool_name, "isError": is_error }),
                                );
                            }
                            self.store.save_message(session_id, assistant, false).await?;
                        }
                        Err(Error::Canceled) => return Ok(FinishReason::Canceled),
                        Err(e) => {
                            assistant.attach_tool_result(&call_id, e.to_string(), true);
                            self.store.save_message(session_id, assistant, false).await?;
                            return Ok(FinishReason::Error);
                        }
                    }
                }
                StreamDelta::ToolResult { call_id, result, is_error } => {
                    assistant.attach_tool_result(&call_id, result, is_error);
                    self.store.save_message(session_id, assistant, false).await?;
                }
                StreamDelta::StepFinish { usage } => {
                    assistant.finish_step();
                    assistant.record_usage(to_token_usage(usage), 0.0);
                    self.store.save_message(session_id, assistant, false).await?;
                }
                StreamDelta::Finish { reason, usage } => {
                    assistant.record_usage(to_token_usage(usage), 0.0);
                    return Ok(match reason {
                        FinishKind::EndTurn => FinishReason::EndTurn,
                        FinishKind::MaxTokens => FinishReason::MaxTokens,
                        FinishKind::ToolUse => FinishReason::ToolUse,
                    });
                }
                StreamDelta::Error(message) => {
                    if let Some(meta) = assistant.assistant_meta.as_mut() {
                        meta.error = Some(message);
                    }
                    return Ok(FinishReason::Error);
                }
            }
        }
    }

    async fn maybe_persist(
        &self,
        session_id: &str,
        assistant: &Message,
        last_persist: &mut Instant,
        chars_since_persist: &mut usize,
        force: bool,
    ) -> Result<()> {
        if force || last_persist.elapsed() >= PERSIST_INTERVAL || *chars_since_persist >= PERSIST_CHAR_THRESHOLD {
            self.store.save_message(session_id, assistant, false).await?;
            *last_persist = Instant::now();
            *chars_since_persist = 0;
        }
        Ok(())
    }

    /// Fire-and-forget title generation: a single short-lived provider call,
    /// whose only effect is `SessionStore::set_title` on success. Failures
    /// are logged and never retried (spec §4.H "Title generation").
    async fn generate_title(self: Arc<Self>, session_id: &str, provider_id: &str, _model_id: &str) {
        let Some(provider) = self.providers.get(provider_id).cloned() else {
            return;
        };
        let history = match self.store.get_messages(session_id) {
            Ok(h) => h,
            Err(_) => return,
        };
        let prompt_id = self.ids.next(Kind::Message, Direction::Ascending);
        let mut prompt_history = history;
        prompt_history.push(Message::new(
            prompt_id,
            session_id.to_string(),
            Role::User,
            vec![Part::Text {
                text: "Summarize this conversation so far in under six words, as a title.".into(),
            }],
        ));

        let controls = StreamControls { max_steps: 1, cancel: CancelToken::new() };
        let mut stream = match provider.stream(&prompt_history, &[], &controls).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "title generation failed to start");
                return;
            }
        };

        let mut title = String::new();
        while let Some(delta) = stream.next().await {
            match delta {
                Ok(StreamDelta::TextDelta(text)) => title.push_str(&text),
                Ok(StreamDelta::Finish { .. }) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "title generation stream failed");
                    return;
                }
            }
        }

        let title = title.trim();
        if title.is_empty() {
            return;
        }
        if let Err(e) = self.store.set_title(session_id, title.to_string()).await {
            tracing::warn!(session_id, error = %e, "failed to persist generated title");
        }
    }
}

fn default_system_prompt() -> String {
    "You are a helpful coding assistant with access to workspace tools.".to_string()
}

fn to_token_usage(usage: crate::provider::StepUsage) -> TokenUsage {
    TokenUsage {
        input: usage.input,
        output: usage.output,
        reasoning: usage.reasoning,
        cached: usage.cached,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_time_guard::FileTimeGuard;
    use crate::permission_gate::PermissionGate;
    use crate::provider::{MockAdapter, MockBehavior, StepUsage};
    use crate::storage::FsStorage;

    fn build_engine(dir: &std::path::Path, provider: Arc<dyn ProviderAdapter>) -> Arc<SessionEngine> {
        let events = Arc::new(EventBus::new(128));
        let ids = Arc::new(Identifier::new());
        let storage: Arc<dyn crate::storage::Storage> = Arc::new(FsStorage::new(dir, events.clone()));
        let store = Arc::new(SessionStore::new(storage, events.clone(), ids.clone()));
        let gate = Arc::new(PermissionGate::new(events.clone()));
        let tools = Arc::new(ToolRegistry::new(
            dir.to_path_buf(),
            Arc::new(FileTimeGuard::new()),
            gate,
            ids.clone(),
        ));
        let mut providers: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        providers.insert(provider.provider_id().to_string(), provider);
        Arc::new(SessionEngine::new(
            store,
            tools,
            providers,
            events,
            ids,
            Arc::new(PendingTurnTable::new()),
            false,
        ))
    }

    #[tokio::test]
    async fn simple_turn_produces_final_assistant_message() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn ProviderAdapter> =
            Arc::new(MockAdapter::new("mock", MockBehavior::UppercaseEcho));
        let engine = build_engine(dir.path(), provider);
        let info = engine.create_session(None).await.unwrap();

        engine
            .chat(
                &info.id,
                "mock",
                "mock-model",
                vec![Part::Text { text: "hello".into() }],
                None,
            )
            .await
            .unwrap();

        let messages = engine.store.get_messages(&info.id).unwrap();
        let assistant = messages.iter().find(|m| m.role == Role::Assistant).unwrap();
        assert_eq!(assistant.parts.iter().find_map(|p| p.text()), Some("HELLO"));
        assert_eq!(assistant.finish_reason, Some(FinishReason::EndTurn));
    }

    #[tokio::test]
    async fn second_concurrent_turn_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let script = vec![
            StreamDelta::Start,
            StreamDelta::StepStart,
            StreamDelta::TextDelta("slow".into()),
        ];
        let provider: Arc<dyn ProviderAdapter> =
            Arc::new(MockAdapter::new("mock", MockBehavior::Scripted(script)));
        let engine = build_engine(dir.path(), provider);
        let info = engine.create_session(None).await.unwrap();

        let pending = engine.pending.admit(&info.id);
        assert!(pending.is_some());

        let err = engine
            .chat(&info.id, "mock", "m", vec![Part::Text { text: "hi".into() }], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
    }

    #[tokio::test]
    async fn tool_call_round_trip_executes_and_attaches_result() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "contents").unwrap();
        let script = vec![
            StreamDelta::Start,
            StreamDelta::ToolCall { call_id: "tc_1".into(), tool_name: "read".into() },
            StreamDelta::ToolCallArgsDelta { call_id: "tc_1".into(), delta: "{\"path\":\"a.txt\"}".into() },
            StreamDelta::ToolCallEnd { call_id: "tc_1".into() },
            StreamDelta::Finish { reason: FinishKind::ToolUse, usage: StepUsage::default() },
        ];
        let provider: Arc<dyn ProviderAdapter> =
            Arc::new(MockAdapter::new("mock", MockBehavior::Scripted(script)));
        let engine = build_engine(dir.path(), provider);
        let info = engine.create_session(None).await.unwrap();

        engine
            .chat(&info.id, "mock", "m", vec![Part::Text { text: "read a.txt".into() }], None)
            .await
            .unwrap();

        let messages = engine.store.get_messages(&info.id).unwrap();
        let assistant = messages.iter().find(|m| m.role == Role::Assistant).unwrap();
        let ti = assistant
            .parts
            .iter()
            .find_map(|p| p.tool_invocation())
            .expect("tool invocation part");
        assert_eq!(ti.result.as_deref(), Some("contents"));
        assert!(!ti.is_error);
        assert_eq!(assistant.finish_reason, Some(FinishReason::ToolUse));
    }

    #[tokio::test]
    async fn unknown_provider_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn ProviderAdapter> =
            Arc::new(MockAdapter::new("mock", MockBehavior::UppercaseEcho));
        let engine = build_engine(dir.path(), provider);
        let info = engine.create_session(None).await.unwrap();

        let err = engine
            .chat(&info.id, "nonexistent", "m", vec![Part::Text { text: "hi".into() }], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SchemaError(_)));
    }

    #[tokio::test]
    async fn remove_session_prunes_the_file_time_guard() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "v1").unwrap();
        let provider: Arc<dyn ProviderAdapter> =
            Arc::new(MockAdapter::new("mock", MockBehavior::UppercaseEcho));
        let engine = build_engine(dir.path(), provider);
        let cancel = CancelToken::new();

        engine
            .tools
            .invoke("ses_x", "read", &serde_json::json!({"path": "a.txt"}), &cancel)
            .await
            .unwrap();
        let (_, is_error) = engine
            .tools
            .invoke(
                "ses_x",
                "edit",
                &serde_json::json!({"path": "a.txt", "oldText": "v1", "newText": "v2"}),
                &cancel,
            )
            .await
            .unwrap();
        assert!(!is_error, "edit should succeed right after a read");

        engine.remove_session("ses_x").await.unwrap();

        let (out, is_error) = engine
            .tools
            .invoke(
                "ses_x",
                "edit",
                &serde_json::json!({"path": "a.txt", "oldText": "v2", "newText": "v3"}),
                &cancel,
            )
            .await
            .unwrap();
        assert!(is_error, "removal should have forgotten ses_x's prior read");
        assert!(out.contains("not read"));
    }

    #[tokio::test]
    async fn first_turn_bootstraps_a_system_message() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn ProviderAdapter> =
            Arc::new(MockAdapter::new("mock", MockBehavior::UppercaseEcho));
        let engine = build_engine(dir.path(), provider);
        let info = engine.create_session(None).await.unwrap();

        engine
            .chat(&info.id, "mock", "m", vec![Part::Text { text: "hi".into() }], None)
            .await
            .unwrap();

        let messages = engine.store.get_messages(&info.id).unwrap();
        assert_eq!(messages[0].role, Role::System);
    }
}
