//! The typed conversation model: sessions, messages, and the tagged `Part`
//! sum type every message body is built from.
//!
//! Tagging follows a `#[serde(tag = "type")]`-per-variant convention,
//! generalized to the richer part/finish-reason vocabulary this engine
//! needs. Parts serialize as an unconditional `{type, data}` envelope with
//! an opaque fallback, so an unrecognized part type round-trips instead of
//! failing to deserialize.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::{Error as DeError, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolInvocationState {
    Call,
    Result,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    pub state: ToolInvocationState,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub path: String,
    pub mime: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bytes: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
}

/// One atomic unit of a message's content.
///
/// Serializes as `{"type": "<tag>", "data": <payload>}` unconditionally.
/// Reading back a `type` this build doesn't recognize yields [`Part::Opaque`]
/// instead of an error, so older/newer processes can share a session store.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text { text: String },
    Reasoning { text: String },
    StepStart,
    StepFinish,
    ToolInvocation(ToolInvocation),
    FileAttachment(FileAttachment),
    Opaque { kind: String, data: Value },
}

impl Part {
    fn type_tag(&self) -> &str {
        match self {
            Part::Text { .. } => "text",
            Part::Reasoning { .. } => "reasoning",
            Part::StepStart => "step-start",
            Part::StepFinish => "step-finish",
            Part::ToolInvocation(_) => "tool-invocation",
            Part::FileAttachment(_) => "file-attachment",
            Part::Opaque { kind, .. } => kind,
        }
    }

    fn data_value(&self) -> Value {
        match self {
            Part::Text { text } | Part::Reasoning { text } => serde_json::json!({ "text": text }),
            Part::StepStart | Part::StepFinish => serde_json::json!({}),
            Part::ToolInvocation(ti) => serde_json::to_value(ti).unwrap_or(Value::Null),
            Part::FileAttachment(fa) => serde_json::to_value(fa).unwrap_or(Value::Null),
            Part::Opaque { data, .. } => data.clone(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Part::Text { text } | Part::Reasoning { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_reasoning(&self) -> bool {
        matches!(self, Part::Reasoning { .. })
    }

    pub fn tool_invocation(&self) -> Option<&ToolInvocation> {
        match self {
            Part::ToolInvocation(ti) => Some(ti),
            _ => None,
        }
    }
}

impl Serialize for Part {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", self.type_tag())?;
        map.serialize_entry("data", &self.data_value())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PartVisitor;

        impl<'de> Visitor<'de> for PartVisitor {
            type Value = Part;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a {type, data} part envelope")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Part, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut kind: Option<String> = None;
                let mut data: Option<Value> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "type" => kind = Some(map.next_value()?),
                        "data" => data = Some(map.next_value()?),
                        _ => {
                            let _: Value = map.next_value()?;
                        }
                    }
                }
                let kind = kind.ok_or_else(|| DeError::missing_field("type"))?;
                let data = data.unwrap_or(Value::Null);

                Ok(match kind.as_str() {
                    "text" => Part::Text {
                        text: field_str(&data, "text"),
                    },
                    "reasoning" => Part::Reasoning {
                        text: field_str(&data, "text"),
                    },
                    "step-start" => Part::StepStart,
                    "step-finish" => Part::StepFinish,
                    "tool-invocation" => {
                        let ti: ToolInvocation =
                            serde_json::from_value(data).map_err(DeError::custom)?;
                        Part::ToolInvocation(ti)
                    }
                    "file-attachment" => {
                        let fa: FileAttachment =
                            serde_json::from_value(data).map_err(DeError::custom)?;
                        Part::FileAttachment(fa)
                    }
                    other => Part::Opaque {
                        kind: other.to_string(),
                        data,
                    },
                })
            }
        }

        deserializer.deserialize_map(PartVisitor)
    }
}

fn field_str(data: &Value, field: &str) -> String {
    data.get(field)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinishReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    Canceled,
    Error,
    PermissionDenied,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cached: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantMeta {
    pub provider_id: String,
    pub model_id: String,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default)]
    pub cost: f64,
    /// Metadata sink keyed by `toolCallID`, merged in by the tool registry.
    #[serde(default)]
    pub tool: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Part>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub assistant_meta: Option<AssistantMeta>,
}

impl Message {
    pub fn new(id: String, session_id: String, role: Role, parts: Vec<Part>) -> Self {
        Self {
            id,
            session_id,
            role,
            parts,
            created_at: Utc::now(),
            completed_at: None,
            finish_reason: None,
            assistant_meta: None,
        }
    }

    /// Coalesce a text/reasoning delta into the active part of the right
    /// kind, or start a new part if the tail of the message isn't one.
    pub fn append_text_delta(&mut self, delta: &str, reasoning: bool) {
        if delta.is_empty() {
            return;
        }
        let matches_tail = matches!(
            self.parts.last(),
            Some(Part::Text { .. }) if !reasoning
        ) || matches!(
            self.parts.last(),
            Some(Part::Reasoning { .. }) if reasoning
        );
        if matches_tail {
            match self.parts.last_mut() {
                Some(Part::Text { text }) | Some(Part::Reasoning { text }) => {
                    text.push_str(delta);
                }
                _ => unreachable!("matches_tail guarantees a text/reasoning tail"),
            }
        } else if reasoning {
            self.parts.push(Part::Reasoning {
                text: delta.to_string(),
            });
        } else {
            self.parts.push(Part::Text {
                text: delta.to_string(),
            });
        }
    }

    pub fn start_step(&mut self) {
        self.parts.push(Part::StepStart);
    }

    pub fn finish_step(&mut self) {
        self.parts.push(Part::StepFinish);
    }

    pub fn append_tool_call(&mut self, tool_call_id: String, tool_name: String, args: Value) {
        self.parts.push(Part::ToolInvocation(ToolInvocation {
            tool_call_id,
            tool_name,
            args,
            state: ToolInvocationState::Call,
            result: None,
            is_error: false,
        }));
    }

    /// Locate the matching in-flight tool invocation and flip it to
    /// `state=result`. Returns `false` if no matching `call` was found
    /// (violates invariant 3, so callers should treat this as a bug).
    pub fn attach_tool_result(&mut self, tool_call_id: &str, result: String, is_error: bool) -> bool {
        for part in self.parts.iter_mut().rev() {
            if let Part::ToolInvocation(ti) = part {
                if ti.tool_call_id == tool_call_id && ti.state == ToolInvocationState::Call {
                    ti.state = ToolInvocationState::Result;
                    ti.result = Some(result);
                    ti.is_error = is_error;
                    return true;
                }
            }
        }
        false
    }

    pub fn finalize(&mut self, reason: FinishReason) {
        self.completed_at = Some(Utc::now());
        self.finish_reason = Some(reason);
    }

    pub fn record_usage(&mut self, usage: TokenUsage, cost_delta: f64) {
        if let Some(meta) = self.assistant_meta.as_mut() {
            meta.tokens.input += usage.input;
            meta.tokens.output += usage.output;
            meta.tokens.reasoning += usage.reasoning;
            meta.tokens.cached += usage.cached;
            meta.cost += cost_delta;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub share_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_round_trips_through_json() {
        let part = Part::Text {
            text: "hello".into(),
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["data"]["text"], "hello");
        let back: Part = serde_json::from_value(json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn unknown_part_type_survives_as_opaque() {
        let json = serde_json::json!({"type": "future-part", "data": {"anything": 1}});
        let part: Part = serde_json::from_value(json.clone()).unwrap();
        match &part {
            Part::Opaque { kind, data } => {
                assert_eq!(kind, "future-part");
                assert_eq!(data["anything"], 1);
            }
            _ => panic!("expected opaque part"),
        }
        // And it survives a second round trip unchanged.
        let roundtripped = serde_json::to_value(&part).unwrap();
        assert_eq!(roundtripped, json);
    }

    #[test]
    fn text_deltas_coalesce_into_one_part() {
        let mut msg = Message::new("msg_1".into(), "ses_1".into(), Role::Assistant, vec![]);
        msg.append_text_delta("Hel", false);
        msg.append_text_delta("lo", false);
        msg.append_text_delta(" world", false);
        assert_eq!(msg.parts.len(), 1);
        assert_eq!(msg.parts[0].text(), Some("Hello world"));
    }

    #[test]
    fn step_start_forces_a_new_text_part() {
        let mut msg = Message::new("msg_1".into(), "ses_1".into(), Role::Assistant, vec![]);
        msg.append_text_delta("first", false);
        msg.start_step();
        msg.append_text_delta("second", false);
        assert_eq!(msg.parts.len(), 3);
        assert_eq!(msg.parts[0].text(), Some("first"));
        assert!(matches!(msg.parts[1], Part::StepStart));
        assert_eq!(msg.parts[2].text(), Some("second"));
    }

    #[test]
    fn tool_result_attaches_to_matching_call() {
        let mut msg = Message::new("msg_1".into(), "ses_1".into(), Role::Assistant, vec![]);
        msg.append_tool_call("tc_1".into(), "read".into(), serde_json::json!({"path": "/x"}));
        let attached = msg.attach_tool_result("tc_1", "abc".into(), false);
        assert!(attached);
        let ti = msg.parts[0].tool_invocation().unwrap();
        assert_eq!(ti.state, ToolInvocationState::Result);
        assert_eq!(ti.result.as_deref(), Some("abc"));
    }

    #[test]
    fn tool_result_without_matching_call_is_reported() {
        let mut msg = Message::new("msg_1".into(), "ses_1".into(), Role::Assistant, vec![]);
        assert!(!msg.attach_tool_result("tc_missing", "x".into(), false));
    }

    #[test]
    fn finalize_sets_completed_and_reason() {
        let mut msg = Message::new("msg_1".into(), "ses_1".into(), Role::Assistant, vec![]);
        assert!(msg.completed_at.is_none());
        msg.finalize(FinishReason::EndTurn);
        assert!(msg.completed_at.is_some());
        assert_eq!(msg.finish_reason, Some(FinishReason::EndTurn));
    }
}
