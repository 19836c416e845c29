//! Gates mutating tool invocations behind explicit human approval.
//!
//! A registry of pending approvals, resolved by id, generalized to a
//! bus-driven `permission.requested` / `permission.granted` /
//! `permission.denied` protocol, with a per-session auto-approve flag and
//! remembered-approval matching by tool/action/path-prefix.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use sa_domain::error::{Error, Result};

use crate::cancel::CancelToken;
use crate::event_bus::{BusEvent, EventBus};
use crate::identifier::Identifier;

/// A remembered prior approval: a tool action is pre-approved for every
/// argument set whose `path` (if any) starts with `path_prefix`.
#[derive(Debug, Clone)]
struct Remembered {
    tool_name: String,
    path_prefix: Option<String>,
}

#[derive(Default)]
struct SessionPolicy {
    auto_approve: bool,
    remembered: Vec<Remembered>,
}

pub struct PermissionGate {
    events: std::sync::Arc<EventBus>,
    policies: RwLock<HashMap<String, SessionPolicy>>,
}

impl PermissionGate {
    pub fn new(events: std::sync::Arc<EventBus>) -> Self {
        Self {
            events,
            policies: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_auto_approve(&self, session_id: &str, enabled: bool) {
        self.policies
            .write()
            .entry(session_id.to_string())
            .or_default()
            .auto_approve = enabled;
    }

    /// Remember a granted decision so future calls with a matching path
    /// prefix skip the round trip.
    fn remember(&self, session_id: &str, tool_name: &str, args: &Value) {
        let path_prefix = extract_path(args);
        self.policies
            .write()
            .entry(session_id.to_string())
            .or_default()
            .remembered
            .push(Remembered {
                tool_name: tool_name.to_string(),
                path_prefix,
            });
    }

    fn already_approved(&self, session_id: &str, tool_name: &str, args: &Value) -> bool {
        let policies = self.policies.read();
        let Some(policy) = policies.get(session_id) else {
            return false;
        };
        if policy.auto_approve {
            return true;
        }
        let path = extract_path(args);
        policy.remembered.iter().any(|r| {
            r.tool_name == tool_name
                && match (&r.path_prefix, &path) {
                    (Some(prefix), Some(path)) => path.starts_with(prefix.as_str()),
                    (None, _) => true,
                    (Some(_), None) => false,
                }
        })
    }

    /// Gate a mutating tool call. Returns immediately if auto-approve is set
    /// or a prior approval already covers this `(toolName, path)`. Otherwise
    /// publishes `permission.requested` and blocks on the bus for a matching
    /// `permission.granted` / `permission.denied`, honoring `cancel`.
    pub async fn require(
        &self,
        session_id: &str,
        tool_name: &str,
        args: &Value,
        cancel: &CancelToken,
        ids: &Identifier,
    ) -> Result<()> {
        if self.already_approved(session_id, tool_name, args) {
            return Ok(());
        }

        let request_id = Uuid::new_v4().to_string();
        let _ = ids; // kept on the signature for callers that want a consistent ID scheme later
        self.events.publish(BusEvent::new(
            "permission.requested",
            serde_json::json!({
                "sessionID": session_id,
                "requestID": request_id,
                "toolName": tool_name,
                "args": args,
            }),
        ));

        let mut sub = self.events.subscribe("permission");
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            let event = tokio::select! {
                event = sub.recv() => event,
                _ = cancel.cancelled() => return Err(Error::Canceled),
            };
            let Some(event) = event else {
                return Err(Error::Other("permission bus closed".into()));
            };
            if event.properties.get("requestID").and_then(Value::as_str) != Some(request_id.as_str()) {
                continue;
            }
            return match event.kind.as_str() {
                "permission.granted" => {
                    self.remember(session_id, tool_name, args);
                    Ok(())
                }
                "permission.denied" => {
                    let reason = event
                        .properties
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("denied")
                        .to_string();
                    Err(Error::PermissionDenied(reason))
                }
                _ => continue,
            };
        }
    }

    pub fn grant(&self, request_id: &str) {
        self.events.publish(BusEvent::new(
            "permission.granted",
            serde_json::json!({ "requestID": request_id }),
        ));
    }

    pub fn deny(&self, request_id: &str, reason: Option<String>) {
        self.events.publish(BusEvent::new(
            "permission.denied",
            serde_json::json!({ "requestID": request_id, "reason": reason }),
        ));
    }
}

fn extract_path(args: &Value) -> Option<String> {
    args.get("path").and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn gate() -> (PermissionGate, Arc<EventBus>) {
        let events = Arc::new(EventBus::new(32));
        (PermissionGate::new(events.clone()), events)
    }

    #[tokio::test]
    async fn auto_approve_skips_the_round_trip() {
        let (gate, _events) = gate();
        gate.set_auto_approve("ses_1", true);
        let cancel = CancelToken::new();
        let ids = Identifier::new();
        gate.require("ses_1", "shell", &serde_json::json!({}), &cancel, &ids)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn grant_resolves_a_pending_request() {
        let (gate, events) = gate();
        let cancel = CancelToken::new();
        let ids = Identifier::new();

        let mut sub = events.subscribe("permission.requested");
        let gate = Arc::new(gate);
        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move {
            gate2
                .require("ses_1", "write", &serde_json::json!({"path": "/ws/a.txt"}), &cancel, &ids)
                .await
        });

        let requested = sub.recv().await.unwrap();
        let request_id = requested.properties["requestID"].as_str().unwrap().to_string();
        gate.grant(&request_id);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn deny_resolves_as_permission_denied() {
        let (gate, events) = gate();
        let cancel = CancelToken::new();
        let ids = Identifier::new();

        let mut sub = events.subscribe("permission.requested");
        let gate = Arc::new(gate);
        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move {
            gate2
                .require("ses_1", "shell", &serde_json::json!({}), &cancel, &ids)
                .await
        });

        let requested = sub.recv().await.unwrap();
        let request_id = requested.properties["requestID"].as_str().unwrap().to_string();
        gate.deny(&request_id, Some("nope".into()));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn cancellation_during_wait_returns_canceled() {
        let (gate, _events) = gate();
        let cancel = CancelToken::new();
        let ids = Identifier::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            cancel2.cancel();
        });
        let err = gate
            .require("ses_1", "shell", &serde_json::json!({}), &cancel, &ids)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }

    #[tokio::test]
    async fn remembered_approval_covers_matching_path_prefix() {
        let (gate, events) = gate();
        let cancel = CancelToken::new();
        let ids = Identifier::new();

        let mut sub = events.subscribe("permission.requested");
        let gate = Arc::new(gate);
        let gate2 = gate.clone();
        let first = tokio::spawn(async move {
            gate2
                .require("ses_1", "write", &serde_json::json!({"path": "/ws/a.txt"}), &cancel, &ids)
                .await
        });
        let requested = sub.recv().await.unwrap();
        let request_id = requested.properties["requestID"].as_str().unwrap().to_string();
        gate.grant(&request_id);
        first.await.unwrap().unwrap();

        // A second call to the same tool under the same path prefix should
        // not need another round trip.
        let cancel = CancelToken::new();
        let ids = Identifier::new();
        gate.require("ses_1", "write", &serde_json::json!({"path": "/ws/a.txt"}), &cancel, &ids)
            .await
            .unwrap();
    }
}
