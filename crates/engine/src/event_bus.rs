//! Process-wide typed publish/subscribe bus.
//!
//! A single `tokio::sync::broadcast` channel per subscriber gives a
//! non-blocking, lossless-while-keeping-up publish for free; a lagging
//! subscriber's skipped messages are surfaced as a drop-oldest-plus-
//! diagnostic, logging the `Lagged` count via `tracing::warn!` instead of
//! silently continuing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Default per-subscriber queue depth.
pub const DEFAULT_CAPACITY: usize = 256;

/// One envelope on the bus: `{type, properties}` per the SSE wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: Value,
}

impl BusEvent {
    pub fn new(kind: impl Into<String>, properties: Value) -> Self {
        Self {
            kind: kind.into(),
            properties,
        }
    }

    /// Loose topic match: an exact type, or a `prefix.*`-style dotted prefix.
    fn matches(&self, topic: &str) -> bool {
        self.kind == topic || self.kind.starts_with(&format!("{topic}."))
    }
}

pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish is non-blocking: if there are no subscribers this is a no-op,
    /// and a slow subscriber never blocks the publisher (it only lags).
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to a single dotted event type (e.g. `"session.updated"`) or
    /// a dotted prefix (e.g. `"session"` matches `session.updated` and
    /// `session.removed`).
    pub fn subscribe(&self, topic: impl Into<String>) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            topic: Some(topic.into()),
        }
    }

    /// Subscribe to every event published on the bus.
    pub fn subscribe_all(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            topic: None,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A live subscription. Call [`EventSubscription::recv`] in a loop until it
/// returns `None` (the bus was dropped).
pub struct EventSubscription {
    rx: broadcast::Receiver<BusEvent>,
    topic: Option<String>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self
                        .topic
                        .as_deref()
                        .map(|t| event.matches(t))
                        .unwrap_or(true)
                    {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        skipped,
                        topic = self.topic.as_deref().unwrap_or("*"),
                        "event bus subscriber lagged; oldest events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
