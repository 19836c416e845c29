//! Turn-level cancellation and the Pending-Turn Table.
//!
//! No parent/child cascading-group support: this engine's only cancellation
//! unit is a single in-progress chat turn per session, so a plain
//! `session -> token` map is the whole table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A cancellation signal for one chat turn. Cheap to clone; every consumer
/// inside a turn (provider retry loop, tool invocation, permission wait)
/// holds a clone and polls [`CancelToken::is_cancelled`] at its suspension
/// points.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once this token is cancelled. Polls rather than parking on a
    /// notify, since a cancellation is a rare, short-lived event relative to
    /// the 20ms granularity — every suspension point in a turn (provider
    /// retry, tool invocation, permission wait) awaits this directly.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide `session -> cancellation handle` map. An entry exists iff a
/// chat turn is in progress for that session (spec §3's Pending-Turn Table).
#[derive(Default)]
pub struct PendingTurnTable {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl PendingTurnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for a session, or `None` if a turn is already
    /// running there (admission per invariant 1: at most one `≠ idle`
    /// instance per session).
    pub fn admit(&self, session_id: &str) -> Option<CancelToken> {
        let mut tokens = self.tokens.lock();
        if tokens.contains_key(session_id) {
            return None;
        }
        let token = CancelToken::new();
        tokens.insert(session_id.to_string(), token.clone());
        Some(token)
    }

    pub fn cancel(&self, session_id: &str) -> bool {
        match self.tokens.lock().get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.tokens.lock().contains_key(session_id)
    }

    pub fn finish(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
    }
}
