//! Shared application state threaded through every axum handler.
//!
//! A `#[derive(Clone)]` struct of `Arc<T>` handles to the services built
//! once at process start. Cloning is cheap; every handler gets its own copy
//! of the `Arc`s.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use sa_engine::{Config, EventBus, PermissionGate, SessionEngine, SessionStore};

#[derive(Clone)]
pub struct AppState {
    // ── Core services ──
    pub config: Arc<Config>,
    pub engine: Arc<SessionEngine>,
    pub store: Arc<SessionStore>,
    pub events: Arc<EventBus>,
    pub permission_gate: Arc<PermissionGate>,

    // ── Environment ──
    pub workspace_root: Arc<PathBuf>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<SessionEngine>,
        store: Arc<SessionStore>,
        events: Arc<EventBus>,
        permission_gate: Arc<PermissionGate>,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            config,
            engine,
            store,
            events,
            permission_gate,
            workspace_root: Arc::new(workspace_root),
            started_at: Utc::now(),
        }
    }
}
