//! Process configuration: workspace root, server bind address, default
//! provider/model, per-mode presets, and approval flags.
//!
//! Loaded from an optional TOML file plus environment overrides: a missing
//! or partially-specified file falls back to built-in defaults rather than
//! failing hard.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::session_engine::Mode;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub modes: HashMap<String, ModeConfig>,
    #[serde(default)]
    pub permissions: PermissionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "d_ws_path")]
    pub path: PathBuf,
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            path: d_ws_path(),
            state_path: d_state_path(),
        }
    }
}

fn d_ws_path() -> PathBuf {
    PathBuf::from(".")
}

fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            cors: CorsConfig::default(),
        }
    }
}

fn d_port() -> u16 {
    4096
}

fn d_host() -> String {
    "127.0.0.1".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".into(), "http://127.0.0.1:3000".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "d_provider_id")]
    pub default_provider: String,
    #[serde(default = "d_model_id")]
    pub default_model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_provider: d_provider_id(),
            default_model: d_model_id(),
        }
    }
}

fn d_provider_id() -> String {
    "mock".into()
}

fn d_model_id() -> String {
    "echo".into()
}

/// A named mode preset, as loaded from TOML. Converted to a runtime
/// [`Mode`] via [`ModeConfig::into_mode`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModeConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

impl ModeConfig {
    pub fn into_mode(self, name: String) -> Mode {
        Mode {
            name,
            provider_override: self.provider,
            model_override: self.model,
            system_prompt: self.system_prompt,
            tool_names: self.tools,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub auto_share: bool,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            auto_share: false,
        }
    }
}

impl Config {
    /// Load from `path` if it exists, falling back to defaults with a
    /// warning if it is absent.
    pub fn load(path: &std::path::Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(raw) => match toml::from_str(&raw) {
                    Ok(config) => return config,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "failed to parse config, using defaults");
                    }
                },
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to read config, using defaults");
                }
            }
        } else {
            tracing::warn!(path = %path.display(), "no config file found, using defaults");
        }
        Config::default()
    }

    pub fn mode(&self, name: &str) -> Option<Mode> {
        self.modes.get(name).cloned().map(|m| m.into_mode(name.to_string()))
    }
}
