//! Built-in tool descriptors and dispatch: a JSON-schema descriptor list plus
//! a name-matching dispatcher that returns `(output, is_error)`. Path-taking
//! tools confine reads/writes to the workspace root via canonicalize-and-
//! containment-check. The shell tool's bounded output buffer reuses
//! `sa_tools::manager::OutputBuffer`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tokio::io::AsyncReadExt;

use sa_domain::error::{Error, Result};
use sa_tools::manager::OutputBuffer;

use crate::cancel::CancelToken;
use crate::file_time_guard::FileTimeGuard;
use crate::identifier::Identifier;
use crate::permission_gate::PermissionGate;

/// A default output cap for `shell`, generous enough for normal command
/// output but bounded so a runaway command can't exhaust memory.
const SHELL_OUTPUT_CAP: usize = 64 * 1024;
const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub mutating: bool,
}

fn builtin_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "read".into(),
            description: "Read a UTF-8 text file relative to the workspace root.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "offset": {"type": "integer"},
                    "limit": {"type": "integer"},
                },
                "required": ["path"],
            }),
            mutating: false,
        },
        ToolDescriptor {
            name: "write".into(),
            description: "Create or overwrite a file relative to the workspace root.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                },
                "required": ["path", "content"],
            }),
            mutating: true,
        },
        ToolDescriptor {
            name: "edit".into(),
            description: "Replace one unambiguous substring occurrence in a file.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "oldText": {"type": "string"},
                    "newText": {"type": "string"},
                },
                "required": ["path", "oldText", "newText"],
            }),
            mutating: true,
        },
        ToolDescriptor {
            name: "shell".into(),
            description: "Run a command via the host shell with a hard timeout.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "cwd": {"type": "string"},
                    "timeoutSec": {"type": "integer"},
                },
                "required": ["command"],
            }),
            mutating: true,
        },
        ToolDescriptor {
            name: "grep".into(),
            description: "Regex content search over the workspace, line-oriented.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string"},
                },
                "required": ["pattern"],
            }),
            mutating: false,
        },
        ToolDescriptor {
            name: "glob".into(),
            description: "Filename pattern search over the workspace.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                },
                "required": ["pattern"],
            }),
            mutating: false,
        },
    ]
}

/// Validate and resolve a requested path within the workspace root. Rejects
/// absolute paths, raw `..` components, and anything that canonicalizes
/// outside the root.
fn validate_path(workspace_root: &Path, requested: &str) -> Result<PathBuf> {
    let requested_path = Path::new(requested);
    if requested_path.is_absolute() {
        return Err(Error::SchemaError(format!(
            "absolute paths are not allowed: {requested}"
        )));
    }
    for component in requested_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(Error::SchemaError(format!(
                "path must not contain '..' components: {requested}"
            )));
        }
    }

    let canonical_root = workspace_root
        .canonicalize()
        .map_err(|e| Error::Other(format!("cannot resolve workspace root: {e}")))?;
    let candidate = canonical_root.join(requested_path);

    let resolved = if candidate.exists() {
        candidate
            .canonicalize()
            .map_err(|e| Error::Other(format!("cannot resolve path '{requested}': {e}")))?
    } else {
        let mut existing = candidate.as_path();
        let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
        loop {
            if existing.exists() {
                break;
            }
            match existing.parent() {
                Some(parent) => {
                    if let Some(name) = existing.file_name() {
                        tail.push(name);
                    }
                    existing = parent;
                }
                None => break,
            }
        }
        let mut resolved = existing
            .canonicalize()
            .map_err(|e| Error::Other(format!("cannot resolve ancestor of '{requested}': {e}")))?;
        for part in tail.into_iter().rev() {
            resolved.push(part);
        }
        resolved
    };

    if !resolved.starts_with(&canonical_root) {
        return Err(Error::SchemaError(format!(
            "path '{requested}' resolves outside workspace root"
        )));
    }
    Ok(resolved)
}

pub struct ToolRegistry {
    workspace_root: PathBuf,
    descriptors: Vec<ToolDescriptor>,
    file_guard: Arc<FileTimeGuard>,
    permission_gate: Arc<PermissionGate>,
    ids: Arc<Identifier>,
}

impl ToolRegistry {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        file_guard: Arc<FileTimeGuard>,
        permission_gate: Arc<PermissionGate>,
        ids: Arc<Identifier>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            descriptors: builtin_descriptors(),
            file_guard,
            permission_gate,
            ids,
        }
    }

    /// Drop this session's file-time-guard entries. Called once the session
    /// itself is removed, so the guard's map doesn't grow without bound.
    pub fn forget_session(&self, session_id: &str) {
        self.file_guard.forget_session(session_id);
    }

    /// Descriptors restricted to an enabled subset (mode filtering), or all
    /// of them when `allowed` is `None`.
    pub fn descriptors(&self, allowed: Option<&[String]>) -> Vec<ToolDescriptor> {
        match allowed {
            Some(names) => self
                .descriptors
                .iter()
                .filter(|d| names.iter().any(|n| n == &d.name))
                .cloned()
                .collect(),
            None => self.descriptors.clone(),
        }
    }

    fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    /// Check the tool is registered and its required arguments are present.
    /// Does not execute anything.
    pub fn validate(&self, name: &str, args: &Value) -> Result<()> {
        let descriptor = self
            .descriptor(name)
            .ok_or_else(|| Error::SchemaError(format!("unknown tool: {name}")))?;
        let required = descriptor
            .parameters
            .get("required")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for field in required {
            let Some(field) = field.as_str() else { continue };
            if args.get(field).is_none() {
                return Err(Error::SchemaError(format!(
                    "{name}: missing required argument '{field}'"
                )));
            }
        }
        Ok(())
    }

    /// Execute a tool call. Returns `Ok((output, is_error))` for any outcome
    /// the model should see as part of its own context — a failed schema
    /// validation and a denied permission request are both surfaced this
    /// way, exactly like `tool_write`/`tool_edit`'s own file-time-guard
    /// failures below. `Err` is reserved for conditions that end the turn
    /// outright: cancellation, or the permission bus itself going away.
    pub async fn invoke(
        &self,
        session_id: &str,
        name: &str,
        args: &Value,
        cancel: &CancelToken,
    ) -> Result<(String, bool)> {
        if let Err(e) = self.validate(name, args) {
            return Ok((e.to_string(), true));
        }
        let descriptor = self.descriptor(name).expect("validated above");

        if descriptor.mutating {
            if let Err(e) = self
                .permission_gate
                .require(session_id, name, args, cancel, &self.ids)
                .await
            {
                return match e {
                    Error::PermissionDenied(reason) => Ok((reason, true)),
                    other => Err(other),
                };
            }
        }

        match name {
            "read" => self.tool_read(session_id, args).await,
            "write" => self.tool_write(session_id, args).await,
            "edit" => self.tool_edit(session_id, args).await,
            "shell" => self.tool_shell(args, cancel).await,
            "grep" => self.tool_grep(args).await,
            "glob" => self.tool_glob(args).await,
            other => Err(Error::SchemaError(format!("unknown tool: {other}"))),
        }
    }

    async fn tool_read(&self, session_id: &str, args: &Value) -> Result<(String, bool)> {
        let path = args["path"].as_str().unwrap_or_default();
        let resolved = match validate_path(&self.workspace_root, path) {
            Ok(p) => p,
            Err(e) => return Ok((e.to_string(), true)),
        };
        let content = match tokio::fs::read_to_string(&resolved).await {
            Ok(c) => c,
            Err(e) => return Ok((format!("failed to read '{path}': {e}"), true)),
        };
        self.file_guard.note_read(session_id, resolved.to_string_lossy().as_ref());

        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let lines: Vec<&str> = content.lines().collect();
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(lines.len().saturating_sub(offset));
        let selected = lines.into_iter().skip(offset).take(limit).collect::<Vec<_>>().join("\n");
        Ok((selected, false))
    }

    async fn tool_write(&self, session_id: &str, args: &Value) -> Result<(String, bool)> {
        let path = args["path"].as_str().unwrap_or_default();
        let content = args["content"].as_str().unwrap_or_default();
        let resolved = match validate_path(&self.workspace_root, path) {
            Ok(p) => p,
            Err(e) => return Ok((e.to_string(), true)),
        };
        if resolved.exists() {
            if let Err(e) = self.file_guard.assert_fresh(session_id, resolved.to_string_lossy().as_ref()) {
                return Ok((e.to_string(), true));
            }
        }
        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok((format!("failed to create parent directory: {e}"), true));
            }
        }
        match tokio::fs::write(&resolved, content.as_bytes()).await {
            Ok(()) => Ok((format!("wrote {} bytes to {path}", content.len()), false)),
            Err(e) => Ok((format!("failed to write '{path}': {e}"), true)),
        }
    }

    async fn tool_edit(&self, session_id: &str, args: &Value) -> Result<(String, bool)> {
        let path = args["path"].as_str().unwrap_or_default();
        let old_text = args["oldText"].as_str().unwrap_or_default();
        let new_text = args["newText"].as_str().unwrap_or_default();
        let resolved = match validate_path(&self.workspace_root, path) {
            Ok(p) => p,
            Err(e) => return Ok((e.to_string(), true)),
        };

        if let Err(e) = self.file_guard.assert_fresh(session_id, resolved.to_string_lossy().as_ref()) {
            return Ok((e.to_string(), true));
        }

        let content = match tokio::fs::read_to_string(&resolved).await {
            Ok(c) => c,
            Err(e) => return Ok((format!("failed to read '{path}': {e}"), true)),
        };
        let occurrences = content.matches(old_text).count();
        if occurrences == 0 {
            return Ok((format!("'{old_text}' not found in {path}"), true));
        }
        if occurrences > 1 {
            return Ok((
                format!("'{old_text}' is ambiguous in {path} ({occurrences} occurrences)"),
                true,
            ));
        }
        let updated = content.replacen(old_text, new_text, 1);
        match tokio::fs::write(&resolved, updated.as_bytes()).await {
            Ok(()) => Ok((format!("edited {path}"), false)),
            Err(e) => Ok((format!("failed to write '{path}': {e}"), true)),
        }
    }

    async fn tool_shell(&self, args: &Value, cancel: &CancelToken) -> Result<(String, bool)> {
        let command = args["command"].as_str().unwrap_or_default();
        let cwd = args.get("cwd").and_then(Value::as_str);
        let timeout_secs = args
            .get("timeoutSec")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_SHELL_TIMEOUT_SECS);

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(cwd.map(Path::new).unwrap_or(&self.workspace_root));
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return Ok((format!("failed to spawn command: {e}"), true)),
        };

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        let run = async {
            let mut buffer = OutputBuffer::new(SHELL_OUTPUT_CAP);
            let mut out_buf = Vec::new();
            let mut err_buf = Vec::new();
            let _ = stdout.read_to_end(&mut out_buf).await;
            let _ = stderr.read_to_end(&mut err_buf).await;
            buffer.push(&String::from_utf8_lossy(&out_buf));
            buffer.push(&String::from_utf8_lossy(&err_buf));
            let status = child.wait().await;
            (buffer, status)
        };

        tokio::select! {
            result = tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), run) => {
                match result {
                    Ok((buffer, Ok(status))) => {
                        let is_error = !status.success();
                        Ok((buffer.tail(usize::MAX), is_error))
                    }
                    Ok((buffer, Err(e))) => Ok((format!("{}\n(wait failed: {e})", buffer.tail(usize::MAX)), true)),
                    Err(_) => Ok((format!("command timed out after {timeout_secs}s"), true)),
                }
            }
            _ = cancel.cancelled() => {
                Err(Error::Canceled)
            }
        }
    }

    async fn tool_grep(&self, args: &Value) -> Result<(String, bool)> {
        let pattern = args["pattern"].as_str().unwrap_or_default();
        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return Ok((format!("invalid regex '{pattern}': {e}"), true)),
        };
        let scope = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let scope_path = match validate_path(&self.workspace_root, scope) {
            Ok(p) => p,
            Err(e) => return Ok((e.to_string(), true)),
        };

        let mut matches = Vec::new();
        walk_files(&scope_path, &mut |file| {
            if let Ok(content) = std::fs::read_to_string(file) {
                for (n, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        let rel = file.strip_prefix(&self.workspace_root).unwrap_or(file);
                        matches.push(format!("{}:{}:{}", rel.display(), n + 1, line));
                    }
                }
            }
        });
        Ok((matches.join("\n"), false))
    }

    async fn tool_glob(&self, args: &Value) -> Result<(String, bool)> {
        let pattern = args["pattern"].as_str().unwrap_or_default();
        let regex = match glob_to_regex(pattern) {
            Ok(r) => r,
            Err(e) => return Ok((format!("invalid glob '{pattern}': {e}"), true)),
        };

        let mut matches = Vec::new();
        walk_files(&self.workspace_root, &mut |file| {
            let rel = file.strip_prefix(&self.workspace_root).unwrap_or(file);
            let rel_str = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
            if regex.is_match(&rel_str) {
                matches.push(rel_str);
            }
        });
        matches.sort();
        Ok((matches.join("\n"), false))
    }
}

fn walk_files(root: &Path, visit: &mut impl FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(root) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_files(&path, visit);
        } else {
            visit(&path);
        }
    }
}

/// Translate a small glob dialect (`*`, `**`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '.' | '(' | ')' | '+' | '|' | '^' | '$' | '[' | ']' | '{' | '}' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    Regex::new(&out)
}
