//! Workspace file inspection and search endpoints (§6: `/file*`, `/find*`).
//!
//! Path confinement follows the same rules as the tool registry's
//! `validate_path`: no absolute paths, no `..` components, and the
//! resolved path must canonicalize inside the workspace root.

use std::path::{Component, Path, PathBuf};

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use sa_domain::error::Error;

use crate::app_state::AppState;
use crate::error::ApiResult;

fn validate_path(workspace_root: &Path, requested: &str) -> Result<PathBuf, Error> {
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
    candidate
        .canonicalize()
        .map_err(|_| Error::NotFound(requested.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub path: String,
    #[serde(default)]
    pub diff: bool,
}

pub async fn read_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<Value>> {
    let resolved = validate_path(&state.workspace_root, &query.path)?;
    let content = tokio::fs::read_to_string(&resolved)
        .await
        .map_err(|e| Error::Io(e))?;

    if query.diff {
        let patch = git_diff(&state.workspace_root, &query.path).await;
        if let Some(patch) = patch.filter(|p| !p.is_empty()) {
            return Ok(Json(serde_json::json!({ "type": "patch", "content": patch })));
        }
    }
    Ok(Json(serde_json::json!({ "type": "raw", "content": content })))
}

pub async fn file_status(State(state): State<AppState>) -> Json<Value> {
    let output = tokio::process::Command::new("git")
        .arg("status")
        .arg("--porcelain")
        .current_dir(&*state.workspace_root)
        .output()
        .await;
    let files = match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|line| {
                let (status, path) = line.trim().split_once(' ')?;
                Some(serde_json::json!({ "path": path.trim(), "status": status.trim() }))
            })
            .collect(),
        _ => Vec::new(),
    };
    Json(Value::Array(files))
}

async fn git_diff(workspace_root: &Path, path: &str) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .arg("diff")
        .arg("--")
        .arg(path)
        .current_dir(workspace_root)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Deserialize)]
pub struct GrepQuery {
    pub pattern: String,
    #[serde(default)]
    pub path: Option<String>,
}

pub async fn find_grep(
    State(state): State<AppState>,
    Query(query): Query<GrepQuery>,
) -> ApiResult<Json<Vec<Value>>> {
    let regex = regex::Regex::new(&query.pattern)
        .map_err(|e| Error::SchemaError(format!("invalid pattern '{}': {e}", query.pattern)))?;
    let scope = query.path.as_deref().unwrap_or(".");
    let scope_path = validate_path(&state.workspace_root, scope)?;

    let mut matches = Vec::new();
    walk_files(&scope_path, &mut |file| {
        if let Ok(content) = std::fs::read_to_string(file) {
            for (n, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    let rel = file.strip_prefix(&*state.workspace_root).unwrap_or(file);
                    matches.push(serde_json::json!({
                        "path": rel.to_string_lossy(),
                        "line": n + 1,
                        "text": line,
                    }));
                }
            }
        }
    });
    Ok(Json(matches))
}

#[derive(Debug, Deserialize)]
pub struct FindFileQuery {
    pub query: String,
}

pub async fn find_file(
    State(state): State<AppState>,
    Query(query): Query<FindFileQuery>,
) -> Json<Vec<String>> {
    let needle = query.query.to_lowercase();
    let mut matches = Vec::new();
    walk_files(&state.workspace_root, &mut |file| {
        let rel = file.strip_prefix(&*state.workspace_root).unwrap_or(file);
        let rel_str = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
        if rel_str.to_lowercase().contains(&needle) {
            matches.push(rel_str);
        }
    });
    matches.sort();
    Json(matches)
}

/// Coarse symbol search: greps for common declaration keywords containing
/// the query. Not a real parser — a best-effort helper, same spirit as the
/// reference's `grep`-backed search tools.
pub async fn find_symbol(
    State(state): State<AppState>,
    Query(query): Query<FindFileQuery>,
) -> ApiResult<Json<Vec<Value>>> {
    let pattern = format!(
        r"(fn|struct|enum|trait|impl|class|function|def)\s+\w*{}\w*",
        regex::escape(&query.query)
    );
    let regex = regex::Regex::new(&format!("(?i){pattern}"))
        .map_err(|e| Error::Other(format!("symbol pattern build failed: {e}")))?;

    let mut matches = Vec::new();
    walk_files(&state.workspace_root, &mut |file| {
        if let Ok(content) = std::fs::read_to_string(file) {
            for (n, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    let rel = file.strip_prefix(&*state.workspace_root).unwrap_or(file);
                    matches.push(serde_json::json!({
                        "path": rel.to_string_lossy(),
                        "line": n + 1,
                        "text": line.trim(),
                    }));
                }
            }
        }
    });
    Ok(Json(matches))
}

fn walk_files(root: &Path, visit: &mut impl FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some(".git") {
            continue;
        }
        if path.is_dir() {
            walk_files(&path, visit);
        } else {
            visit(&path);
        }
    }
}
