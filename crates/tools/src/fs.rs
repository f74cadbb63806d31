//! Filesystem tools — read, write and list constrained to the configured
//! root. Paths escaping the root (via `..` or absolute components) are
//! rejected before any I/O.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use ab_domain::tool::ToolDefinition;
use ab_domain::Result;

use crate::registry::{Tool, ToolOutcome};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path containment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve a relative request path inside `root`. Absolute paths, parent
/// traversal and prefix components are rejected.
fn resolve(root: &Path, requested: &str) -> std::result::Result<PathBuf, String> {
    let requested = Path::new(requested);
    let mut resolved = root.to_path_buf();
    for component in requested.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err("path escapes the workspace root".into()),
            Component::RootDir | Component::Prefix(_) => {
                return Err("absolute paths are not allowed".into());
            }
        }
    }
    Ok(resolved)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// fs_read
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ReadArgs {
    path: String,
}

pub fn read_definition() -> ToolDefinition {
    ToolDefinition {
        name: "fs_read".into(),
        description: "Read a text file inside the workspace.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" }
            },
            "required": ["path"]
        }),
    }
}

pub struct FsReadTool {
    root: PathBuf,
}

impl FsReadTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait::async_trait]
impl Tool for FsReadTool {
    async fn invoke(&self, arguments: &Value) -> Result<ToolOutcome> {
        let args: ReadArgs = match serde_json::from_value(arguments.clone()) {
            Ok(a) => a,
            Err(e) => return Ok(ToolOutcome::error(format!("invalid arguments: {e}"))),
        };
        let path = match resolve(&self.root, &args.path) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutcome::error(e)),
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(ToolOutcome::ok(content)),
            Err(e) => Ok(ToolOutcome::error(format!("read {}: {e}", args.path))),
        }
    }

    fn preview(&self, arguments: &Value) -> String {
        arguments
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// fs_write
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

pub fn write_definition() -> ToolDefinition {
    ToolDefinition {
        name: "fs_write".into(),
        description: "Write a text file inside the workspace, creating parent directories.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"]
        }),
    }
}

pub struct FsWriteTool {
    root: PathBuf,
}

impl FsWriteTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait::async_trait]
impl Tool for FsWriteTool {
    async fn invoke(&self, arguments: &Value) -> Result<ToolOutcome> {
        let args: WriteArgs = match serde_json::from_value(arguments.clone()) {
            Ok(a) => a,
            Err(e) => return Ok(ToolOutcome::error(format!("invalid arguments: {e}"))),
        };
        let path = match resolve(&self.root, &args.path) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutcome::error(e)),
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok(ToolOutcome::error(format!("mkdir {}: {e}", parent.display())));
            }
        }
        match tokio::fs::write(&path, args.content.as_bytes()).await {
            Ok(()) => Ok(ToolOutcome::ok(
                serde_json::json!({ "written": args.path, "bytes": args.content.len() }).to_string(),
            )),
            Err(e) => Ok(ToolOutcome::error(format!("write {}: {e}", args.path))),
        }
    }

    fn preview(&self, arguments: &Value) -> String {
        let path = arguments.get("path").and_then(Value::as_str).unwrap_or("?");
        let bytes = arguments
            .get("content")
            .and_then(Value::as_str)
            .map_or(0, str::len);
        format!("write {path} ({bytes} bytes)")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// fs_list
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ListArgs {
    #[serde(default = "default_dot")]
    path: String,
}

fn default_dot() -> String {
    ".".into()
}

pub fn list_definition() -> ToolDefinition {
    ToolDefinition {
        name: "fs_list".into(),
        description: "List a directory inside the workspace.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory relative to the workspace root" }
            }
        }),
    }
}

pub struct FsListTool {
    root: PathBuf,
}

impl FsListTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait::async_trait]
impl Tool for FsListTool {
    async fn invoke(&self, arguments: &Value) -> Result<ToolOutcome> {
        let args: ListArgs = match serde_json::from_value(arguments.clone()) {
            Ok(a) => a,
            Err(e) => return Ok(ToolOutcome::error(format!("invalid arguments: {e}"))),
        };
        let path = match resolve(&self.root, &args.path) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutcome::error(e)),
        };

        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&path).await {
            Ok(d) => d,
            Err(e) => return Ok(ToolOutcome::error(format!("list {}: {e}", args.path))),
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let meta = entry.metadata().await.ok();
            entries.push(serde_json::json!({
                "name": entry.file_name().to_string_lossy(),
                "is_dir": meta.as_ref().is_some_and(|m| m.is_dir()),
                "size": meta.as_ref().map_or(0, |m| m.len()),
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(ToolOutcome::ok(serde_json::json!({ "entries": entries }).to_string()))
    }

    fn preview(&self, arguments: &Value) -> String {
        arguments
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(".")
            .to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
