//! The tool registry: name → { capability label, input schema, invoke fn }.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use ab_domain::tool::ToolDefinition;
use ab_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool trait & outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of one tool invocation. Errors are structured content the model
/// can react to; the run continues either way.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// An opaque invoke function keyed by name. Implementations return
/// `Err` only for invocation-machinery faults; tool-level failures
/// (non-zero exit, 404, missing file) are `Ok` outcomes with `is_error`.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    async fn invoke(&self, arguments: &Value) -> Result<ToolOutcome>;

    /// A short rendering of the arguments for permission previews
    /// (e.g. the shell command string rather than the raw JSON).
    fn preview(&self, arguments: &Value) -> String {
        arguments.to_string()
    }
}

/// A registry row.
#[derive(Clone)]
pub struct RegisteredTool {
    pub name: String,
    /// Policy key, distinct from the tool name (`shell.run`,
    /// `filesystem.write`, …).
    pub capability: String,
    pub definition: ToolDefinition,
    pub handler: Arc<dyn Tool>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, tool: RegisteredTool) {
        let mut tools = self.tools.write();
        if tools.insert(tool.name.clone(), tool).is_some() {
            tracing::warn!("tool registered twice, later registration wins");
        }
    }

    pub fn get(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.read().get(name).cloned()
    }

    /// The capability label of a tool, when registered.
    pub fn capability_of(&self, name: &str) -> Option<String> {
        self.tools.read().get(name).map(|t| t.capability.clone())
    }

    /// Schemas exposed to the LLM, built from the table (stable order).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .values()
            .map(|t| t.definition.clone())
            .collect()
    }

    /// Preview string for a pending invocation of `name`.
    pub fn preview(&self, name: &str, arguments: &Value) -> String {
        match self.get(name) {
            Some(tool) => tool.handler.preview(arguments),
            None => arguments.to_string(),
        }
    }

    /// Invoke a registered tool. Unknown names are a structured error
    /// outcome so the model can recover.
    pub async fn invoke(&self, name: &str, arguments: &Value) -> ToolOutcome {
        let Some(tool) = self.get(name) else {
            return ToolOutcome::error(format!("unknown tool: {name}"));
        };
        match tool.handler.invoke(arguments).await {
            Ok(outcome) => outcome,
            Err(Error::Timeout(message)) => ToolOutcome::error(format!("tool timed out: {message}")),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}
