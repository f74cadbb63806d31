//! Memory pseudo-tools — the model's window into long-term memory.
//!
//! These live in the runtime rather than the tool registry because their
//! mutations emit `memory.*` events attributed to the calling run.
//! Deletion is gated behind the `memory.delete` capability, which the
//! default policy keeps on ask: the store itself never restricts who
//! deletes, the tool layer does.

use serde_json::Value;
use uuid::Uuid;

use ab_domain::event::EventKind;
use ab_domain::tool::ToolDefinition;
use ab_memory::MemoryChange;
use ab_tools::ToolOutcome;

use crate::state::AppState;

use super::emit;
use super::runs::Run;

pub const MEMORY_SEARCH: &str = "memory_search";
pub const MEMORY_SAVE: &str = "memory_save";
pub const MEMORY_DELETE: &str = "memory_delete";

/// Capability label for a memory tool name.
pub fn capability_of(name: &str) -> Option<&'static str> {
    match name {
        MEMORY_SEARCH => Some("memory.read"),
        MEMORY_SAVE => Some("memory.write"),
        MEMORY_DELETE => Some("memory.delete"),
        _ => None,
    }
}

pub fn preview(name: &str, arguments: &Value) -> String {
    let field = match name {
        MEMORY_SEARCH => "query",
        MEMORY_SAVE => "text",
        _ => "item_id",
    };
    arguments
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: MEMORY_SEARCH.into(),
            description: "Search long-term memory for relevant facts.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "limit": { "type": "integer", "description": "Max results (default 8)" }
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: MEMORY_SAVE.into(),
            description: "Pin a durable fact into always-loaded memory.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "The fact to remember" }
                },
                "required": ["text"]
            }),
        },
        ToolDefinition {
            name: MEMORY_DELETE.into(),
            description: "Delete a memory item by id. Only do this on an explicit \
                          user instruction."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "item_id": { "type": "string", "description": "Item id to delete" }
                },
                "required": ["item_id"]
            }),
        },
    ]
}

/// Execute a memory tool for a run, emitting the matching `memory.*`
/// events on the run's origin channel.
pub async fn dispatch(state: &AppState, run: &Run, name: &str, arguments: &Value) -> ToolOutcome {
    match name {
        MEMORY_SEARCH => {
            let query = arguments.get("query").and_then(Value::as_str).unwrap_or("");
            let limit = arguments
                .get("limit")
                .and_then(Value::as_u64)
                .unwrap_or(8) as usize;
            match state.memory.search(query, limit).await {
                Ok(hits) => match serde_json::to_string(&hits) {
                    Ok(content) => ToolOutcome::ok(content),
                    Err(e) => ToolOutcome::error(format!("encoding hits: {e}")),
                },
                Err(e) => ToolOutcome::error(format!("memory search: {e}")),
            }
        }
        MEMORY_SAVE => {
            let Some(text) = arguments.get("text").and_then(Value::as_str) else {
                return ToolOutcome::error("missing required argument: text");
            };
            match state.memory.pin(text) {
                Ok(change) => {
                    emit_change(state, run, &change);
                    ToolOutcome::ok(serde_json::json!({ "saved": true }).to_string())
                }
                Err(e) => ToolOutcome::error(format!("memory save: {e}")),
            }
        }
        MEMORY_DELETE => {
            let item_id: Option<Uuid> = arguments
                .get("item_id")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok());
            let Some(item_id) = item_id else {
                return ToolOutcome::error("item_id must be a valid id");
            };
            match state.memory.delete(&item_id) {
                Ok(Some(change)) => {
                    emit_change(state, run, &change);
                    ToolOutcome::ok(serde_json::json!({ "deleted": true }).to_string())
                }
                Ok(None) => ToolOutcome::error(format!("no memory item {item_id}")),
                Err(e) => ToolOutcome::error(format!("memory delete: {e}")),
            }
        }
        _ => ToolOutcome::error(format!("unknown memory tool: {name}")),
    }
}

fn emit_change(state: &AppState, run: &Run, change: &MemoryChange) {
    let kind = match change {
        MemoryChange::Added { item_id, text } => EventKind::MemoryAdded {
            item_id: *item_id,
            text: text.clone(),
        },
        MemoryChange::Modified { item_id } => EventKind::MemoryModified { item_id: *item_id },
        MemoryChange::Removed { item_id } => EventKind::MemoryRemoved { item_id: *item_id },
    };
    emit(state, run.run_id, run.channel_id(), kind);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_are_distinct_from_tool_names() {
        assert_eq!(capability_of(MEMORY_SEARCH), Some("memory.read"));
        assert_eq!(capability_of(MEMORY_SAVE), Some("memory.write"));
        assert_eq!(capability_of(MEMORY_DELETE), Some("memory.delete"));
        assert_eq!(capability_of("shell_run"), None);
    }

    #[test]
    fn preview_extracts_the_salient_field() {
        assert_eq!(
            preview(MEMORY_SEARCH, &serde_json::json!({"query": "timezone"})),
            "timezone"
        );
        assert_eq!(
            preview(MEMORY_SAVE, &serde_json::json!({"text": "a fact"})),
            "a fact"
        );
    }

    #[test]
    fn definitions_cover_all_three_tools() {
        let defs = definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec![MEMORY_SEARCH, MEMORY_SAVE, MEMORY_DELETE]);
    }
}
