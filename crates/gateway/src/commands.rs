//! Gateway-side slash commands. Clients forward user text verbatim; text
//! beginning with `/` is intercepted here and answered directly instead
//! of being admitted as a run.

use serde_json::{json, Value};

use crate::state::AppState;

/// Handle a slash command. Returns `None` when the text is not a command
/// (it proceeds to run admission).
pub fn handle(state: &AppState, session_id: &str, text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;
    let command = rest.split_whitespace().next().unwrap_or_default();

    let payload = match command {
        "help" => json!({
            "command": "help",
            "commands": ["/help", "/status", "/queue", "/schedules", "/workers"],
        }),
        "status" => json!({
            "command": "status",
            "uptime_s": state.uptime_seconds(),
            "connections": state.channels.count(),
            "sessions": state.sessions.session_count(),
            "pending_permissions": state.broker.pending_count(),
            "memory_items": state.memory.item_count(),
        }),
        "queue" => {
            let active = state.sessions.active_run(session_id);
            json!({
                "command": "queue",
                "session_id": session_id,
                "active_run_id": active,
            })
        }
        "schedules" => json!({
            "command": "schedules",
            "schedules": state.schedules.list(),
        }),
        "workers" => json!({
            "command": "workers",
            "workers": state.workers.list_recent(),
        }),
        _ => json!({
            "command": command,
            "error": format!("unknown command: /{command}"),
        }),
    };
    Some(payload)
}

/// Whether a text would be intercepted as a command.
pub fn is_command(text: &str) -> bool {
    text.trim_start().starts_with('/')
}
