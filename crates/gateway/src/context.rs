//! Context assembly — the system prompt (identity, skills, memory packet)
//! and the recent conversation history fed to each run.

use ab_domain::tool::Message;

use crate::runtime::runs::Run;
use crate::state::AppState;

/// Recent terminal runs of the session replayed as conversation history.
const HISTORY_RUNS: usize = 8;

const IDENTITY: &str = "You are Agent Blob, a single-user personal assistant running as an \
always-on local service. You can call tools; some tool calls require the user's approval \
before they execute. Keep answers direct and grounded in tool results.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System prompt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn build_system_prompt(state: &AppState, run: &Run) -> String {
    let prompts = &state.config.prompts;
    let mut sections: Vec<String> = Vec::new();

    if prompts.include_identity {
        sections.push(IDENTITY.to_string());
    }

    if !prompts.extra_instructions.is_empty() {
        sections.push(prompts.extra_instructions.clone());
    }

    if prompts.include_skills && state.config.skills.enabled {
        let skills = load_skills(state);
        if !skills.is_empty() {
            sections.push(format!("# Skills\n{skills}"));
        }
    }

    if prompts.include_memory {
        let packet = state
            .memory
            .build_packet(&run.origin.label(), &run.input_text)
            .await;
        if !packet.is_empty() {
            sections.push(format!("# Memory\n{}", packet.render()));
        }
    }

    sections.join("\n\n")
}

/// Concatenate `*.md` files from the configured skill directories,
/// truncating at the character budget.
fn load_skills(state: &AppState) -> String {
    let config = &state.config.skills;
    let mut out = String::new();

    for dir in &config.dirs {
        let pattern = dir.join("*.md");
        let Some(pattern) = pattern.to_str() else {
            continue;
        };
        let Ok(paths) = glob::glob(pattern) else {
            continue;
        };
        let mut paths: Vec<_> = paths.flatten().collect();
        paths.sort();
        for path in paths {
            let Ok(content) = std::fs::read_to_string(&path) else {
                tracing::warn!(path = %path.display(), "skipping unreadable skill file");
                continue;
            };
            let remaining = config.max_chars.saturating_sub(out.len());
            if remaining == 0 {
                return out;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            if content.len() > remaining {
                let mut end = remaining;
                while !content.is_char_boundary(end) && end > 0 {
                    end -= 1;
                }
                out.push_str(&content[..end]);
                return out;
            }
            out.push_str(&content);
        }
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation history
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Prior completed turns of this session as user/assistant message pairs,
/// oldest first.
pub fn conversation_history(state: &AppState, run: &Run) -> Vec<Message> {
    let mut messages = Vec::new();
    for prior in state.runs.recent_terminal(&run.session_id, HISTORY_RUNS) {
        if prior.run_id == run.run_id {
            continue;
        }
        messages.push(Message::user(&prior.input_text));
        if let Some(content) = &prior.final_content {
            if !content.is_empty() {
                messages.push(Message::assistant(content));
            }
        }
    }
    messages
}
