use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System prompt assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default = "d_true")]
    pub include_identity: bool,
    #[serde(default = "d_true")]
    pub include_memory: bool,
    #[serde(default = "d_true")]
    pub include_skills: bool,
    /// Free-form text appended verbatim to the system prompt.
    #[serde(default)]
    pub extra_instructions: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            include_identity: true,
            include_memory: true,
            include_skills: true,
            extra_instructions: String::new(),
        }
    }
}

fn d_true() -> bool {
    true
}
