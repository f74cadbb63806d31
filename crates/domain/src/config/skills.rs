use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skills (prompt-snippet directories)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Directories scanned for `*.md` skill files.
    #[serde(default = "d_dirs")]
    pub dirs: Vec<PathBuf>,
    /// Total character budget for skill content in the system prompt.
    #[serde(default = "d_16000")]
    pub max_chars: usize,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dirs: d_dirs(),
            max_chars: d_16000(),
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("skills")]
}
fn d_16000() -> usize {
    16_000
}
