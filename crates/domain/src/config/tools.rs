use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools (shell / filesystem / web)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Filesystem tools may only touch paths under this root.
    #[serde(default = "d_fs_root")]
    pub allowed_fs_root: PathBuf,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub web: WebConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allowed_fs_root: d_fs_root(),
            shell: ShellConfig::default(),
            web: WebConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Per-call hard timeout (seconds).
    #[serde(default = "d_120")]
    pub timeout_sec: u64,
    /// Commands matching any of these regexes are rejected outright,
    /// before policy matching.
    #[serde(default = "d_denied_patterns")]
    pub denied_patterns: Vec<String>,
    /// Max output chars returned to the model per call.
    #[serde(default = "d_200000")]
    pub max_output_chars: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_sec: d_120(),
            denied_patterns: d_denied_patterns(),
            max_output_chars: d_200000(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Per-request timeout (milliseconds).
    #[serde(default = "d_30000")]
    pub timeout_ms: u64,
    /// Maximum response body size in bytes (0 = unlimited).
    #[serde(default = "d_2mib")]
    pub max_size_bytes: u64,
    #[serde(default = "d_user_agent")]
    pub user_agent: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            timeout_ms: d_30000(),
            max_size_bytes: d_2mib(),
            user_agent: d_user_agent(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_fs_root() -> PathBuf {
    PathBuf::from("workspace")
}
fn d_120() -> u64 {
    120
}
fn d_30000() -> u64 {
    30_000
}
fn d_2mib() -> u64 {
    2 * 1024 * 1024
}
fn d_200000() -> usize {
    200_000
}
fn d_user_agent() -> String {
    "AgentBlob/0.1".into()
}
fn d_denied_patterns() -> Vec<String> {
    vec![
        r"rm\s+-rf\s+/".into(),
        r"mkfs\.".into(),
        r"dd\s+if=.+of=/dev/".into(),
    ]
}
