use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permissions (allow / ask / deny rule lists)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One policy rule: a capability key with an optional regex predicate over
/// the rendered tool arguments (e.g. `shell.run` with a command pattern).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub capability: String,
    /// Regex matched against the argument preview. `None` matches any args.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_pattern: Option<String>,
}

impl PermissionRule {
    pub fn capability(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            args_pattern: None,
        }
    }
}

/// Ordered rule lists per decision class. Decision precedence is
/// deny > ask > allow; within a class the first matching rule wins.
/// Capabilities matched by no rule default to ask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default = "d_allow_rules")]
    pub allow: Vec<PermissionRule>,
    #[serde(default = "d_ask_rules")]
    pub ask: Vec<PermissionRule>,
    #[serde(default)]
    pub deny: Vec<PermissionRule>,
    /// Pending requests older than this resolve as deny (seconds).
    #[serde(default = "d_900")]
    pub max_age_s: u64,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            allow: d_allow_rules(),
            ask: d_ask_rules(),
            deny: Vec::new(),
            max_age_s: d_900(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_900() -> u64 {
    900
}

fn d_allow_rules() -> Vec<PermissionRule> {
    vec![
        PermissionRule::capability("filesystem.read"),
        PermissionRule::capability("web.fetch"),
        PermissionRule::capability("memory.read"),
        PermissionRule::capability("memory.write"),
        PermissionRule::capability("worker.delegate"),
    ]
}

fn d_ask_rules() -> Vec<PermissionRule> {
    vec![
        PermissionRule::capability("shell.run"),
        PermissionRule::capability("shell.write"),
        PermissionRule::capability("filesystem.write"),
        PermissionRule::capability("memory.delete"),
    ]
}
