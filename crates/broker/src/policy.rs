//! Policy matching — ordered capability rules with optional argument
//! predicates, compiled once per reload into an immutable snapshot.

use std::sync::Arc;

use parking_lot::RwLock;
use regex::{Regex, RegexSet};

use ab_domain::config::PermissionsConfig;
use ab_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Ask,
    Deny,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compiled policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CompiledRule {
    capability: String,
    args_regex: Option<Regex>,
}

impl CompiledRule {
    fn matches(&self, capability: &str, args_preview: &str) -> bool {
        if self.capability != capability {
            return false;
        }
        match &self.args_regex {
            Some(re) => re.is_match(args_preview),
            None => true,
        }
    }
}

struct Policy {
    deny: Vec<CompiledRule>,
    ask: Vec<CompiledRule>,
    allow: Vec<CompiledRule>,
    /// Fixed shell write-primitive table. Not configurable and not
    /// LLM-discretionary: a command matching any of these is reclassified
    /// from `shell.run` to `shell.write` before policy matching.
    shell_write: RegexSet,
}

fn compile_rules(rules: &[ab_domain::config::PermissionRule]) -> Result<Vec<CompiledRule>> {
    rules
        .iter()
        .map(|rule| {
            let args_regex = rule
                .args_pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| Error::Config(format!("permission rule regex: {e}")))?;
            Ok(CompiledRule {
                capability: rule.capability.clone(),
                args_regex,
            })
        })
        .collect()
}

fn shell_write_set() -> RegexSet {
    // `>` covers `>>` as well; sed only with an -i flag; rm anywhere in
    // the pipeline.
    RegexSet::new([
        r">",
        r"\btee\b",
        r"\bsed\b[^|;&]*\s-i\b",
        r"\bsed\s+-i\b",
        r"\brm\b",
    ])
    .unwrap_or_else(|_| RegexSet::empty())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PolicyEngine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Copy-on-reload policy holder: `check` reads an `Arc` snapshot, so a
/// concurrent `reload` never produces a half-updated view.
pub struct PolicyEngine {
    snapshot: RwLock<Arc<Policy>>,
}

impl PolicyEngine {
    pub fn new(config: &PermissionsConfig) -> Result<Self> {
        Ok(Self {
            snapshot: RwLock::new(Arc::new(Self::compile(config)?)),
        })
    }

    /// Replace the policy atomically. In-flight checks keep their snapshot.
    pub fn reload(&self, config: &PermissionsConfig) -> Result<()> {
        let policy = Arc::new(Self::compile(config)?);
        *self.snapshot.write() = policy;
        tracing::info!("permission policy reloaded");
        Ok(())
    }

    fn compile(config: &PermissionsConfig) -> Result<Policy> {
        Ok(Policy {
            deny: compile_rules(&config.deny)?,
            ask: compile_rules(&config.ask)?,
            allow: compile_rules(&config.allow)?,
            shell_write: shell_write_set(),
        })
    }

    /// Reclassify `shell.run` to `shell.write` when the command contains a
    /// write primitive. Other capabilities pass through unchanged.
    pub fn effective_capability(&self, capability: &str, args_preview: &str) -> String {
        if capability == "shell.run" {
            let policy = self.snapshot.read().clone();
            if policy.shell_write.is_match(args_preview) {
                return "shell.write".into();
            }
        }
        capability.to_string()
    }

    /// Match a capability + argument preview against the policy.
    ///
    /// Precedence is deny > ask > allow; within a class the first matching
    /// rule in configured order wins. Capabilities matched by no rule
    /// default to [`Decision::Ask`].
    pub fn check(&self, capability: &str, args_preview: &str) -> Decision {
        let policy = self.snapshot.read().clone();

        if policy
            .deny
            .iter()
            .any(|rule| rule.matches(capability, args_preview))
        {
            return Decision::Deny;
        }
        if policy
            .ask
            .iter()
            .any(|rule| rule.matches(capability, args_preview))
        {
            return Decision::Ask;
        }
        if policy
            .allow
            .iter()
            .any(|rule| rule.matches(capability, args_preview))
        {
            return Decision::Allow;
        }
        Decision::Ask
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
