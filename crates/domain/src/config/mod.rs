mod frontends;
mod logs;
mod mcp;
mod memory;
mod permissions;
mod prompts;
mod scheduler;
mod server;
mod skills;
mod supervisor;
mod tasks;
mod tools;
mod workspace;

pub use frontends::*;
pub use logs::*;
pub use mcp::*;
pub use memory::*;
pub use permissions::*;
pub use prompts::*;
pub use scheduler::*;
pub use server::*;
pub use skills::*;
pub use supervisor::*;
pub use tasks::*;
pub use tools::*;
pub use workspace::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The single configuration document (TOML on disk). Secrets are never
/// stored here — only the names of environment variables holding them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub frontends: FrontendsConfig,
}

impl Config {
    /// Load and parse a TOML config file.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| crate::Error::Config(e.to_string()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }
        if self.server.host.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }
        if self.server.queue_soft_cap == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.queue_soft_cap".into(),
                message: "queue_soft_cap must be at least 1".into(),
            });
        }

        // Permission rule patterns must be valid regex.
        for (class, rules) in [
            ("allow", &self.permissions.allow),
            ("ask", &self.permissions.ask),
            ("deny", &self.permissions.deny),
        ] {
            for (i, rule) in rules.iter().enumerate() {
                if rule.capability.is_empty() {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Error,
                        field: format!("permissions.{class}[{i}].capability"),
                        message: "capability must not be empty".into(),
                    });
                }
                if let Some(pattern) = &rule.args_pattern {
                    if let Err(e) = regex::Regex::new(pattern) {
                        issues.push(ConfigIssue {
                            severity: ConfigSeverity::Error,
                            field: format!("permissions.{class}[{i}].args_pattern"),
                            message: format!("invalid regex: {e}"),
                        });
                    }
                }
            }
        }

        for (i, pattern) in self.tools.shell.denied_patterns.iter().enumerate() {
            if let Err(e) = regex::Regex::new(pattern) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("tools.shell.denied_patterns[{i}]"),
                    message: format!("invalid regex: {e}"),
                });
            }
        }

        if !(0.0..=1.0).contains(&self.memory.importance_min) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "memory.importance_min".into(),
                message: "importance_min must be within [0, 1]".into(),
            });
        }
        if self.memory.embeddings.batch_size == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "memory.embeddings.batch_size".into(),
                message: "batch_size must be at least 1".into(),
            });
        }

        if self.scheduler.timezone.parse::<chrono_tz::Tz>().is_err() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "scheduler.timezone".into(),
                message: format!("unknown IANA timezone \"{}\"", self.scheduler.timezone),
            });
        }

        if self.logs.events.max_bytes < 64 * 1024 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "logs.events.max_bytes".into(),
                message: "segments under 64 KiB will rotate constantly".into(),
            });
        }

        if self.supervisor.interval_s == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "supervisor.interval_s".into(),
                message: "interval_s must be at least 1".into(),
            });
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_clean() {
        let issues = Config::default().validate();
        assert!(
            issues.iter().all(|i| i.severity != ConfigSeverity::Error),
            "default config must not produce errors: {issues:?}"
        );
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut config = Config::default();
        config.server.port = 0;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "server.port" && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn bad_permission_regex_is_an_error() {
        let mut config = Config::default();
        config.permissions.ask.push(PermissionRule {
            capability: "shell.run".into(),
            args_pattern: Some("(unclosed".into()),
        });
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.field.contains("args_pattern")));
    }

    #[test]
    fn bad_timezone_is_an_error() {
        let mut config = Config::default();
        config.scheduler.timezone = "Not A Zone".into();
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.field == "scheduler.timezone"));
    }

    #[test]
    fn importance_out_of_range_is_an_error() {
        let mut config = Config::default();
        config.memory.importance_min = 1.5;
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.field == "memory.importance_min"));
    }

    #[test]
    fn issue_display_format() {
        let issue = ConfigIssue {
            severity: ConfigSeverity::Warning,
            field: "logs.events.max_bytes".into(),
            message: "too small".into(),
        };
        assert_eq!(issue.to_string(), "[WARN] logs.events.max_bytes: too small");
    }
}
