//! Shell tool — runs one command under `sh -c` with a hard timeout and a
//! denied-pattern guard. Output is capped before it reaches the model.

use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use ab_domain::config::ShellConfig;
use ab_domain::tool::ToolDefinition;
use ab_domain::Result;

use crate::registry::{Tool, ToolOutcome};

#[derive(Debug, Clone, Deserialize)]
struct ShellArgs {
    command: String,
    #[serde(default)]
    workdir: Option<String>,
    /// Override the configured hard timeout (seconds).
    #[serde(default)]
    timeout_sec: Option<u64>,
}

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "shell_run".into(),
        description: "Run a shell command and return stdout, stderr and the exit code.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to execute" },
                "workdir": { "type": "string", "description": "Working directory" },
                "timeout_sec": { "type": "integer", "description": "Hard timeout in seconds" }
            },
            "required": ["command"]
        }),
    }
}

pub struct ShellTool {
    config: ShellConfig,
    denied: regex::RegexSet,
}

impl ShellTool {
    pub fn new(config: ShellConfig) -> Self {
        let denied = regex::RegexSet::new(&config.denied_patterns).unwrap_or_else(|e| {
            tracing::error!(error = %e, "invalid shell denied_patterns, denying nothing");
            regex::RegexSet::empty()
        });
        Self { config, denied }
    }
}

#[async_trait::async_trait]
impl Tool for ShellTool {
    async fn invoke(&self, arguments: &Value) -> Result<ToolOutcome> {
        let args: ShellArgs = match serde_json::from_value(arguments.clone()) {
            Ok(a) => a,
            Err(e) => return Ok(ToolOutcome::error(format!("invalid shell arguments: {e}"))),
        };

        if self.denied.is_match(&args.command) {
            return Ok(ToolOutcome::error(
                "command rejected by the denied-pattern policy",
            ));
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&args.command);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);
        if let Some(workdir) = &args.workdir {
            cmd.current_dir(workdir);
        }

        let timeout =
            std::time::Duration::from_secs(args.timeout_sec.unwrap_or(self.config.timeout_sec));

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Ok(ToolOutcome::error(format!("failed to spawn: {e}"))),
            Err(_) => {
                return Ok(ToolOutcome::error(format!(
                    "command timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };

        let code = output.status.code().unwrap_or(-1);
        let stdout = cap(&String::from_utf8_lossy(&output.stdout), self.config.max_output_chars);
        let stderr = cap(&String::from_utf8_lossy(&output.stderr), self.config.max_output_chars);

        let body = serde_json::json!({
            "stdout": stdout,
            "stderr": stderr,
            "code": code,
        })
        .to_string();

        // A non-zero exit is a structured tool failure; the run continues.
        Ok(ToolOutcome {
            content: body,
            is_error: code != 0,
        })
    }

    fn preview(&self, arguments: &Value) -> String {
        arguments
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

fn cap(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}\n[output truncated]", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool() -> ShellTool {
        ShellTool::new(ShellConfig::default())
    }

    #[tokio::test]
    async fn echo_returns_stdout_and_zero() {
        let outcome = tool()
            .invoke(&json!({"command": "echo hi"}))
            .await
            .unwrap();
        assert!(!outcome.is_error);
        let body: Value = serde_json::from_str(&outcome.content).unwrap();
        assert_eq!(body["stdout"], "hi\n");
        assert_eq!(body["code"], 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_tool_error() {
        let outcome = tool().invoke(&json!({"command": "exit 3"})).await.unwrap();
        assert!(outcome.is_error);
        let body: Value = serde_json::from_str(&outcome.content).unwrap();
        assert_eq!(body["code"], 3);
    }

    #[tokio::test]
    async fn denied_pattern_blocks_before_spawn() {
        let outcome = tool()
            .invoke(&json!({"command": "rm -rf / --no-preserve-root"}))
            .await
            .unwrap();
        assert!(outcome.is_error);
        assert!(outcome.content.contains("denied-pattern"));
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let outcome = tool()
            .invoke(&json!({"command": "sleep 30", "timeout_sec": 1}))
            .await
            .unwrap();
        assert!(outcome.is_error);
        assert!(outcome.content.contains("timed out"));
    }

    #[tokio::test]
    async fn missing_command_is_invalid_args() {
        let outcome = tool().invoke(&json!({})).await.unwrap();
        assert!(outcome.is_error);
        assert!(outcome.content.contains("invalid shell arguments"));
    }

    #[test]
    fn preview_is_the_command_string() {
        assert_eq!(tool().preview(&json!({"command": "echo hi"})), "echo hi");
    }

    #[test]
    fn cap_respects_char_boundaries() {
        let capped = cap("héllo world", 2);
        assert!(capped.starts_with('h'));
        assert!(capped.contains("[output truncated]"));
    }
}
