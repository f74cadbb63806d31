//! Subprocess-backed provider adapters.
//!
//! The LLM and embedding providers are external collaborators; this
//! module gives them a concrete local shape: a command that reads one
//! request JSON on stdin and writes JSONL events (LLM) or one response
//! object (embedder) on stdout. Configured through `AB_PROVIDER_CMD` and
//! `AB_EMBEDDER_CMD`; with neither set, runs fail cleanly with a
//! provider error and the rest of the gateway stays usable.

use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use ab_domain::provider::{ChatRequest, EmbeddingProvider, LlmProvider};
use ab_domain::stream::{BoxStream, StreamEvent};
use ab_domain::tool::{Message, ToolDefinition};
use ab_domain::{Error, Result};

pub const PROVIDER_CMD_ENV: &str = "AB_PROVIDER_CMD";
pub const EMBEDDER_CMD_ENV: &str = "AB_EMBEDDER_CMD";
pub const EMBEDDER_DIM_ENV: &str = "AB_EMBEDDER_DIM";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider over stdio
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize)]
struct WireRequest<'a> {
    messages: &'a [Message],
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

/// Runs the provider command once per turn. Events stream back as JSONL
/// in the same tagged shape as [`StreamEvent`].
pub struct CmdLlmProvider {
    command: String,
}

impl CmdLlmProvider {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for CmdLlmProvider {
    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let payload = serde_json::to_vec(&WireRequest {
            messages: &req.messages,
            tools: &req.tools,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        })?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Provider(format!("spawn provider command: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Provider("provider stdin unavailable".into()))?;
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| Error::Provider(format!("write provider request: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Provider(format!("write provider request: {e}")))?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Provider("provider stdout unavailable".into()))?;

        Ok(Box::pin(async_stream::stream! {
            let mut lines = BufReader::new(stdout).lines();
            // Keep the child alive for the stream's lifetime.
            let mut child = child;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<StreamEvent>(&line) {
                            Ok(event) => {
                                let done = matches!(event, StreamEvent::Done { .. });
                                yield Ok(event);
                                if done {
                                    break;
                                }
                            }
                            Err(e) => {
                                yield Err(Error::Provider(format!("bad provider event: {e}")));
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(Error::Provider(format!("provider stream read: {e}")));
                        break;
                    }
                }
            }
            let _ = child.wait().await;
        }))
    }

    fn provider_id(&self) -> &str {
        "cmd"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unconfigured fallback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Used when no provider command is configured: every run fails with a
/// clear provider error instead of hanging.
pub struct UnconfiguredProvider;

#[async_trait::async_trait]
impl LlmProvider for UnconfiguredProvider {
    async fn chat_stream(
        &self,
        _req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        Err(Error::Provider(format!(
            "no LLM provider configured; set {PROVIDER_CMD_ENV}"
        )))
    }

    fn provider_id(&self) -> &str {
        "unconfigured"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Embedding provider over stdio
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CmdEmbeddingProvider {
    command: String,
    dimension: usize,
}

impl CmdEmbeddingProvider {
    pub fn new(command: impl Into<String>, dimension: usize) -> Self {
        Self {
            command: command.into(),
            dimension,
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for CmdEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let payload = serde_json::to_vec(&serde_json::json!({ "texts": texts }))?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Provider(format!("spawn embedder command: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| Error::Provider(format!("write embedder request: {e}")))?;
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| Error::Provider(format!("write embedder request: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Provider(format!("embedder command: {e}")))?;
        if !output.status.success() {
            return Err(Error::Provider(format!(
                "embedder exited with {:?}",
                output.status.code()
            )));
        }

        #[derive(serde::Deserialize)]
        struct WireResponse {
            embeddings: Vec<Vec<f32>>,
        }
        let resp: WireResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Provider(format!("bad embedder response: {e}")))?;
        if resp.embeddings.len() != texts.len() {
            return Err(Error::Provider(format!(
                "embedder returned {} vectors for {} texts",
                resp.embeddings.len(),
                texts.len()
            )));
        }
        Ok(resp.embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Env factories
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn llm_from_env() -> Arc<dyn LlmProvider> {
    match std::env::var(PROVIDER_CMD_ENV) {
        Ok(command) if !command.is_empty() => {
            tracing::info!("LLM provider command configured");
            Arc::new(CmdLlmProvider::new(command))
        }
        _ => {
            tracing::warn!(
                "no LLM provider configured — runs will fail until {PROVIDER_CMD_ENV} is set"
            );
            Arc::new(UnconfiguredProvider)
        }
    }
}

pub fn embedder_from_env() -> Option<Arc<dyn EmbeddingProvider>> {
    let command = std::env::var(EMBEDDER_CMD_ENV).ok().filter(|c| !c.is_empty())?;
    let dimension = std::env::var(EMBEDDER_DIM_ENV)
        .ok()
        .and_then(|d| d.parse().ok())
        .unwrap_or(384);
    tracing::info!(dimension, "embedding provider command configured");
    Some(Arc::new(CmdEmbeddingProvider::new(command, dimension)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn cmd_provider_streams_jsonl_events() {
        // A provider that ignores its input and emits two events.
        let provider = CmdLlmProvider::new(
            r#"cat > /dev/null; printf '{"type":"token","text":"hi"}\n{"type":"done","usage":null,"finish_reason":"stop"}\n'"#,
        );
        let mut stream = provider.chat_stream(ChatRequest::default()).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamEvent::Token { ref text } if text == "hi"));
        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(second, StreamEvent::Done { .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cmd_provider_bad_line_is_a_provider_error() {
        let provider = CmdLlmProvider::new("cat > /dev/null; echo not-json");
        let mut stream = provider.chat_stream(ChatRequest::default()).await.unwrap();
        let event = stream.next().await.unwrap();
        assert!(event.is_err());
    }

    #[tokio::test]
    async fn unconfigured_provider_fails_immediately() {
        let provider = UnconfiguredProvider;
        let result = provider.chat_stream(ChatRequest::default()).await;
        assert!(matches!(result, Err(Error::Provider(_))));
    }

    #[tokio::test]
    async fn cmd_embedder_roundtrip() {
        let embedder = CmdEmbeddingProvider::new(
            r#"cat > /dev/null; echo '{"embeddings":[[0.5,0.5]]}'"#,
            2,
        );
        let vectors = embedder.embed(&["one".into()]).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0], vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn cmd_embedder_count_mismatch_is_an_error() {
        let embedder = CmdEmbeddingProvider::new(
            r#"cat > /dev/null; echo '{"embeddings":[]}'"#,
            2,
        );
        assert!(embedder.embed(&["one".into()]).await.is_err());
    }
}
