//! Web fetch tool — GET a URL with a timeout, a body-size cap, and the
//! configured user agent. HTTP failures come back as structured results.

use serde::Deserialize;
use serde_json::Value;

use ab_domain::config::WebConfig;
use ab_domain::tool::ToolDefinition;
use ab_domain::Result;

use crate::registry::{Tool, ToolOutcome};

#[derive(Debug, Deserialize)]
struct FetchArgs {
    url: String,
}

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "web_fetch".into(),
        description: "Fetch a URL over HTTP GET and return the body.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "http(s) URL to fetch" }
            },
            "required": ["url"]
        }),
    }
}

pub struct WebFetchTool {
    config: WebConfig,
}

impl WebFetchTool {
    pub fn new(config: WebConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Tool for WebFetchTool {
    async fn invoke(&self, arguments: &Value) -> Result<ToolOutcome> {
        let args: FetchArgs = match serde_json::from_value(arguments.clone()) {
            Ok(a) => a,
            Err(e) => return Ok(ToolOutcome::error(format!("invalid arguments: {e}"))),
        };
        if !args.url.starts_with("http://") && !args.url.starts_with("https://") {
            return Ok(ToolOutcome::error("only http(s) URLs are supported"));
        }

        let client = match reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(self.config.timeout_ms))
            .user_agent(&self.config.user_agent)
            .build()
        {
            Ok(c) => c,
            Err(e) => return Ok(ToolOutcome::error(format!("failed to build HTTP client: {e}"))),
        };

        match client.get(&args.url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                match resp.text().await {
                    Ok(mut body) => {
                        if self.config.max_size_bytes > 0
                            && body.len() as u64 > self.config.max_size_bytes
                        {
                            let mut end = self.config.max_size_bytes as usize;
                            while !body.is_char_boundary(end) && end > 0 {
                                end -= 1;
                            }
                            body.truncate(end);
                        }
                        Ok(ToolOutcome {
                            content: serde_json::json!({
                                "status": status,
                                "body": body,
                            })
                            .to_string(),
                            is_error: status >= 400,
                        })
                    }
                    Err(e) => Ok(ToolOutcome::error(format!("failed to read body: {e}"))),
                }
            }
            Err(e) => Ok(ToolOutcome::error(format!("request failed: {e}"))),
        }
    }

    fn preview(&self, arguments: &Value) -> String {
        arguments
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let tool = WebFetchTool::new(WebConfig::default());
        let outcome = tool.invoke(&json!({"url": "file:///etc/passwd"})).await.unwrap();
        assert!(outcome.is_error);

        let outcome = tool.invoke(&json!({"url": "ftp://host"})).await.unwrap();
        assert!(outcome.is_error);
    }

    #[tokio::test]
    async fn missing_url_is_invalid_args() {
        let tool = WebFetchTool::new(WebConfig::default());
        let outcome = tool.invoke(&json!({})).await.unwrap();
        assert!(outcome.is_error);
        assert!(outcome.content.contains("invalid arguments"));
    }

    #[test]
    fn preview_is_the_url() {
        let tool = WebFetchTool::new(WebConfig::default());
        assert_eq!(
            tool.preview(&json!({"url": "https://example.com"})),
            "https://example.com"
        );
    }
}
