use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frontend adapters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrontendsConfig {
    #[serde(default)]
    pub adapters: AdaptersConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptersConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
}

/// The Telegram long-poll adapter. The bot token lives in the environment
/// variable named by `token_env`, never in this document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "d_token_env")]
    pub token_env: String,
    #[serde(default = "d_api_base")]
    pub api_base: String,
    /// Long-poll wait (seconds).
    #[serde(default = "d_30")]
    pub poll_timeout_s: u64,
    /// Minimum gap between message edits when coalescing streamed deltas
    /// (milliseconds). Keeps us under the upstream API edit limits.
    #[serde(default = "d_1500")]
    pub edit_interval_ms: u64,
    /// Only updates from this chat id are accepted (single-user system).
    /// `None` accepts the first chat seen and pins it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_env: d_token_env(),
            api_base: d_api_base(),
            poll_timeout_s: d_30(),
            edit_interval_ms: d_1500(),
            chat_id: None,
        }
    }
}

fn d_token_env() -> String {
    "AB_TELEGRAM_TOKEN".into()
}
fn d_api_base() -> String {
    "https://api.telegram.org".into()
}
fn d_30() -> u64 {
    30
}
fn d_1500() -> u64 {
    1500
}
