use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_7420")]
    pub port: u16,
    /// Soft cap on each session's pending FIFO; beyond it new requests
    /// are rejected with `queue_full`.
    #[serde(default = "d_16")]
    pub queue_soft_cap: usize,
    /// Max events replayed to a reconnecting channel.
    #[serde(default = "d_512")]
    pub replay_window: usize,
    /// Environment variable holding the gateway bearer token. When the
    /// variable is unset, the handshake is unauthenticated (local dev).
    #[serde(default = "d_token_env")]
    pub token_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_7420(),
            queue_soft_cap: d_16(),
            replay_window: d_512(),
            token_env: d_token_env(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_7420() -> u16 {
    7420
}
fn d_16() -> usize {
    16
}
fn d_512() -> usize {
    512
}
fn d_token_env() -> String {
    "AB_GATEWAY_TOKEN".into()
}
