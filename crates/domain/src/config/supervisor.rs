use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Scheduler tick interval (seconds). 1 s resolution is sufficient.
    #[serde(default = "d_1")]
    pub interval_s: u64,
    /// Maintenance sweep interval: embedding backlog, permission expiry,
    /// log pruning, snapshot eviction (seconds).
    #[serde(default = "d_30")]
    pub maintenance_interval_s: u64,
    /// Overall per-turn timeout for an LLM stream (seconds).
    #[serde(default = "d_600")]
    pub turn_timeout_s: u64,
    #[serde(default)]
    pub debug: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_s: d_1(),
            maintenance_interval_s: d_30(),
            turn_timeout_s: d_600(),
            debug: false,
        }
    }
}

fn d_1() -> u64 {
    1
}
fn d_30() -> u64 {
    30
}
fn d_600() -> u64 {
    600
}
