use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task snapshot retention & auto-close
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Non-terminal runs idle longer than this are force-stopped by the
    /// maintenance sweep. Runs awaiting a permission decision are exempt.
    #[serde(default = "d_3600")]
    pub auto_close_after_s: u64,
    /// Terminal runs older than this are evicted from the snapshot (days).
    #[serde(default = "d_7")]
    pub keep_done_days: u32,
    /// Maximum terminal runs retained in the snapshot.
    #[serde(default = "d_500")]
    pub keep_done_max: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            auto_close_after_s: d_3600(),
            keep_done_days: d_7(),
            keep_done_max: d_500(),
        }
    }
}

fn d_3600() -> u64 {
    3600
}
fn d_7() -> u32 {
    7
}
fn d_500() -> usize {
    500
}
