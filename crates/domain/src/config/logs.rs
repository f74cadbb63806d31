use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Log rotation (per append-only log)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rotation and pruning policy for one append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRotation {
    /// Segment size that triggers rotation into the archive.
    #[serde(default = "d_8mib")]
    pub max_bytes: u64,
    /// Archived segments older than this are pruned (days).
    #[serde(default = "d_14")]
    pub keep_days: u32,
    /// Maximum archived segments retained.
    #[serde(default = "d_16")]
    pub keep_max_files: usize,
}

impl Default for LogRotation {
    fn default() -> Self {
        Self {
            max_bytes: d_8mib(),
            keep_days: d_14(),
            keep_max_files: d_16(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsConfig {
    /// The canonical event log.
    #[serde(default)]
    pub events: LogRotation,
    /// The terminal-run snapshot log.
    #[serde(default)]
    pub runs: LogRotation,
}

fn d_8mib() -> u64 {
    8 * 1024 * 1024
}
fn d_14() -> u32 {
    14
}
fn d_16() -> usize {
    16
}
