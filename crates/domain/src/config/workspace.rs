use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace / persistent state layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root of all persistent state: the event-log directory, the memory
/// store, JSON snapshots (schedules, pinned memory, adapter cursors) and
/// the single-instance lock file all live under `state_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "d_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            state_dir: d_state_dir(),
        }
    }
}

fn d_state_dir() -> PathBuf {
    PathBuf::from("state")
}
