use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Default IANA timezone for schedules created without one.
    #[serde(default = "d_utc")]
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { timezone: d_utc() }
    }
}

fn d_utc() -> String {
    "UTC".into()
}
