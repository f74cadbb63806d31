//! Run lifecycle types — the unit of work driven by the executor.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    WaitingPermission,
    Stopping,
    Done,
    Failed,
    Stopped,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Stopped)
    }

    /// Whether a transition from `self` to `to` is legal.
    ///
    /// `Stopping` is a transient superstate of `Running` and
    /// `WaitingPermission`; terminal states accept nothing.
    pub fn can_transition_to(self, to: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (Self::Queued, Self::Running) => true,
            (Self::Queued, Self::Stopped) => true,
            (Self::Running, Self::WaitingPermission) => true,
            (Self::WaitingPermission, Self::Running) => true,
            (Self::Running | Self::WaitingPermission, Self::Stopping) => true,
            (Self::Stopping, Self::Stopped) => true,
            (_, Self::Done | Self::Failed | Self::Stopped) => !self.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Interactive,
    Scheduled,
    Worker,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run origin
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a run came from. The origin determines the only channel its
/// events are delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOrigin {
    /// A connected client channel.
    Channel { channel_id: String },
    /// A fired schedule.
    Scheduler { schedule_id: Uuid },
    /// A parent run that delegated this one.
    Parent { run_id: Uuid },
}

impl RunOrigin {
    /// The channel id to fan events out to, when one exists.
    ///
    /// Scheduler and worker runs have no client channel; their events are
    /// only appended to the log (workers report back through the parent's
    /// tool result instead).
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Self::Channel { channel_id } => Some(channel_id),
            _ => None,
        }
    }

    /// Stable string form used as session keys and log fields
    /// (e.g. `scheduler:<id>`).
    pub fn label(&self) -> String {
        match self {
            Self::Channel { channel_id } => format!("channel:{channel_id}"),
            Self::Scheduler { schedule_id } => format!("scheduler:{schedule_id}"),
            Self::Parent { run_id } => format!("worker-of:{run_id}"),
        }
    }
}
