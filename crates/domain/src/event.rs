//! Canonical event model — every lifecycle transition and data emission is
//! one of these records, appended to the event log and fanned out to the
//! originating channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunState;
use crate::stream::Usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The human decision (or policy outcome) on a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// Tagged event payloads, one variant per event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    /// The run's input as admitted into the queue.
    #[serde(rename = "run.input")]
    RunInput {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<String>,
    },

    /// A lifecycle transition.
    #[serde(rename = "run.status")]
    RunStatus { state: RunState },

    /// An incremental assistant text delta.
    #[serde(rename = "token")]
    Token { text: String },

    /// The model is invoking a tool (emitted before execution).
    #[serde(rename = "tool.call")]
    ToolCall {
        call_id: String,
        tool_name: String,
        capability: String,
        arguments: serde_json::Value,
    },

    /// Tool execution finished (success or structured failure).
    #[serde(rename = "tool.result")]
    ToolResult {
        call_id: String,
        tool_name: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    /// The run is suspended awaiting a human allow/deny.
    #[serde(rename = "permission.request")]
    PermissionRequest {
        perm_id: Uuid,
        capability: String,
        tool_name: String,
        preview: String,
    },

    /// A decision arrived (or the request expired as deny).
    #[serde(rename = "permission.response")]
    PermissionResponse {
        perm_id: Uuid,
        decision: PermissionDecision,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        expired: bool,
    },

    /// The single terminal event of a run.
    #[serde(rename = "run.final")]
    RunFinal {
        state: RunState,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Classification tag for failures (`provider`, `timeout`, …).
        #[serde(skip_serializing_if = "Option::is_none")]
        error_kind: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    #[serde(rename = "memory.added")]
    MemoryAdded { item_id: Uuid, text: String },

    #[serde(rename = "memory.modified")]
    MemoryModified { item_id: Uuid },

    #[serde(rename = "memory.removed")]
    MemoryRemoved { item_id: Uuid },
}

impl EventKind {
    /// The wire name of this event kind (matches the serde tag).
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunInput { .. } => "run.input",
            Self::RunStatus { .. } => "run.status",
            Self::Token { .. } => "token",
            Self::ToolCall { .. } => "tool.call",
            Self::ToolResult { .. } => "tool.result",
            Self::PermissionRequest { .. } => "permission.request",
            Self::PermissionResponse { .. } => "permission.response",
            Self::RunFinal { .. } => "run.final",
            Self::MemoryAdded { .. } => "memory.added",
            Self::MemoryModified { .. } => "memory.modified",
            Self::MemoryRemoved { .. } => "memory.removed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinal { .. })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One appended record. `seq` is globally monotonic across log rotations
/// (the replay cursor); `run_seq` counts 1, 2, 3… within a single run,
/// strictly increasing with no gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    #[serde(default)]
    pub run_seq: u64,
    pub run_id: Uuid,
    /// Channel this event is routed to. `None` for scheduler/worker runs,
    /// whose output never reaches a client channel directly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Build an unsequenced event; the log assigns `seq` on append and
    /// the runtime assigns `run_seq` from the run's own counter.
    pub fn new(run_id: Uuid, channel_id: Option<String>, kind: EventKind) -> Self {
        Self {
            seq: 0,
            run_seq: 0,
            run_id,
            channel_id,
            ts: Utc::now(),
            kind,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scan filter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Filter for event-log scans. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub run_id: Option<Uuid>,
    pub channel_id: Option<String>,
    pub kinds: Option<Vec<&'static str>>,
}

impl EventFilter {
    pub fn for_run(run_id: Uuid) -> Self {
        Self {
            run_id: Some(run_id),
            ..Self::default()
        }
    }

    pub fn for_channel(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(run_id) = self.run_id {
            if event.run_id != run_id {
                return false;
            }
        }
        if let Some(channel_id) = &self.channel_id {
            if event.channel_id.as_deref() != Some(channel_id.as_str()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind.name()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_wire_names() {
        let kind = EventKind::RunStatus {
            state: RunState::Running,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "run.status");
        assert_eq!(kind.name(), "run.status");
    }

    #[test]
    fn run_final_is_terminal() {
        let kind = EventKind::RunFinal {
            state: RunState::Done,
            content: Some("ok".into()),
            error: None,
            error_kind: None,
            stop_reason: None,
            usage: None,
        };
        assert!(kind.is_terminal());
        assert!(!EventKind::Token { text: "x".into() }.is_terminal());
    }

    #[test]
    fn event_serde_roundtrip() {
        let event = Event::new(
            Uuid::new_v4(),
            Some("ws-1".into()),
            EventKind::Token { text: "hi".into() },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, event.run_id);
        assert_eq!(back.channel_id.as_deref(), Some("ws-1"));
        assert!(matches!(back.kind, EventKind::Token { ref text } if text == "hi"));
    }

    #[test]
    fn filter_by_run() {
        let run_id = Uuid::new_v4();
        let event = Event::new(run_id, None, EventKind::Token { text: "x".into() });
        assert!(EventFilter::for_run(run_id).matches(&event));
        assert!(!EventFilter::for_run(Uuid::new_v4()).matches(&event));
    }

    #[test]
    fn filter_by_channel() {
        let event = Event::new(
            Uuid::new_v4(),
            Some("a".into()),
            EventKind::Token { text: "x".into() },
        );
        assert!(EventFilter::for_channel("a").matches(&event));
        assert!(!EventFilter::for_channel("b").matches(&event));
    }

    #[test]
    fn filter_by_kind() {
        let event = Event::new(Uuid::new_v4(), None, EventKind::Token { text: "x".into() });
        let filter = EventFilter {
            kinds: Some(vec!["token"]),
            ..EventFilter::default()
        };
        assert!(filter.matches(&event));
        let filter = EventFilter {
            kinds: Some(vec!["run.final"]),
            ..EventFilter::default()
        };
        assert!(!filter.matches(&event));
    }

    #[test]
    fn empty_filter_matches_all() {
        let event = Event::new(Uuid::new_v4(), None, EventKind::Token { text: "x".into() });
        assert!(EventFilter::default().matches(&event));
    }
}
